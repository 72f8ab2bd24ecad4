//! Feature-server draining
//!
//! Draining takes a feature server out of the traffic-eligible pool while
//! it keeps checking in. The drained set lives in the shared store, so every
//! SBC in the cluster enforces it. Queries never fail: a store error is
//! logged and reads as an empty list or `false`.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::RuntimeConfig;
use crate::error::{Result, SidecarError};
use crate::sip::is_valid_ip;
use crate::store::{ClusterKeys, KeyValueStore};

/// Whether a checked-in server takes traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainStatus {
    Active,
    Drained,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server: String,
    pub status: DrainStatus,
}

/// Every active server with its drain status, plus the raw drained list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatusView {
    pub servers: Vec<ServerStatus>,
    pub drained: Vec<String>,
}

#[derive(Clone)]
pub struct FeatureServerConfig {
    store: Arc<dyn KeyValueStore>,
    keys: ClusterKeys,
    queue: RuntimeConfig,
}

impl FeatureServerConfig {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: ClusterKeys, queue: RuntimeConfig) -> Self {
        Self { store, keys, queue }
    }

    pub fn is_valid_ip(ip: &str) -> bool {
        is_valid_ip(ip)
    }

    /// Add `ip` to the drained set; returns the drained list afterwards
    pub async fn drain_server(&self, ip: &str) -> Result<Vec<String>> {
        if !is_valid_ip(ip) {
            return Err(SidecarError::InvalidIp(ip.to_string()));
        }
        let store = self.store.clone();
        let set = self.keys.drained_fs();
        let member = ip.to_string();
        let drained = self
            .queue
            .run_serialized(async move {
                store.add_to_set(&set, &member).await?;
                store.retrieve_set(&set).await
            })
            .await??;
        info!(server = ip, "drained feature server");
        Ok(sorted(drained))
    }

    /// Remove `ip` from the drained set; returns the drained list afterwards
    pub async fn undrain_server(&self, ip: &str) -> Result<Vec<String>> {
        if !is_valid_ip(ip) {
            return Err(SidecarError::InvalidIp(ip.to_string()));
        }
        let store = self.store.clone();
        let set = self.keys.drained_fs();
        let member = ip.to_string();
        let drained = self
            .queue
            .run_serialized(async move {
                store.remove_from_set(&set, &member).await?;
                store.retrieve_set(&set).await
            })
            .await??;
        info!(server = ip, "undrained feature server");
        Ok(sorted(drained))
    }

    pub async fn is_drained(&self, ip: &str) -> bool {
        match self.store.is_member_of_set(&self.keys.drained_fs(), ip).await {
            Ok(drained) => drained,
            Err(e) => {
                error!(server = ip, "Error checking drained status: {}", e);
                false
            }
        }
    }

    pub async fn drained_servers(&self) -> Vec<String> {
        self.read_set(&self.keys.drained_fs()).await
    }

    pub async fn active_servers(&self) -> Vec<String> {
        self.read_set(&self.keys.active_fs()).await
    }

    /// Active servers that are not drained
    pub async fn available_servers(&self) -> Vec<String> {
        let (active, drained) = tokio::join!(self.active_servers(), self.drained_servers());
        let drained: HashSet<String> = drained.into_iter().collect();
        active.into_iter().filter(|s| !drained.contains(s)).collect()
    }

    pub async fn all_servers_with_status(&self) -> ServerStatusView {
        let (active, drained) = tokio::join!(self.active_servers(), self.drained_servers());
        let drained_set: HashSet<&str> = drained.iter().map(String::as_str).collect();
        let servers = active
            .into_iter()
            .map(|server| {
                let status = if drained_set.contains(server.as_str()) {
                    DrainStatus::Drained
                } else {
                    DrainStatus::Active
                };
                ServerStatus { server, status }
            })
            .collect();
        ServerStatusView { servers, drained }
    }

    async fn read_set(&self, set: &str) -> Vec<String> {
        match self.store.retrieve_set(set).await {
            Ok(members) => sorted(members),
            Err(e) => {
                error!(set, "Error reading server set: {}", e);
                Vec::new()
            }
        }
    }
}

fn sorted(mut members: Vec<String>) -> Vec<String> {
    members.sort();
    members
}
