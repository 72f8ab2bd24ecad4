//! Shared-store key layout

use crate::config::DEFAULT_CLUSTER_ID;

/// Produces the cluster-namespaced key names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterKeys {
    cluster_id: String,
}

impl ClusterKeys {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        let cluster_id = cluster_id.into();
        let cluster_id = if cluster_id.is_empty() {
            DEFAULT_CLUSTER_ID.to_string()
        } else {
            cluster_id
        };
        Self { cluster_id }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Feature servers currently checked in (`ip:port`)
    pub fn active_fs(&self) -> String {
        format!("{}:active-fs", self.cluster_id)
    }

    /// Feature servers administratively drained (`ip`)
    pub fn drained_fs(&self) -> String {
        format!("{}:drained-fs", self.cluster_id)
    }

    /// RTP servers currently checked in (`ip`)
    pub fn active_rtp(&self) -> String {
        format!("{}:active-rtp", self.cluster_id)
    }

    /// Service URLs advertised by feature servers
    pub fn fs_service_url(&self) -> String {
        format!("{}:fs-service-url", self.cluster_id)
    }

    /// Leadership key for the registration orchestrator
    pub fn regbot_token(&self) -> String {
        format!("{}:regbot-token", self.cluster_id)
    }

    /// AORs with a live registrar binding
    pub fn registered_users(&self) -> String {
        format!("{}:registered-users", self.cluster_id)
    }

    /// Blacklist entry for a gateway; read by call routing outside this crate
    pub fn blacklist(&self, gateway_sid: &str) -> String {
        format!("blacklist-sip-gateway:{}", gateway_sid)
    }

    /// Ephemeral inbound gateway hash for a source IP, one field per carrier
    pub fn ephemeral_gateway(&self, ip: &str) -> String {
        format!("eph-gw-ip:{}", ip)
    }

    /// Registrar binding for an AOR
    pub fn registration(&self, aor: &str) -> String {
        format!("user:{}", aor)
    }
}

impl Default for ClusterKeys {
    fn default() -> Self {
        Self::new(DEFAULT_CLUSTER_ID)
    }
}
