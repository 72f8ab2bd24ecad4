//! Registrar of endpoint bindings
//!
//! Bindings created by inbound REGISTER are stored per AOR with the granted
//! expiry. [`StoreRegistrar`] keeps them in the shared store so any SBC in
//! the cluster can route to a registered user.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{ClusterKeys, KeyValueStore};

/// Where and how to reach a registered endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationBinding {
    /// URI from the endpoint's Contact header
    pub contact: String,
    /// SBC `host:port` the REGISTER arrived on
    pub sbc_address: String,
    pub private_sbc_address: Option<String>,
    /// Transport from the top Via (`udp`, `tcp`, `ws`, `wss`)
    pub protocol: Option<String>,
    /// `sip:<source ip>:<source port>`
    pub proxy: String,
    pub call_hook: Option<String>,
    pub call_status_hook: Option<String>,
    #[serde(rename = "allow_direct_app_calling")]
    pub allow_direct_app_calling: bool,
    #[serde(rename = "allow_direct_queue_calling")]
    pub allow_direct_queue_calling: bool,
    #[serde(rename = "allow_direct_user_calling")]
    pub allow_direct_user_calling: bool,
}

#[async_trait]
pub trait Registrar: Send + Sync {
    /// Store or refresh a binding for `expires` seconds
    async fn add(&self, aor: &str, binding: &RegistrationBinding, expires: u32) -> Result<()>;

    /// Drop a binding; returns whether one existed
    async fn remove(&self, aor: &str) -> Result<bool>;

    /// Number of AORs with a live binding
    async fn count_users(&self) -> Result<usize>;
}

/// Bindings as TTL'd JSON values in the shared store
pub struct StoreRegistrar {
    store: Arc<dyn KeyValueStore>,
    keys: ClusterKeys,
}

impl StoreRegistrar {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: ClusterKeys) -> Self {
        Self { store, keys }
    }

    /// Read back a binding
    pub async fn binding(&self, aor: &str) -> Result<Option<RegistrationBinding>> {
        match self.store.get(&self.keys.registration(aor)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Registrar for StoreRegistrar {
    async fn add(&self, aor: &str, binding: &RegistrationBinding, expires: u32) -> Result<()> {
        let value = serde_json::to_string(binding)?;
        let ttl = Duration::from_secs(u64::from(expires.max(1)));
        self.store.set(&self.keys.registration(aor), &value, Some(ttl)).await?;
        self.store.add_to_set(&self.keys.registered_users(), aor).await?;
        debug!(aor, expires, "stored registration");
        Ok(())
    }

    async fn remove(&self, aor: &str) -> Result<bool> {
        let key = self.keys.registration(aor);
        let existed = self.store.get(&key).await?.is_some();
        self.store.delete(&key).await?;
        let was_member = self.store.remove_from_set(&self.keys.registered_users(), aor).await?;
        Ok(existed || was_member)
    }

    async fn count_users(&self) -> Result<usize> {
        let set = self.keys.registered_users();
        let mut count = 0;
        for aor in self.store.retrieve_set(&set).await? {
            if self.store.get(&self.keys.registration(&aor)).await?.is_some() {
                count += 1;
            } else if let Err(e) = self.store.remove_from_set(&set, &aor).await {
                warn!(aor = %aor, "failed to prune expired registration: {}", e);
            }
        }
        Ok(count)
    }
}

/// In-process registrar
#[derive(Default)]
pub struct MemoryRegistrar {
    bindings: DashMap<String, (RegistrationBinding, u32, Instant)>,
}

impl MemoryRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binding(&self, aor: &str) -> Option<RegistrationBinding> {
        self.live(aor).map(|(binding, _)| binding)
    }

    /// Expiry the binding was stored with
    pub fn granted_expires(&self, aor: &str) -> Option<u32> {
        self.live(aor).map(|(_, expires)| expires)
    }

    fn live(&self, aor: &str) -> Option<(RegistrationBinding, u32)> {
        let entry = self.bindings.get(aor)?;
        let (binding, expires, deadline) = entry.value();
        (Instant::now() < *deadline).then(|| (binding.clone(), *expires))
    }
}

#[async_trait]
impl Registrar for MemoryRegistrar {
    async fn add(&self, aor: &str, binding: &RegistrationBinding, expires: u32) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(u64::from(expires));
        self.bindings
            .insert(aor.to_string(), (binding.clone(), expires, deadline));
        Ok(())
    }

    async fn remove(&self, aor: &str) -> Result<bool> {
        Ok(self.bindings.remove(aor).is_some())
    }

    async fn count_users(&self) -> Result<usize> {
        let now = Instant::now();
        self.bindings.retain(|_, (_, _, deadline)| now < *deadline);
        Ok(self.bindings.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn binding() -> RegistrationBinding {
        RegistrationBinding {
            contact: "sip:alice@192.168.1.20:5060".into(),
            sbc_address: "203.0.113.5:5060".into(),
            proxy: "sip:198.51.100.7:40312".into(),
            protocol: Some("udp".into()),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn store_registrar_expires_and_prunes_users() {
        let store = Arc::new(MemoryStore::new());
        let registrar = StoreRegistrar::new(store.clone(), ClusterKeys::default());

        registrar.add("alice@example.com", &binding(), 60).await.unwrap();
        registrar.add("bob@example.com", &binding(), 3600).await.unwrap();
        assert_eq!(registrar.count_users().await.unwrap(), 2);
        assert_eq!(registrar.binding("alice@example.com").await.unwrap(), Some(binding()));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registrar.count_users().await.unwrap(), 1);
        assert_eq!(
            store.retrieve_set("default:registered-users").await.unwrap(),
            vec!["bob@example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn remove_reports_whether_a_binding_existed() {
        let registrar = StoreRegistrar::new(Arc::new(MemoryStore::new()), ClusterKeys::default());
        registrar.add("alice@example.com", &binding(), 60).await.unwrap();

        assert!(registrar.remove("alice@example.com").await.unwrap());
        assert!(!registrar.remove("alice@example.com").await.unwrap());
        assert_eq!(registrar.count_users().await.unwrap(), 0);
    }

    #[test]
    fn binding_serializes_with_stored_field_names() {
        let json = serde_json::to_value(binding()).unwrap();
        assert_eq!(json["sbcAddress"], "203.0.113.5:5060");
        assert_eq!(json["allow_direct_app_calling"], false);
        assert!(json.get("privateSbcAddress").is_some());
    }
}
