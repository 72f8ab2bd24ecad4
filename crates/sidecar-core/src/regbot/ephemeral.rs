//! Ephemeral inbound gateways for registration trunks

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::error::Result;
use crate::store::{ClusterKeys, KeyValueStore};

/// Conservative lifetime of the per-IP hash; each carrier field carries its own expiry
const EPHEMERAL_KEY_TTL: Duration = Duration::from_secs(7200);

/// Writes and releases `eph-gw-ip:<ip>` entries
#[derive(Clone)]
pub struct EphemeralGateways {
    store: Arc<dyn KeyValueStore>,
    keys: ClusterKeys,
}

impl EphemeralGateways {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: ClusterKeys) -> Self {
        Self { store, keys }
    }

    /// Allow inbound traffic from `ip` on behalf of `carrier_sid` for `ttl_secs`
    pub async fn create(&self, ip: &str, carrier_sid: &str, ttl_secs: u32) -> Result<()> {
        let key = self.keys.ephemeral_gateway(ip);
        let expires_at = Utc::now().timestamp() + i64::from(ttl_secs);
        self.store
            .hash_set(&key, carrier_sid, &expires_at.to_string(), EPHEMERAL_KEY_TTL)
            .await?;
        debug!(carrier_sid, ip, ttl_secs, "created {}", key);
        Ok(())
    }

    pub async fn release(&self, ip: &str, carrier_sid: &str) -> Result<()> {
        let key = self.keys.ephemeral_gateway(ip);
        self.store.hash_delete(&key, carrier_sid).await?;
        debug!(carrier_sid, ip, "released {}", key);
        Ok(())
    }
}
