//! Gateway blacklist
//!
//! A gateway that fails an OPTIONS ping is blacklisted for a while. The
//! entry is a TTL'd key per gateway; call routing outside this crate reads
//! it. Every operation here degrades instead of failing: a store error is
//! logged and reported as "not blacklisted".

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::store::{ClusterKeys, KeyValueStore};

#[derive(Clone)]
pub struct Blacklist {
    store: Arc<dyn KeyValueStore>,
    keys: ClusterKeys,
    ttl: Duration,
}

impl Blacklist {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: ClusterKeys, ttl: Duration) -> Self {
        Self { store, keys, ttl }
    }

    pub async fn add(&self, gateway_sid: &str) {
        let key = self.keys.blacklist(gateway_sid);
        match self.store.set(&key, "1", Some(self.ttl)).await {
            Ok(()) => info!(gateway_sid, "added gateway to blacklist for {:?}", self.ttl),
            Err(e) => error!(gateway_sid, "Error adding gateway to blacklist: {}", e),
        }
    }

    pub async fn remove(&self, gateway_sid: &str) {
        let key = self.keys.blacklist(gateway_sid);
        match self.store.delete(&key).await {
            Ok(()) => info!(gateway_sid, "removed gateway from blacklist"),
            Err(e) => error!(gateway_sid, "Error removing gateway from blacklist: {}", e),
        }
    }

    pub async fn is_blacklisted(&self, gateway_sid: &str) -> bool {
        let key = self.keys.blacklist(gateway_sid);
        match self.store.get(&key).await {
            Ok(value) => value.as_deref() == Some("1"),
            Err(e) => {
                error!(gateway_sid, "Error checking if gateway is blacklisted: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = Arc::new(MemoryStore::new());
        let blacklist = Blacklist::new(store.clone(), ClusterKeys::default(), Duration::from_secs(300));

        blacklist.add("gw-1").await;
        assert!(blacklist.is_blacklisted("gw-1").await);
        assert_eq!(store.get("blacklist-sip-gateway:gw-1").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!blacklist.is_blacklisted("gw-1").await);
    }

    #[tokio::test]
    async fn store_failure_reads_as_not_blacklisted() {
        let store = Arc::new(MemoryStore::new());
        let blacklist = Blacklist::new(store.clone(), ClusterKeys::default(), Duration::from_secs(300));
        blacklist.add("gw-1").await;

        store.set_available(false);
        assert!(!blacklist.is_blacklisted("gw-1").await);
    }
}
