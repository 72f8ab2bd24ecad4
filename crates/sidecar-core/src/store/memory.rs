//! In-process store

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::KeyValueStore;
use crate::error::{Result, SidecarError};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(BTreeSet<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Key-value store held in process memory
///
/// TTLs are measured on tokio's clock, so tests running with a paused
/// runtime can advance time past an expiry deterministically.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store becoming unreachable (every call fails) or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remaining TTL of a key, if it has one
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entry = self.entries.get(key)?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Read one field of a hash
    pub fn hash_get(&self, key: &str, field: &str) -> Option<String> {
        self.purge_if_expired(key);
        match &self.entries.get(key)?.value {
            Value::Hash(fields) => fields.get(field).cloned(),
            _ => None,
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SidecarError::store("store unavailable"))
        }
    }

    fn purge_if_expired(&self, key: &str) {
        self.entries.remove_if(key, |_, entry| entry.is_expired());
    }

    fn wrong_type(key: &str) -> SidecarError {
        SidecarError::store(format!(
            "WRONGTYPE operation against key {} holding the wrong kind of value",
            key
        ))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        self.purge_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Text(text) => Ok(Some(text.clone())),
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check_available()?;
        self.entries
            .insert(key.to_string(), Entry::new(Value::Text(value.to_string()), ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        self.purge_if_expired(key);
        let mut written = false;
        self.entries.entry(key.to_string()).or_insert_with(|| {
            written = true;
            Entry::new(Value::Text(value.to_string()), Some(ttl))
        });
        Ok(written)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn add_to_set(&self, set: &str, member: &str) -> Result<bool> {
        self.check_available()?;
        self.purge_if_expired(set);
        let mut entry = self
            .entries
            .entry(set.to_string())
            .or_insert_with(|| Entry::new(Value::Set(BTreeSet::new()), None));
        match &mut entry.value {
            Value::Set(members) => Ok(members.insert(member.to_string())),
            _ => Err(Self::wrong_type(set)),
        }
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<bool> {
        self.check_available()?;
        self.purge_if_expired(set);
        let removed = match self.entries.get_mut(set) {
            Some(mut entry) => match &mut entry.value {
                Value::Set(members) => members.remove(member),
                _ => return Err(Self::wrong_type(set)),
            },
            None => false,
        };
        // an empty set does not exist
        self.entries
            .remove_if(set, |_, entry| matches!(&entry.value, Value::Set(m) if m.is_empty()));
        Ok(removed)
    }

    async fn is_member_of_set(&self, set: &str, member: &str) -> Result<bool> {
        self.check_available()?;
        self.purge_if_expired(set);
        match self.entries.get(set) {
            Some(entry) => match &entry.value {
                Value::Set(members) => Ok(members.contains(member)),
                _ => Err(Self::wrong_type(set)),
            },
            None => Ok(false),
        }
    }

    async fn retrieve_set(&self, set: &str) -> Result<Vec<String>> {
        self.check_available()?;
        self.purge_if_expired(set);
        match self.entries.get(set) {
            Some(entry) => match &entry.value {
                Value::Set(members) => Ok(members.iter().cloned().collect()),
                _ => Err(Self::wrong_type(set)),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str, key_ttl: Duration) -> Result<()> {
        self.check_available()?;
        self.purge_if_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new()), None));
        match &mut entry.value {
            Value::Hash(fields) => {
                fields.insert(field.to_string(), value.to_string());
            }
            _ => return Err(Self::wrong_type(key)),
        }
        entry.expires_at = Some(Instant::now() + key_ttl);
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        self.check_available()?;
        self.purge_if_expired(key);
        if let Some(mut entry) = self.entries.get_mut(key) {
            match &mut entry.value {
                Value::Hash(fields) => {
                    fields.remove(field);
                }
                _ => return Err(Self::wrong_type(key)),
            }
        }
        self.entries
            .remove_if(key, |_, entry| matches!(&entry.value, Value::Hash(f) if f.is_empty()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_nx_respects_existing_key_until_it_expires() {
        let store = MemoryStore::new();
        assert!(store.set_nx("token", "a", Duration::from_secs(70)).await.unwrap());
        assert!(!store.set_nx("token", "b", Duration::from_secs(70)).await.unwrap());
        assert_eq!(store.get("token").await.unwrap().as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(71)).await;
        assert_eq!(store.get("token").await.unwrap(), None);
        assert!(store.set_nx("token", "b", Duration::from_secs(70)).await.unwrap());
    }

    #[tokio::test]
    async fn set_membership_reports_changes() {
        let store = MemoryStore::new();
        assert!(store.add_to_set("s", "10.0.0.1").await.unwrap());
        assert!(!store.add_to_set("s", "10.0.0.1").await.unwrap());
        assert!(store.is_member_of_set("s", "10.0.0.1").await.unwrap());
        assert!(store.remove_from_set("s", "10.0.0.1").await.unwrap());
        assert!(!store.remove_from_set("s", "10.0.0.1").await.unwrap());
        assert!(store.retrieve_set("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hash_fields_share_one_ttl() {
        let store = MemoryStore::new();
        store.hash_set("h", "c1", "100", Duration::from_secs(7200)).await.unwrap();
        store.hash_set("h", "c2", "200", Duration::from_secs(7200)).await.unwrap();
        assert_eq!(store.hash_get("h", "c1").as_deref(), Some("100"));

        store.hash_delete("h", "c1").await.unwrap();
        assert_eq!(store.hash_get("h", "c1"), None);
        assert_eq!(store.hash_get("h", "c2").as_deref(), Some("200"));
        assert!(store.ttl("h").is_some());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(store.get("k").await.is_err());
        assert!(store.retrieve_set("s").await.is_err());
        store.set_available(true);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mixing_types_is_an_error() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(store.add_to_set("k", "m").await.is_err());
    }
}
