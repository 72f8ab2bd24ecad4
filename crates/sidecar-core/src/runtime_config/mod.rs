//! Runtime configuration control plane
//!
//! [`RuntimeConfig`] is a single-consumer queue in front of an in-memory
//! key/value map. Callers submit operations from any task; one consumer
//! task runs them strictly in submission order, so concurrent control
//! clients never lose each other's array updates and a client always reads
//! its own writes.
//!
//! Operations that touch the shared store (draining feature servers) are
//! funnelled through the same queue with [`RuntimeConfig::run_serialized`],
//! which gives them a total order with the map operations.

mod feature_servers;
mod protocol;
#[cfg(unix)]
mod server;

use std::collections::BTreeMap;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::{Result, SidecarError};

pub use feature_servers::{DrainStatus, FeatureServerConfig, ServerStatus, ServerStatusView};
pub use protocol::{ControlHandler, ControlRequest, ControlResponse, RequestError, KNOWN_ACTIONS};
#[cfg(unix)]
pub use server::ControlServer;

/// A runtime configuration value
///
/// Values arriving over the control socket are plain strings; arrays are
/// built up with `add`/`remove`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Text(String),
    List(Vec<String>),
}

impl ConfigValue {
    /// Convert arbitrary JSON into a config value.
    ///
    /// Strings and arrays of scalars keep their shape; any other scalar is
    /// stored as its JSON text. Objects and nested arrays are rejected.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;

        fn scalar(value: &Value) -> Option<String> {
            match value {
                Value::String(s) => Some(s.clone()),
                Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
                _ => None,
            }
        }

        match value {
            Value::Array(items) => items.iter().map(scalar).collect::<Option<Vec<_>>>().map(ConfigValue::List),
            other => scalar(other).map(ConfigValue::Text),
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ConfigValue::List(items) => Some(items),
            ConfigValue::Text(_) => None,
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_string())
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(value: Vec<String>) -> Self {
        ConfigValue::List(value)
    }
}

/// The whole configuration map, as returned by `list`
pub type ConfigMap = BTreeMap<String, ConfigValue>;

/// Result of an `add` or `remove` on an array value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayUpdate {
    pub key: String,
    pub item: String,
    /// The array after the operation
    pub array: Vec<String>,
    /// Whether the operation changed the array
    pub changed: bool,
}

type MapOp = Box<dyn FnOnce(&mut ConfigMap) + Send>;

enum Job {
    Map(MapOp),
    Task(BoxFuture<'static, ()>),
}

/// Handle to the configuration queue; cheap to clone
#[derive(Clone)]
pub struct RuntimeConfig {
    jobs: mpsc::UnboundedSender<Job>,
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("closed", &self.jobs.is_closed())
            .finish()
    }
}

impl RuntimeConfig {
    /// Spawn the consumer task. It exits once every handle is dropped.
    pub fn spawn() -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            let mut map = ConfigMap::new();
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Map(op) => op(&mut map),
                    Job::Task(task) => task.await,
                }
            }
            debug!("runtime config queue drained, consumer exiting");
        });
        Self { jobs }
    }

    async fn with_map<R, F>(&self, op: F) -> Result<R>
    where
        F: FnOnce(&mut ConfigMap) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = Job::Map(Box::new(move |map| {
            let _ = tx.send(op(map));
        }));
        self.jobs.send(job).map_err(|_| SidecarError::QueueClosed)?;
        rx.await.map_err(|_| SidecarError::QueueClosed)
    }

    /// Run an arbitrary future in queue order.
    ///
    /// The future must not await another operation on this queue: the
    /// consumer is busy running it, so that operation would never start.
    pub async fn run_serialized<R, F>(&self, task: F) -> Result<R>
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = Job::Task(
            async move {
                let _ = tx.send(task.await);
            }
            .boxed(),
        );
        self.jobs.send(job).map_err(|_| SidecarError::QueueClosed)?;
        rx.await.map_err(|_| SidecarError::QueueClosed)
    }

    pub async fn set(&self, key: impl Into<String>, value: ConfigValue) -> Result<(String, ConfigValue)> {
        let key = key.into();
        self.with_map(move |map| {
            map.insert(key.clone(), value.clone());
            info!(key = %key, ?value, "Config updated");
            (key, value)
        })
        .await
    }

    pub async fn get(&self, key: impl Into<String>) -> Result<Option<ConfigValue>> {
        let key = key.into();
        self.with_map(move |map| map.get(&key).cloned()).await
    }

    /// Read a key, falling back to `default` when unset
    pub async fn get_or(&self, key: impl Into<String>, default: ConfigValue) -> Result<ConfigValue> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    /// Append `item` to the array at `key` unless already present
    pub async fn add_to_array(&self, key: impl Into<String>, item: impl Into<String>) -> Result<ArrayUpdate> {
        let key = key.into();
        let item = item.into();
        self.with_map(move |map| {
            let mut array = current_list(map, &key);
            let changed = !array.contains(&item);
            if changed {
                array.push(item.clone());
                map.insert(key.clone(), ConfigValue::List(array.clone()));
                info!(key = %key, item = %item, ?array, "Added to array");
            }
            ArrayUpdate {
                key,
                item,
                array,
                changed,
            }
        })
        .await
    }

    /// Remove every occurrence of `item` from the array at `key`
    pub async fn remove_from_array(&self, key: impl Into<String>, item: impl Into<String>) -> Result<ArrayUpdate> {
        let key = key.into();
        let item = item.into();
        self.with_map(move |map| {
            let mut array = current_list(map, &key);
            let before = array.len();
            array.retain(|existing| existing != &item);
            let changed = array.len() != before;
            if changed {
                map.insert(key.clone(), ConfigValue::List(array.clone()));
                info!(key = %key, item = %item, ?array, "Removed from array");
            }
            ArrayUpdate {
                key,
                item,
                array,
                changed,
            }
        })
        .await
    }

    pub async fn get_all(&self) -> Result<ConfigMap> {
        self.with_map(|map| map.clone()).await
    }
}

/// The array stored at `key`; a text value or a missing key reads as empty
fn current_list(map: &ConfigMap, key: &str) -> Vec<String> {
    map.get(key)
        .and_then(ConfigValue::as_list)
        .map(<[String]>::to_vec)
        .unwrap_or_default()
}
