//! Control socket wire protocol
//!
//! One JSON object per line in each direction. Requests carry an `action`
//! plus its fields; responses always carry `success` and either an `error`
//! string or the action's result fields.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, warn};

use super::{ConfigValue, FeatureServerConfig, RuntimeConfig};
use crate::error::SidecarError;

/// Every action the control socket understands
pub const KNOWN_ACTIONS: &[&str] = &[
    "set",
    "get",
    "add",
    "remove",
    "list",
    "fs-drain",
    "fs-undrain",
    "fs-drained",
    "fs-list",
    "fs-available",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ControlRequest {
    Set { key: String, value: Value },
    Get { key: String },
    Add { key: String, item: String },
    Remove { key: String, item: String },
    List,
    FsDrain { server: String },
    FsUndrain { server: String },
    FsDrained,
    FsList,
    FsAvailable,
}

/// Why a request line was refused before dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Unknown action")]
    UnknownAction,
    #[error("Invalid command")]
    Invalid,
}

impl ControlRequest {
    /// Parse one request line.
    ///
    /// Malformed JSON or missing fields are `Invalid`; a well-formed object
    /// whose `action` is absent or not recognised is `UnknownAction`.
    pub fn parse(line: &str) -> Result<Self, RequestError> {
        let value: Value = serde_json::from_str(line).map_err(|_| RequestError::Invalid)?;
        let Some(object) = value.as_object() else {
            return Err(RequestError::Invalid);
        };
        match object.get("action").and_then(Value::as_str) {
            Some(action) if KNOWN_ACTIONS.contains(&action) => {}
            _ => return Err(RequestError::UnknownAction),
        }
        serde_json::from_value(value).map_err(|_| RequestError::Invalid)
    }

    pub fn action(&self) -> &'static str {
        match self {
            ControlRequest::Set { .. } => "set",
            ControlRequest::Get { .. } => "get",
            ControlRequest::Add { .. } => "add",
            ControlRequest::Remove { .. } => "remove",
            ControlRequest::List => "list",
            ControlRequest::FsDrain { .. } => "fs-drain",
            ControlRequest::FsUndrain { .. } => "fs-undrain",
            ControlRequest::FsDrained => "fs-drained",
            ControlRequest::FsList => "fs-list",
            ControlRequest::FsAvailable => "fs-available",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ControlResponse {
    /// Successful response; `fields` should be a JSON object
    pub fn ok(fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            success: true,
            error: None,
            fields,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            fields: Map::new(),
        }
    }

    /// Typed read of a result field
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.fields
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Serialized response line, without the trailing newline
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"success":false,"error":"Internal error"}"#.to_string())
    }
}

/// Executes control requests against the runtime config and drain set
#[derive(Clone)]
pub struct ControlHandler {
    config: RuntimeConfig,
    servers: FeatureServerConfig,
}

impl ControlHandler {
    pub fn new(config: RuntimeConfig, servers: FeatureServerConfig) -> Self {
        Self { config, servers }
    }

    pub async fn handle_line(&self, line: &str) -> ControlResponse {
        match ControlRequest::parse(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!(command = line, "Command error: {}", e);
                ControlResponse::error(e.to_string())
            }
        }
    }

    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        let action = request.action();
        let result = match request {
            ControlRequest::Set { key, value } => match ConfigValue::from_json(&value) {
                Some(value) => self
                    .config
                    .set(key, value)
                    .await
                    .map(|(key, value)| json!({ "key": key, "value": value })),
                None => return ControlResponse::error(RequestError::Invalid.to_string()),
            },
            ControlRequest::Get { key } => self
                .config
                .get(key.clone())
                .await
                .map(|value| json!({ "key": key, "value": value })),
            ControlRequest::Add { key, item } => self.config.add_to_array(key, item).await.map(|u| {
                json!({ "key": u.key, "item": u.item, "array": u.array, "added": u.changed })
            }),
            ControlRequest::Remove { key, item } => self.config.remove_from_array(key, item).await.map(|u| {
                json!({ "key": u.key, "item": u.item, "array": u.array, "removed": u.changed })
            }),
            ControlRequest::List => self.config.get_all().await.map(|config| json!({ "config": config })),
            ControlRequest::FsDrain { server } => {
                return match self.servers.drain_server(&server).await {
                    Ok(drained) => ControlResponse::ok(json!({
                        "action": "drain",
                        "server": server,
                        "drained": drained,
                    })),
                    Err(e) => drain_failure(e, "Failed to drain server"),
                };
            }
            ControlRequest::FsUndrain { server } => {
                return match self.servers.undrain_server(&server).await {
                    Ok(drained) => ControlResponse::ok(json!({
                        "action": "undrain",
                        "server": server,
                        "drained": drained,
                    })),
                    Err(e) => drain_failure(e, "Failed to undrain server"),
                };
            }
            ControlRequest::FsDrained => {
                return ControlResponse::ok(json!({ "drained": self.servers.drained_servers().await }));
            }
            ControlRequest::FsList => {
                let view = self.servers.all_servers_with_status().await;
                return ControlResponse::ok(serde_json::to_value(view).unwrap_or_default());
            }
            ControlRequest::FsAvailable => {
                return ControlResponse::ok(json!({ "available": self.servers.available_servers().await }));
            }
        };

        match result {
            Ok(fields) => ControlResponse::ok(fields),
            Err(e) => {
                error!(action, "Command error: {}", e);
                ControlResponse::error(RequestError::Invalid.to_string())
            }
        }
    }
}

fn drain_failure(err: SidecarError, fallback: &str) -> ControlResponse {
    if err.is_validation() {
        return ControlResponse::error(err.to_string());
    }
    error!("{}: {}", fallback, err);
    ControlResponse::error(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn actions_parse_into_variants() {
        assert_eq!(
            ControlRequest::parse(r#"{"action":"fs-drain","server":"10.0.0.1"}"#),
            Ok(ControlRequest::FsDrain {
                server: "10.0.0.1".into()
            })
        );
        assert_eq!(ControlRequest::parse(r#"{"action":"list"}"#), Ok(ControlRequest::List));
        assert_eq!(
            ControlRequest::parse(r#"{"action":"set","key":"k","value":"v"}"#),
            Ok(ControlRequest::Set {
                key: "k".into(),
                value: json!("v")
            })
        );
    }

    #[test]
    fn unknown_and_malformed_requests_are_told_apart() {
        assert_eq!(ControlRequest::parse(r#"{"action":"reboot"}"#), Err(RequestError::UnknownAction));
        assert_eq!(ControlRequest::parse(r#"{"key":"k"}"#), Err(RequestError::UnknownAction));
        assert_eq!(ControlRequest::parse("not json"), Err(RequestError::Invalid));
        assert_eq!(ControlRequest::parse(r#"{"action":"get"}"#), Err(RequestError::Invalid));
        assert_eq!(ControlRequest::parse("[1,2]"), Err(RequestError::Invalid));
    }

    #[test]
    fn responses_flatten_fields_next_to_success() {
        let line = ControlResponse::ok(json!({ "drained": ["10.0.0.1"] })).to_line();
        assert_eq!(line, r#"{"success":true,"drained":["10.0.0.1"]}"#);

        let line = ControlResponse::error("Unknown action").to_line();
        assert_eq!(line, r#"{"success":false,"error":"Unknown action"}"#);

        let parsed: ControlResponse = serde_json::from_str(r#"{"success":true,"available":["a"]}"#).unwrap();
        assert_eq!(parsed.field::<Vec<String>>("available"), Some(vec!["a".to_string()]));
        assert_eq!(parsed.error, None);
    }
}
