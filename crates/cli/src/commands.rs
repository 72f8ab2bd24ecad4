//! CLI commands, the control request each one sends and how its answer is printed

use anyhow::{anyhow, bail, Result};
use clap::Subcommand;
use serde_json::{Map, Value};

use sbc_sidecar_core::runtime_config::{ControlRequest, ControlResponse, DrainStatus, ServerStatusView};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Feature server drain management
    Fs {
        #[command(subcommand)]
        action: Option<FsAction>,
    },
    /// Set runtime config
    Set { key: Option<String>, value: Option<String> },
    /// Get runtime config
    Get { key: Option<String> },
    /// Show all runtime config
    List,
}

#[derive(Debug, Subcommand)]
pub enum FsAction {
    /// Drain server (remove from pool)
    Drain { server: Option<String> },
    /// Undrain server (add back to pool)
    Undrain { server: Option<String> },
    /// Show drained servers
    Drained,
    /// Show available servers
    Active,
    /// Show all servers with status
    List,
}

impl Command {
    /// Build the control request, checking required arguments first
    pub fn request(&self) -> Result<ControlRequest> {
        let request = match self {
            Command::Fs { action: None } => bail!("fs command requires an action"),
            Command::Fs { action: Some(action) } => match action {
                FsAction::Drain { server } => ControlRequest::FsDrain {
                    server: required(server, "drain requires server IP address")?,
                },
                FsAction::Undrain { server } => ControlRequest::FsUndrain {
                    server: required(server, "undrain requires server IP address")?,
                },
                FsAction::Drained => ControlRequest::FsDrained,
                FsAction::Active => ControlRequest::FsAvailable,
                FsAction::List => ControlRequest::FsList,
            },
            Command::Set { key, value } => match (key, value) {
                (Some(key), Some(value)) => ControlRequest::Set {
                    key: key.clone(),
                    value: Value::String(value.clone()),
                },
                _ => bail!("set requires key and value"),
            },
            Command::Get { key } => ControlRequest::Get {
                key: required(key, "get requires key")?,
            },
            Command::List => ControlRequest::List,
        };
        Ok(request)
    }

    /// Output lines for a response, or the error to report
    pub fn render(&self, response: &ControlResponse) -> Result<Vec<String>> {
        if !response.success {
            bail!("{}", response.error.as_deref().unwrap_or_else(|| self.failure()));
        }

        let lines = match self {
            Command::Fs { action: Some(action) } => match action {
                FsAction::Drain { .. } => drain_lines("Drained", response)?,
                FsAction::Undrain { .. } => drain_lines("Undrained", response)?,
                FsAction::Drained => {
                    let drained: Vec<String> = field(response, "drained")?;
                    if drained.is_empty() {
                        vec!["No servers are currently drained".to_string()]
                    } else {
                        listing("Drained servers:", drained.iter().map(|s| format!("🔴 {}", s)))
                    }
                }
                FsAction::Active => {
                    let available: Vec<String> = field(response, "available")?;
                    if available.is_empty() {
                        vec!["No active feature servers found".to_string()]
                    } else {
                        listing("Available feature servers:", available.iter().map(|s| format!("🟢 {}", s)))
                    }
                }
                FsAction::List => server_lines(response)?,
            },
            Command::Fs { action: None } => Vec::new(),
            Command::Set { .. } => {
                let key: String = field(response, "key")?;
                vec![format!("✓ {} = {}", key, json_text(response.fields.get("value")))]
            }
            Command::Get { .. } => {
                let key: String = field(response, "key")?;
                vec![format!("{} = {}", key, json_text(response.fields.get("value")))]
            }
            Command::List => {
                let config: Map<String, Value> = field(response, "config")?;
                let mut lines = vec!["Runtime Configuration:".to_string()];
                if config.is_empty() {
                    lines.push("  (no configuration set)".to_string());
                }
                for (key, value) in &config {
                    lines.push(format!("  {} = {}", key, json_text(Some(value))));
                }
                lines
            }
        };
        Ok(lines)
    }

    fn failure(&self) -> &'static str {
        match self {
            Command::Fs { action: Some(FsAction::Drain { .. }) } => "Failed to drain server",
            Command::Fs { action: Some(FsAction::Undrain { .. }) } => "Failed to undrain server",
            Command::Fs { action: Some(FsAction::Active) } => "Failed to get active servers",
            _ => "Command failed",
        }
    }
}

fn required(arg: &Option<String>, message: &str) -> Result<String> {
    arg.clone().ok_or_else(|| anyhow!("{}", message))
}

fn field<T: serde::de::DeserializeOwned>(response: &ControlResponse, name: &str) -> Result<T> {
    response
        .field(name)
        .ok_or_else(|| anyhow!("Invalid response from server"))
}

fn json_text(value: Option<&Value>) -> String {
    value.unwrap_or(&Value::Null).to_string()
}

fn listing(heading: &str, items: impl Iterator<Item = String>) -> Vec<String> {
    std::iter::once(heading.to_string())
        .chain(items.map(|item| format!("  {}", item)))
        .collect()
}

fn drain_lines(verb: &str, response: &ControlResponse) -> Result<Vec<String>> {
    let server: String = field(response, "server")?;
    let drained: Vec<String> = field(response, "drained")?;
    Ok(vec![
        format!("✓ {} {}", verb, server),
        format!("Drained servers: [{}]", drained.join(", ")),
    ])
}

fn server_lines(response: &ControlResponse) -> Result<Vec<String>> {
    let view: ServerStatusView = serde_json::from_value(Value::Object(response.fields.clone()))
        .map_err(|_| anyhow!("Invalid response from server"))?;

    if view.servers.is_empty() {
        let mut lines = vec!["No servers configured".to_string()];
        if !view.drained.is_empty() {
            lines.extend(listing(
                "Orphaned drained servers:",
                view.drained.iter().map(|s| format!("🔴 {} (orphaned)", s)),
            ));
        }
        return Ok(lines);
    }

    Ok(listing(
        "Feature servers:",
        view.servers.iter().map(|entry| match entry.status {
            DrainStatus::Drained => format!("🔴 {} (drained)", entry.server),
            DrainStatus::Active => format!("🟢 {} (active)", entry.server),
        }),
    ))
}
