//! Stats and alerting seams
//!
//! The stats emitter and the alert/time-series writer live outside this
//! crate. Components only see these two traits; the defaults write to the
//! tracing subscriber so a bare deployment still leaves a trail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;

/// Metric emitter
pub trait StatsSink: Send + Sync {
    /// Set a gauge to an absolute value
    fn gauge(&self, name: &str, value: f64, tags: &[&str]);

    /// Increment a counter by one
    fn increment(&self, name: &str, tags: &[&str]);

    /// Record a histogram sample
    fn histogram(&self, name: &str, value: f64, tags: &[&str]);
}

/// Emits metrics as debug-level tracing events
#[derive(Debug, Default, Clone)]
pub struct TracingStats;

impl StatsSink for TracingStats {
    fn gauge(&self, name: &str, value: f64, tags: &[&str]) {
        debug!(metric = name, value, ?tags, "gauge");
    }

    fn increment(&self, name: &str, tags: &[&str]) {
        debug!(metric = name, ?tags, "increment");
    }

    fn histogram(&self, name: &str, value: f64, tags: &[&str]) {
        debug!(metric = name, value, ?tags, "histogram");
    }
}

/// Discards every metric
#[derive(Debug, Default, Clone)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn gauge(&self, _name: &str, _value: f64, _tags: &[&str]) {}
    fn increment(&self, _name: &str, _tags: &[&str]) {}
    fn histogram(&self, _name: &str, _value: f64, _tags: &[&str]) {}
}

/// What an alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A carrier's outbound registration was disabled after a terminal rejection
    RegistrationDisabled,
    /// A gateway failed an OPTIONS ping and was blacklisted
    OptionsPingFailed,
    /// OPTIONS pinging was disabled for a gateway after a terminal response
    OptionsPingDisabled,
    /// The sidecar is shutting down
    SystemDown,
}

/// Alert routed to the owning account / service provider
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub account_sid: Option<String>,
    pub service_provider_sid: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            account_sid: None,
            service_provider_sid: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the owner so the alert shows up in the right portal
    pub fn for_owner(mut self, account_sid: Option<String>, service_provider_sid: Option<String>) -> Self {
        self.account_sid = account_sid;
        self.service_provider_sid = service_provider_sid;
        self
    }
}

/// Alert writer
#[async_trait]
pub trait AlertWriter: Send + Sync {
    async fn write_alert(&self, alert: Alert) -> Result<()>;
}

/// Logs alerts at warn level
#[derive(Debug, Default, Clone)]
pub struct LogAlertWriter;

#[async_trait]
impl AlertWriter for LogAlertWriter {
    async fn write_alert(&self, alert: Alert) -> Result<()> {
        warn!(
            kind = ?alert.kind,
            account_sid = alert.account_sid.as_deref().unwrap_or("-"),
            "ALERT: {}",
            alert.message
        );
        Ok(())
    }
}
