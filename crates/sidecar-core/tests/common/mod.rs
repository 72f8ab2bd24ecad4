//! Shared fakes for the sidecar integration tests
//!
//! Each collaborator trait gets an in-process stand-in that records what
//! it was asked to do, so tests can assert on the traffic as well as on
//! the resulting store and directory state.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use sbc_sidecar_core::directory::{Carrier, Gateway, MemoryDirectory, TrunkType};
use sbc_sidecar_core::dns::DnsResolver;
use sbc_sidecar_core::error::{Result, SidecarError};
use sbc_sidecar_core::sip::{OutboundRequest, SipClient, SipResponse};
use sbc_sidecar_core::store::{ClusterKeys, MemoryStore};
use sbc_sidecar_core::telemetry::{Alert, AlertKind, AlertWriter, StatsSink};
use sbc_sidecar_core::Services;

/// What the fake SIP stack does with the next request
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(SipResponse),
    /// No response, e.g. a transaction timeout
    Fail(String),
    /// Never answer
    Hang,
}

impl Scripted {
    pub fn status(status: u16) -> Self {
        let reason = match status {
            200 => "OK",
            403 => "Forbidden",
            404 => "Not Found",
            503 => "Service Unavailable",
            _ => "Other",
        };
        Scripted::Reply(SipResponse::new(status, reason))
    }
}

/// SIP client that answers from a script and records every request
pub struct ScriptedSipClient {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Mutex<Scripted>,
    sent: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedSipClient {
    /// Answers 200 once the script runs out
    pub fn new() -> Self {
        Self::with_fallback(Scripted::status(200))
    }

    pub fn with_fallback(fallback: Scripted) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, next: Scripted) {
        self.script.lock().push_back(next);
    }

    pub fn set_fallback(&self, fallback: Scripted) {
        *self.fallback.lock() = fallback;
    }

    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl SipClient for ScriptedSipClient {
    async fn request(&self, request: OutboundRequest) -> Result<SipResponse> {
        self.sent.lock().push(request);
        let next = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone());
        match next {
            Scripted::Reply(response) => Ok(response),
            Scripted::Fail(message) => Err(SidecarError::sip(message)),
            Scripted::Hang => std::future::pending().await,
        }
    }
}

/// Collects alerts instead of writing them anywhere
#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub fn all(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn of_kind(&self, kind: AlertKind) -> Vec<Alert> {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AlertWriter for RecordingAlerts {
    async fn write_alert(&self, alert: Alert) -> Result<()> {
        self.alerts.lock().push(alert);
        Ok(())
    }
}

/// Keeps the last value of every gauge
#[derive(Default)]
pub struct RecordingStats {
    gauges: Mutex<HashMap<String, f64>>,
}

impl RecordingStats {
    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges.lock().get(name).copied()
    }
}

impl StatsSink for RecordingStats {
    fn gauge(&self, name: &str, value: f64, _tags: &[&str]) {
        self.gauges.lock().insert(name.to_string(), value);
    }

    fn increment(&self, _name: &str, _tags: &[&str]) {}

    fn histogram(&self, _name: &str, _value: f64, _tags: &[&str]) {}
}

/// Resolver with fixed answers; unknown names resolve to nothing
#[derive(Default)]
pub struct StaticDns {
    a: Mutex<HashMap<String, Vec<String>>>,
    srv: Mutex<HashMap<String, Vec<String>>>,
}

impl StaticDns {
    pub fn add_a(&self, host: &str, addresses: &[&str]) {
        self.a
            .lock()
            .insert(host.to_string(), addresses.iter().map(|a| a.to_string()).collect());
    }

    pub fn add_srv(&self, name: &str, addresses: &[&str]) {
        self.srv
            .lock()
            .insert(name.to_string(), addresses.iter().map(|a| a.to_string()).collect());
    }
}

#[async_trait]
impl DnsResolver for StaticDns {
    async fn resolve_a(&self, host: &str) -> Vec<String> {
        self.a.lock().get(host).cloned().unwrap_or_default()
    }

    async fn resolve_srv(&self, name: &str) -> Vec<String> {
        self.srv.lock().get(name).cloned().unwrap_or_default()
    }
}

/// Every fake, kept concrete so tests can drive and inspect them
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub directory: Arc<MemoryDirectory>,
    pub sip: Arc<ScriptedSipClient>,
    pub dns: Arc<StaticDns>,
    pub alerts: Arc<RecordingAlerts>,
    pub stats: Arc<RecordingStats>,
    pub keys: ClusterKeys,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            directory: Arc::new(MemoryDirectory::new()),
            sip: Arc::new(ScriptedSipClient::new()),
            dns: Arc::new(StaticDns::default()),
            alerts: Arc::new(RecordingAlerts::default()),
            stats: Arc::new(RecordingStats::default()),
            keys: ClusterKeys::new("test"),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            store: self.store.clone(),
            directory: self.directory.clone(),
            sip: self.sip.clone(),
            dns: self.dns.clone(),
            alerts: self.alerts.clone(),
            stats: self.stats.clone(),
            keys: self.keys.clone(),
        }
    }
}

/// An active carrier that registers as `user` with `sip.carrier.net`
pub fn register_carrier(sid: &str, user: &str, password: &str) -> Carrier {
    Carrier {
        voip_carrier_sid: sid.into(),
        name: format!("carrier-{}", sid),
        account_sid: Some("acct-1".into()),
        service_provider_sid: Some("sp-1".into()),
        requires_register: true,
        is_active: true,
        register_username: Some(user.into()),
        register_password: Some(password.into()),
        register_sip_realm: Some("sip.carrier.net".into()),
        trunk_type: TrunkType::Static,
        ..Default::default()
    }
}

/// An active outbound UDP gateway
pub fn outbound_gateway(sid: &str, carrier_sid: &str, ipv4: &str) -> Gateway {
    Gateway {
        sip_gateway_sid: sid.into(),
        voip_carrier_sid: carrier_sid.into(),
        ipv4: ipv4.into(),
        port: Some(5060),
        protocol: "udp".into(),
        outbound: true,
        is_active: true,
        send_options_ping: false,
        use_sips_scheme: false,
    }
}
