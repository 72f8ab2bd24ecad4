//! Outbound trunk registration
//!
//! A [`Regbot`] keeps one carrier credential registered with one trunk
//! gateway. Each bot runs as its own tokio task:
//!
//! ```text
//!   none ──REGISTER──► registered ──(expires / 2)──► REGISTER ──► ...
//!          │
//!          ├─ non-200 ──► fail ──(30 s)──► REGISTER
//!          ├─ remove code ──► carrier disabled, bot stops for good
//!          └─ no response ──► fail ──(60 s)──► REGISTER
//! ```
//!
//! Both the in-flight request and the wait before the next attempt race
//! against the bot's cancellation token, so a stopped bot never schedules
//! another attempt. Ephemeral gateways created for registration trunks are
//! released when the task winds down.
//!
//! The [`RegbotOrchestrator`] decides which bots exist: it holds cluster
//! leadership and reconciles the bot set against the carrier directory.

mod ephemeral;
mod expires;
mod leader;
mod orchestrator;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RegbotSettings;
use crate::directory::{RegisterStatusRecord, TrunkType};
use crate::dns::srv_name;
use crate::error::{Result, SidecarError};
use crate::services::Services;
use crate::sip::{
    is_valid_domain_or_ip, DigestCredentials, OutboundRequest, SipMessage, SipMethod, SipResponse, Transport,
};
use crate::telemetry::{Alert, AlertKind};

pub use ephemeral::EphemeralGateways;
pub use expires::{effective_expires, refresh_delay};
pub use leader::{LeaderAction, Leadership, LeadershipToken, TokenState};
pub use orchestrator::{dedupe_targets, OrchestratorMonitor, OrchestratorStats, RegbotOrchestrator, RegistrationTarget};

/// Retry delay after a non-200 final response
pub const RETRY_AFTER_FAILURE: Duration = Duration::from_secs(30);

/// Retry delay when no response was received at all
pub const RETRY_AFTER_ERROR: Duration = Duration::from_secs(60);

/// Registration state of a bot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegbotStatus {
    None,
    Registered,
    Fail,
}

/// Public signalling addresses of this SBC, per transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicAddresses {
    /// `host[:port]` advertised for UDP, and the fallback for every other transport
    pub udp: String,
    pub by_transport: HashMap<Transport, String>,
}

impl PublicAddresses {
    pub fn new(udp: impl Into<String>) -> Self {
        Self {
            udp: udp.into(),
            by_transport: HashMap::new(),
        }
    }

    pub fn with(mut self, transport: Transport, address: impl Into<String>) -> Self {
        self.by_transport.insert(transport, address.into());
        self
    }

    /// Address to advertise for `transport`
    pub fn for_transport(&self, transport: Transport) -> &str {
        if transport == Transport::Udp {
            return &self.udp;
        }
        self.by_transport
            .get(&transport)
            .map(String::as_str)
            .unwrap_or(&self.udp)
    }
}

/// Everything a bot needs besides its own credentials
#[derive(Clone)]
pub struct RegbotContext {
    pub services: Services,
    pub settings: RegbotSettings,
    pub addresses: PublicAddresses,
}

impl RegbotContext {
    pub fn new(services: Services, settings: RegbotSettings, addresses: PublicAddresses) -> Self {
        Self {
            services,
            settings,
            addresses,
        }
    }

    fn ephemeral(&self) -> EphemeralGateways {
        EphemeralGateways::new(self.services.store.clone(), self.services.keys.clone())
    }
}

/// Construction input of a bot, joined from a gateway and its carrier
#[derive(Debug, Clone, Default)]
pub struct RegbotOptions {
    pub voip_carrier_sid: String,
    pub ipv4: String,
    pub port: Option<u16>,
    pub protocol: String,
    pub username: String,
    pub password: String,
    pub sip_realm: Option<String>,
    pub from_user: Option<String>,
    pub from_domain: Option<String>,
    pub use_public_ip_in_contact: bool,
    pub use_sips_scheme: bool,
    pub outbound_sip_proxy: Option<String>,
    /// SIP realm of the carrier's owning account
    pub account_sip_realm: Option<String>,
    pub trunk_type: TrunkType,
}

/// Serializable view of a bot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegbotSnapshot {
    pub voip_carrier_sid: String,
    pub username: String,
    pub from_user: String,
    pub sip_realm: String,
    pub ipv4: String,
    pub port: Option<u16>,
    pub aor: String,
    pub status: RegbotStatus,
}

/// One outbound registration relationship
pub struct Regbot {
    voip_carrier_sid: String,
    ipv4: String,
    port: Option<u16>,
    transport: Transport,
    username: String,
    password: String,
    sip_realm: String,
    from_user: String,
    from: String,
    aor: String,
    use_public_ip_in_contact: bool,
    use_sips_scheme: bool,
    outbound_sip_proxy: Option<String>,
    account_sip_realm: Option<String>,
    trunk_type: TrunkType,
    status: Mutex<RegbotStatus>,
    ephemeral_addresses: Mutex<Vec<String>>,
}

impl std::fmt::Debug for Regbot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Regbot")
            .field("voip_carrier_sid", &self.voip_carrier_sid)
            .field("aor", &self.aor)
            .field("ipv4", &self.ipv4)
            .field("port", &self.port)
            .field("status", &*self.status.lock())
            .finish_non_exhaustive()
    }
}

/// Outcome of one registration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Try again after this delay
    Reschedule(Duration),
    /// The registrar rejected the credential permanently
    Disabled,
}

impl Regbot {
    /// Build a bot. Fails when the from-domain or realm is not a hostname or IP.
    pub fn new(opts: RegbotOptions, settings: &RegbotSettings) -> Result<Self> {
        let sip_realm = opts
            .sip_realm
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| opts.ipv4.clone());
        let from_user = opts
            .from_user
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| opts.username.clone());
        let from_domain = opts
            .from_domain
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| sip_realm.clone());

        if !is_valid_domain_or_ip(&from_domain) {
            return Err(SidecarError::InvalidDomain(from_domain));
        }
        if !is_valid_domain_or_ip(&sip_realm) {
            return Err(SidecarError::InvalidDomain(sip_realm));
        }

        Ok(Self {
            from: format!("sip:{}@{}", from_user, from_domain),
            aor: format!("{}@{}", from_user, sip_realm),
            voip_carrier_sid: opts.voip_carrier_sid,
            ipv4: opts.ipv4,
            port: opts.port,
            transport: Transport::from_protocol(&opts.protocol),
            username: opts.username,
            password: opts.password,
            sip_realm,
            from_user,
            use_public_ip_in_contact: opts.use_public_ip_in_contact || settings.contact_use_ip,
            use_sips_scheme: opts.use_sips_scheme,
            outbound_sip_proxy: opts.outbound_sip_proxy.filter(|p| !p.is_empty()),
            account_sip_realm: opts.account_sip_realm.filter(|r| !r.is_empty()),
            trunk_type: opts.trunk_type,
            status: Mutex::new(RegbotStatus::None),
            ephemeral_addresses: Mutex::new(Vec::new()),
        })
    }

    pub fn aor(&self) -> &str {
        &self.aor
    }

    pub fn carrier_sid(&self) -> &str {
        &self.voip_carrier_sid
    }

    pub fn status(&self) -> RegbotStatus {
        *self.status.lock()
    }

    /// IPs currently published as ephemeral gateways by this bot
    pub fn ephemeral_addresses(&self) -> Vec<String> {
        self.ephemeral_addresses.lock().clone()
    }

    pub fn snapshot(&self) -> RegbotSnapshot {
        RegbotSnapshot {
            voip_carrier_sid: self.voip_carrier_sid.clone(),
            username: self.username.clone(),
            from_user: self.from_user.clone(),
            sip_realm: self.sip_realm.clone(),
            ipv4: self.ipv4.clone(),
            port: self.port,
            aor: self.aor.clone(),
            status: self.status(),
        }
    }

    fn set_status(&self, status: RegbotStatus) {
        *self.status.lock() = status;
    }

    /// The REGISTER this bot sends
    pub fn build_request(&self, ctx: &RegbotContext) -> OutboundRequest {
        let transport = self.transport;
        let scheme = if transport == Transport::Tls && self.use_sips_scheme {
            "sips"
        } else {
            "sip"
        };

        let contact_address = if self.use_public_ip_in_contact {
            format!("{}@{}", self.from_user, ctx.addresses.for_transport(transport))
        } else if let Some(realm) = &self.account_sip_realm {
            format!("{}@{}", self.from_user, realm)
        } else if let Some(domain) = &ctx.settings.local_sip_domain {
            format!("{}@{}", self.from_user, domain)
        } else {
            self.aor.clone()
        };

        let proxy = match &self.outbound_sip_proxy {
            Some(proxy) => format!("sip:{};transport={}", proxy, transport),
            None => match self.port {
                Some(port) => format!("sip:{}:{};transport={}", self.ipv4, port, transport),
                None => format!("sip:{};transport={}", self.ipv4, transport),
            },
        };

        let expires = ctx.settings.default_expires;
        let mut request = OutboundRequest::new(SipMethod::Register, format!("{}:{}", scheme, self.sip_realm));
        request.proxy = Some(proxy);
        request.headers.push("From", self.from.clone());
        request.headers.push("To", self.from.clone());
        request.headers.push(
            "Contact",
            format!("<{}:{};transport={}>;expires={}", scheme, contact_address, transport, expires),
        );
        request.headers.push("Expires", expires.to_string());
        request.headers.push("User-Agent", ctx.settings.user_agent.clone());
        request.auth = Some(DigestCredentials {
            username: self.username.clone(),
            password: self.password.clone(),
        });
        request
    }

    /// Send one REGISTER and act on the outcome
    pub async fn register_once(&self, ctx: &RegbotContext) -> AttemptOutcome {
        debug!(aor = %self.aor, "sending REGISTER");
        let request = self.build_request(ctx);

        match ctx.services.sip.request(request).await {
            Err(e) => {
                error!(aor = %self.aor, "Error registering to {}:{}: {}", self.ipv4, self.port_display(), e);
                self.set_status(RegbotStatus::Fail);
                self.write_status(ctx, RegisterStatusRecord::failure(e.to_string())).await;
                AttemptOutcome::Reschedule(RETRY_AFTER_ERROR)
            }
            Ok(response) if response.status != 200 => self.on_rejected(ctx, &response).await,
            Ok(response) => self.on_registered(ctx, &response).await,
        }
    }

    async fn on_rejected(&self, ctx: &RegbotContext, response: &SipResponse) -> AttemptOutcome {
        self.set_status(RegbotStatus::Fail);
        info!(
            aor = %self.aor,
            "got {} registering to {}:{}",
            response.status,
            self.ipv4,
            self.port_display()
        );
        self.write_status(ctx, self.record_for(response, 0)).await;

        if ctx.settings.remove_codes.contains(&response.status) {
            self.disable_carrier(ctx).await;
            return AttemptOutcome::Disabled;
        }
        AttemptOutcome::Reschedule(RETRY_AFTER_FAILURE)
    }

    async fn on_registered(&self, ctx: &RegbotContext, response: &SipResponse) -> AttemptOutcome {
        self.set_status(RegbotStatus::Registered);
        let expires = effective_expires(response, ctx.settings.default_expires, ctx.settings.min_expires);
        debug!(aor = %self.aor, "registered, next REGISTER in {} seconds", f64::from(expires) / 2.0);
        self.write_status(ctx, self.record_for(response, expires)).await;

        if self.trunk_type == TrunkType::Reg {
            self.publish_ephemeral_gateways(ctx, expires).await;
        }
        AttemptOutcome::Reschedule(refresh_delay(expires))
    }

    fn record_for(&self, response: &SipResponse, expires: u32) -> RegisterStatusRecord {
        RegisterStatusRecord::from_response(
            response.status,
            &response.reason,
            response.header("CSeq").map(str::to_string),
            response.header("Call-ID").map(str::to_string),
            expires,
        )
    }

    async fn write_status(&self, ctx: &RegbotContext, record: RegisterStatusRecord) {
        if let Err(e) = ctx
            .services
            .directory
            .update_register_status(&self.voip_carrier_sid, &record)
            .await
        {
            warn!(carrier_sid = %self.voip_carrier_sid, "Failed to write register status: {}", e);
        }
    }

    async fn disable_carrier(&self, ctx: &RegbotContext) {
        let directory = &ctx.services.directory;
        if let Err(e) = directory.disable_carrier_registration(&self.voip_carrier_sid).await {
            error!(carrier_sid = %self.voip_carrier_sid, "Failed to disable carrier registration: {}", e);
        }

        match directory.lookup_carrier_by_sid(&self.voip_carrier_sid).await {
            Ok(Some(carrier)) => {
                let message = format!(
                    "Disabling Outbound Registration for carrier {} (sid:{})",
                    carrier.name, carrier.voip_carrier_sid
                );
                info!("{}", message);
                let alert = Alert::new(AlertKind::RegistrationDisabled, message)
                    .for_owner(carrier.account_sid, carrier.service_provider_sid);
                if let Err(e) = ctx.services.alerts.write_alert(alert).await {
                    warn!("Failed to write alert: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(carrier_sid = %self.voip_carrier_sid, "Failed to look up carrier: {}", e),
        }
    }

    /// Resolve the realm and allow inbound traffic from every address found
    async fn publish_ephemeral_gateways(&self, ctx: &RegbotContext, expires: u32) {
        let host = self
            .sip_realm
            .split(':')
            .next()
            .unwrap_or(self.sip_realm.as_str());
        let addresses = match self.port {
            Some(_) => ctx.services.dns.resolve_a(host).await,
            None => {
                ctx.services
                    .dns
                    .resolve_srv(&srv_name(host, self.transport))
                    .await
            }
        };

        {
            let mut published = self.ephemeral_addresses.lock();
            for ip in &addresses {
                if !published.contains(ip) {
                    published.push(ip.clone());
                }
            }
        }
        if addresses.is_empty() {
            return;
        }

        let ephemeral = ctx.ephemeral();
        for ip in &addresses {
            if let Err(e) = ephemeral.create(ip, &self.voip_carrier_sid, expires).await {
                error!(ip = %ip, "Error creating ephemeral gateway: {}", e);
            }
        }
        debug!(
            ?addresses,
            "Created ephemeral gateways for registration trunk {}, {}", self.voip_carrier_sid, self.sip_realm
        );
    }

    /// Delete every ephemeral gateway this bot published; failures are logged
    pub async fn release_ephemeral_gateways(&self, ctx: &RegbotContext) {
        let addresses: Vec<String> = std::mem::take(&mut *self.ephemeral_addresses.lock());
        let ephemeral = ctx.ephemeral();
        for ip in addresses {
            if let Err(e) = ephemeral.release(&ip, &self.voip_carrier_sid).await {
                error!(ip = %ip, "Error deleting ephemeral gateway on regbot stop: {}", e);
            }
        }
    }

    fn port_display(&self) -> String {
        self.port.map(|p| p.to_string()).unwrap_or_default()
    }

    /// Spawn the registration loop
    pub fn start(self: Arc<Self>, ctx: Arc<RegbotContext>) -> RegbotHandle {
        info!(aor = %self.aor, "starting regbot");
        let cancel = CancellationToken::new();
        let bot = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { bot.run(ctx, token).await });
        RegbotHandle {
            bot: self,
            cancel,
            task,
        }
    }

    async fn run(&self, ctx: Arc<RegbotContext>, cancel: CancellationToken) {
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.register_once(&ctx) => outcome,
            };

            let delay = match outcome {
                AttemptOutcome::Reschedule(delay) => delay,
                AttemptOutcome::Disabled => {
                    info!(aor = %self.aor, "regbot disabled, not retrying");
                    break;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.release_ephemeral_gateways(&ctx).await;
        debug!(aor = %self.aor, "regbot stopped");
    }
}

/// A running bot
pub struct RegbotHandle {
    bot: Arc<Regbot>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RegbotHandle {
    pub fn bot(&self) -> &Arc<Regbot> {
        &self.bot
    }

    pub fn snapshot(&self) -> RegbotSnapshot {
        self.bot.snapshot()
    }

    /// True once the loop has exited (stopped or disabled)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop to stop without waiting
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the loop and wait for its ephemeral gateways to be released
    pub async fn stop_and_wait(self) {
        info!(aor = %self.bot.aor, "stopping regbot");
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(aor = %self.bot.aor, "regbot task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> RegbotOptions {
        RegbotOptions {
            voip_carrier_sid: "c1".into(),
            ipv4: "10.0.0.1".into(),
            port: Some(5060),
            protocol: "udp".into(),
            username: "alice".into(),
            password: "secret".into(),
            sip_realm: Some("sip.carrier.net".into()),
            ..Default::default()
        }
    }

    #[test]
    fn valid_domains_build_a_bot() {
        let settings = RegbotSettings::default();
        for domain in ["10.0.0.1", "10.0.0.1:5060", "sip.carrier.net", "sip.carrier.net:5080"] {
            let opts = RegbotOptions {
                from_domain: Some(domain.into()),
                ..options()
            };
            assert!(Regbot::new(opts, &settings).is_ok(), "{} should be accepted", domain);
        }
    }

    #[test]
    fn invalid_from_domain_is_rejected() {
        let opts = RegbotOptions {
            from_domain: Some("bad domain!".into()),
            ..options()
        };
        let err = Regbot::new(opts, &RegbotSettings::default()).unwrap_err();
        assert_eq!(err.to_string(), "Invalid from_domain bad domain!");
    }

    #[test]
    fn invalid_realm_is_rejected() {
        let opts = RegbotOptions {
            sip_realm: Some("sip:carrier.net".into()),
            ..options()
        };
        assert!(matches!(
            Regbot::new(opts, &RegbotSettings::default()),
            Err(SidecarError::InvalidDomain(_))
        ));
    }

    #[test]
    fn realm_and_from_user_fall_back() {
        let opts = RegbotOptions {
            sip_realm: None,
            ..options()
        };
        let bot = Regbot::new(opts, &RegbotSettings::default()).unwrap();
        assert_eq!(bot.aor(), "alice@10.0.0.1");
        assert_eq!(bot.status(), RegbotStatus::None);
    }

    #[test]
    fn public_address_falls_back_to_udp() {
        let addresses = PublicAddresses::new("203.0.113.5:5060").with(Transport::Wss, "203.0.113.5:8443");
        assert_eq!(addresses.for_transport(Transport::Tls), "203.0.113.5:5060");
        assert_eq!(addresses.for_transport(Transport::Wss), "203.0.113.5:8443");
    }
}
