//! Outbound OPTIONS health checks of SIP gateways
//!
//! One [`OptionsBot`] per gateway pings it every interval. A failed ping
//! blacklists the gateway and raises an alert; a response code listed in
//! `OPTIONS_RESPONSE_REMOVE` also turns pinging off for that gateway in
//! the directory. A successful ping lifts the blacklist.

mod blacklist;
mod fleet;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OptionsPingSettings;
use crate::directory::Gateway;
use crate::services::Services;
use crate::sip::{is_ipv4_literal, OutboundRequest, SipMethod, Transport};
use crate::telemetry::{Alert, AlertKind};

pub use blacklist::Blacklist;
pub use fleet::OptionsPingFleet;

/// Everything a ping bot needs
#[derive(Clone)]
pub struct OptionsContext {
    pub services: Services,
    pub settings: OptionsPingSettings,
    pub blacklist: Blacklist,
}

impl OptionsContext {
    pub fn new(services: Services, settings: OptionsPingSettings) -> Self {
        let blacklist = Blacklist::new(
            services.store.clone(),
            services.keys.clone(),
            settings.blacklist_ttl,
        );
        Self {
            services,
            settings,
            blacklist,
        }
    }
}

/// Result of one ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Healthy,
    /// Final response other than 200
    Rejected(u16),
    /// No response at all
    Unreachable,
    /// Rejected with a remove code; pinging is now off for this gateway
    Disabled(u16),
}

/// Health-check relationship with one gateway
#[derive(Debug, Clone)]
pub struct OptionsBot {
    gateway: Gateway,
    uri: String,
    proxy: String,
}

impl OptionsBot {
    pub fn new(gateway: Gateway) -> Self {
        let transport = Transport::from_protocol(&gateway.protocol);
        let use_sips = gateway.protocol.to_ascii_lowercase().contains("tls") && gateway.use_sips_scheme;

        let proxy = match gateway.port {
            Some(port) if is_ipv4_literal(&gateway.ipv4) => {
                format!("sip:{}:{};transport={}", gateway.ipv4, port, transport)
            }
            _ => format!("sip:{};transport={}", gateway.ipv4, transport),
        };
        let uri = match gateway.port {
            Some(port) if !use_sips => format!("sip:{}:{}", gateway.ipv4, port),
            _ if use_sips => format!("sips:{}", gateway.ipv4),
            _ => format!("sip:{}", gateway.ipv4),
        };

        Self { gateway, uri, proxy }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// `ip[:port];transport=proto`, as shown in alerts
    fn target_display(&self) -> String {
        match self.gateway.port {
            Some(port) => format!("{}:{};transport={}", self.gateway.ipv4, port, self.gateway.protocol),
            None => format!("{};transport={}", self.gateway.ipv4, self.gateway.protocol),
        }
    }

    /// Send one OPTIONS and update the blacklist accordingly
    pub async fn ping_once(&self, ctx: &OptionsContext) -> PingOutcome {
        let mut request = OutboundRequest::new(SipMethod::Options, self.uri.clone());
        request.proxy = Some(self.proxy.clone());
        let gateway_sid = self.gateway.sip_gateway_sid.as_str();

        match ctx.services.sip.request(request).await {
            Ok(response) if response.status == 200 => {
                if ctx.blacklist.is_blacklisted(gateway_sid).await {
                    ctx.blacklist.remove(gateway_sid).await;
                }
                PingOutcome::Healthy
            }
            Ok(response) => {
                info!(gateway_sid, "Received Options response {} for {}", response.status, self.uri);
                self.blacklist_and_alert(ctx, format!("received: {}", response.status))
                    .await;

                if ctx.settings.remove_codes.contains(&response.status) {
                    self.disable(ctx).await;
                    return PingOutcome::Disabled(response.status);
                }
                PingOutcome::Rejected(response.status)
            }
            Err(e) => {
                error!(gateway_sid, "Error Options ping to {}: {}", self.uri, e);
                self.blacklist_and_alert(ctx, format!("error: {}", e)).await;
                PingOutcome::Unreachable
            }
        }
    }

    async fn blacklist_and_alert(&self, ctx: &OptionsContext, detail: String) {
        let gateway_sid = self.gateway.sip_gateway_sid.as_str();
        if ctx.blacklist.is_blacklisted(gateway_sid).await {
            return;
        }
        ctx.blacklist.add(gateway_sid).await;

        let message = format!("Options ping {} unsuccessfully, {}", self.target_display(), detail);
        self.alert_owner(ctx, AlertKind::OptionsPingFailed, message).await;
    }

    async fn disable(&self, ctx: &OptionsContext) {
        let gateway_sid = self.gateway.sip_gateway_sid.as_str();
        if let Err(e) = ctx.services.directory.disable_gateway_options_ping(gateway_sid).await {
            error!(gateway_sid, "Failed to disable options ping: {}", e);
        }
        let carrier_name = match ctx
            .services
            .directory
            .lookup_carrier_by_sid(&self.gateway.voip_carrier_sid)
            .await
        {
            Ok(Some(carrier)) => carrier.name,
            _ => String::new(),
        };
        let message = format!(
            "Disabling Options ping for {} in carrier {} (sid:{})",
            self.gateway.ipv4, carrier_name, self.gateway.voip_carrier_sid
        );
        info!("{}", message);
        self.alert_owner(ctx, AlertKind::OptionsPingDisabled, message).await;
    }

    /// Alert the carrier's owner; no alert when the carrier is gone
    async fn alert_owner(&self, ctx: &OptionsContext, kind: AlertKind, message: String) {
        let carrier = match ctx
            .services
            .directory
            .lookup_carrier_by_sid(&self.gateway.voip_carrier_sid)
            .await
        {
            Ok(Some(carrier)) => carrier,
            Ok(None) => return,
            Err(e) => {
                warn!(carrier_sid = %self.gateway.voip_carrier_sid, "Failed to look up carrier: {}", e);
                return;
            }
        };
        let alert = Alert::new(kind, message).for_owner(carrier.account_sid, carrier.service_provider_sid);
        if let Err(e) = ctx.services.alerts.write_alert(alert).await {
            warn!("Failed to write alert: {}", e);
        }
    }

    /// Spawn the ping loop
    pub fn start(self, ctx: Arc<OptionsContext>) -> OptionsBotHandle {
        info!("starting options bot {}", self.uri);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let uri = self.uri.clone();
        let task = tokio::spawn(async move { self.run(ctx, token).await });
        OptionsBotHandle { uri, cancel, task }
    }

    async fn run(self, ctx: Arc<OptionsContext>, cancel: CancellationToken) {
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.ping_once(&ctx) => outcome,
            };
            if let PingOutcome::Disabled(status) = outcome {
                info!("options bot {} disabled after {}", self.uri, status);
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(ctx.settings.interval) => {}
            }
        }
        debug!("options bot {} stopped", self.uri);
    }
}

/// A running ping bot
pub struct OptionsBotHandle {
    uri: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl OptionsBotHandle {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn stop_and_wait(self) {
        info!("stopping options bot {}", self.uri);
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("options bot task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(ipv4: &str, port: Option<u16>, protocol: &str, use_sips_scheme: bool) -> Gateway {
        Gateway {
            sip_gateway_sid: "gw-1".into(),
            voip_carrier_sid: "c1".into(),
            ipv4: ipv4.into(),
            port,
            protocol: protocol.into(),
            outbound: true,
            is_active: true,
            send_options_ping: true,
            use_sips_scheme,
        }
    }

    #[test]
    fn ip_gateway_gets_port_in_uri_and_proxy() {
        let bot = OptionsBot::new(gateway("10.0.0.1", Some(5060), "udp", false));
        assert_eq!(bot.uri(), "sip:10.0.0.1:5060");
        assert_eq!(bot.proxy(), "sip:10.0.0.1:5060;transport=udp");
    }

    #[test]
    fn hostname_proxy_omits_port() {
        let bot = OptionsBot::new(gateway("sip.carrier.net", Some(5060), "tcp", false));
        assert_eq!(bot.uri(), "sip:sip.carrier.net:5060");
        assert_eq!(bot.proxy(), "sip:sip.carrier.net;transport=tcp");
    }

    #[test]
    fn sips_uri_drops_port() {
        let bot = OptionsBot::new(gateway("10.0.0.1", Some(5061), "tls/srtp", true));
        assert_eq!(bot.uri(), "sips:10.0.0.1");
        assert_eq!(bot.proxy(), "sip:10.0.0.1:5061;transport=tls");
    }
}
