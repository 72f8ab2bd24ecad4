//! Process wiring
//!
//! [`Sidecar`] builds every component from one [`SidecarConfig`] and a
//! [`Services`] bundle, spawns the background tasks, and tears them down
//! on shutdown. The SIP stack embedding the sidecar routes inbound OPTIONS
//! to [`Sidecar::presence`] and authorized REGISTERs to
//! [`Sidecar::register_handler`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SidecarConfig;
use crate::directory::SbcAddress;
use crate::error::{Result, SidecarError};
use crate::logging::{setup_logging, LoggingConfig};
use crate::options_ping::{OptionsContext, OptionsPingFleet};
use crate::presence::PresenceTracker;
use crate::regbot::{OrchestratorMonitor, PublicAddresses, RegbotContext, RegbotOrchestrator};
use crate::register::InboundRegistrationHandler;
use crate::registrar::Registrar;
use crate::runtime_config::{FeatureServerConfig, RuntimeConfig};
use crate::services::Services;
use crate::sip::Transport;
use crate::telemetry::{Alert, AlertKind};

/// How often the registered-user gauge is published
pub const USER_COUNT_INTERVAL: Duration = Duration::from_secs(30);

/// Group `transport/ip:port` listen addresses by IP.
///
/// Entries that do not parse, or name a transport other than udp, tls or
/// wss, are skipped. Addresses without a udp port get port 5060.
pub fn parse_hostports(hostports: &str) -> Vec<SbcAddress> {
    let mut addresses: Vec<SbcAddress> = Vec::new();
    for entry in hostports.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((transport, hostport)) = entry.split_once('/') else {
            continue;
        };
        let Some((ip, port)) = hostport.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };

        let index = match addresses.iter().position(|a| a.ipv4 == ip) {
            Some(index) => index,
            None => {
                addresses.push(SbcAddress {
                    ipv4: ip.to_string(),
                    port: 5060,
                    tls_port: None,
                    wss_port: None,
                });
                addresses.len() - 1
            }
        };
        let address = &mut addresses[index];
        match transport.to_ascii_lowercase().as_str() {
            "udp" => address.port = port,
            "tls" => address.tls_port = Some(port),
            "wss" => address.wss_port = Some(port),
            _ => {}
        }
    }
    addresses
}

/// Public addresses advertised in regbot Contact headers
pub fn public_addresses(addresses: &[SbcAddress]) -> PublicAddresses {
    let Some(first) = addresses.first() else {
        return PublicAddresses::default();
    };
    let mut public = PublicAddresses::new(format!("{}:{}", first.ipv4, first.port));
    if let Some(port) = first.tls_port {
        public = public.with(Transport::Tls, format!("{}:{}", first.ipv4, port));
    }
    if let Some(port) = first.wss_port {
        public = public.with(Transport::Wss, format!("{}:{}", first.ipv4, port));
    }
    public
}

pub struct Sidecar {
    config: SidecarConfig,
    services: Services,
    registrar: Arc<dyn Registrar>,
    runtime_config: RuntimeConfig,
    feature_servers: FeatureServerConfig,
    presence: Arc<PresenceTracker>,
    register_handler: Arc<InboundRegistrationHandler>,
    sbc_addresses: Vec<SbcAddress>,
    monitor: Option<OrchestratorMonitor>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl Sidecar {
    /// Build every component. Must be called inside a tokio runtime.
    pub fn new(config: SidecarConfig, services: Services, registrar: Arc<dyn Registrar>) -> Self {
        let runtime_config = RuntimeConfig::spawn();
        let feature_servers = FeatureServerConfig::new(
            services.store.clone(),
            services.keys.clone(),
            runtime_config.clone(),
        );
        let presence = Arc::new(PresenceTracker::new(
            services.store.clone(),
            &services.keys,
            services.stats.clone(),
            feature_servers.clone(),
            config.presence.clone(),
        ));
        let register_handler = Arc::new(InboundRegistrationHandler::new(registrar.clone(), config.nat_expires));

        Self {
            config,
            services,
            registrar,
            runtime_config,
            feature_servers,
            presence,
            register_handler,
            sbc_addresses: Vec::new(),
            monitor: None,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Connect to Redis and MySQL and build the production services
    #[cfg(all(feature = "redis", feature = "mysql"))]
    pub async fn connect(config: SidecarConfig, sip: Arc<dyn crate::sip::SipClient>) -> Result<Self> {
        use crate::directory::MySqlDirectory;
        use crate::dns::HickoryResolver;
        use crate::registrar::StoreRegistrar;
        use crate::store::{ClusterKeys, RedisStore};
        use crate::telemetry::{LogAlertWriter, TracingStats};

        let mysql = config
            .mysql
            .clone()
            .ok_or_else(|| SidecarError::config("MySQL connection settings are required"))?;
        let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
        let directory = Arc::new(MySqlDirectory::connect(&mysql).await?);
        let keys = ClusterKeys::new(config.cluster_id.clone());

        let services = Services {
            store: store.clone(),
            directory,
            sip,
            dns: Arc::new(HickoryResolver::from_system_conf()?),
            alerts: Arc::new(LogAlertWriter),
            stats: Arc::new(TracingStats),
            keys: keys.clone(),
        };
        let registrar = Arc::new(StoreRegistrar::new(store, keys));
        Ok(Self::new(config, services, registrar))
    }

    /// Addresses this SBC listens on; announced to the directory and used
    /// for regbot Contact headers
    pub fn with_sbc_addresses(mut self, addresses: Vec<SbcAddress>) -> Self {
        self.sbc_addresses = addresses;
        self
    }

    /// Private signalling address stored in registrar bindings
    pub fn with_private_sbc_address(mut self, address: impl Into<String>) -> Self {
        let handler = InboundRegistrationHandler::new(self.registrar.clone(), self.config.nat_expires)
            .with_private_sbc_address(address);
        self.register_handler = Arc::new(handler);
        self
    }

    pub fn presence(&self) -> Arc<PresenceTracker> {
        self.presence.clone()
    }

    pub fn register_handler(&self) -> Arc<InboundRegistrationHandler> {
        self.register_handler.clone()
    }

    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.runtime_config
    }

    pub fn feature_servers(&self) -> &FeatureServerConfig {
        &self.feature_servers
    }

    /// Observer of the regbot orchestrator, once started
    pub fn monitor(&self) -> Option<OrchestratorMonitor> {
        self.monitor.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `task` alongside the built-in workers. It must return only once
    /// the cancellation token fires; returning earlier, or panicking, is
    /// treated as fatal by [`Sidecar::run_until`].
    pub fn spawn_worker<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Spawn every background task
    pub async fn start(&mut self) -> Result<()> {
        self.config.validate()?;

        self.presence.init().await;
        let sweeper = self.presence.clone().run_sweeper(self.cancel.child_token());
        self.tasks.spawn(sweeper);

        #[cfg(unix)]
        {
            use crate::runtime_config::{ControlHandler, ControlServer};

            let handler = ControlHandler::new(self.runtime_config.clone(), self.feature_servers.clone());
            let server = ControlServer::bind(&self.config.socket_path, handler)?;
            self.tasks.spawn(server.run(self.cancel.child_token()));
        }

        let ctx = RegbotContext::new(
            self.services.clone(),
            self.config.regbot.clone(),
            public_addresses(&self.sbc_addresses),
        );
        let fleet = OptionsPingFleet::new(OptionsContext::new(self.services.clone(), self.config.options.clone()));
        let orchestrator = RegbotOrchestrator::new(ctx).with_options_fleet(fleet);
        self.monitor = Some(orchestrator.monitor());
        self.tasks.spawn(orchestrator.run(self.cancel.child_token()));

        self.tasks.spawn(keep_sbc_addresses_alive(
            self.services.clone(),
            self.sbc_addresses.clone(),
            self.config.sbc_address_keepalive,
            self.cancel.child_token(),
        ));
        self.tasks.spawn(publish_user_count(
            self.registrar.clone(),
            self.services.clone(),
            self.cancel.child_token(),
        ));

        info!(cluster_id = %self.services.keys.cluster_id(), "sidecar started");
        Ok(())
    }

    /// Raise the system-down alert, then stop every task.
    ///
    /// The alert write and the task drain are each bounded by `shutdown_grace`.
    pub async fn shutdown(self) {
        self.stop("sbc-sip-sidecar is shutting down".to_string()).await;
    }

    async fn stop(mut self, message: String) {
        let grace = self.config.shutdown_grace;
        let alert = Alert::new(AlertKind::SystemDown, message);
        match tokio::time::timeout(grace, self.services.alerts.write_alert(alert)).await {
            Ok(Ok(())) => debug!("system-down alert written"),
            Ok(Err(e)) => error!("Error writing system-down alert: {}", e),
            Err(_) => warn!("timed out writing system-down alert"),
        }

        self.cancel.cancel();
        let drain = async { while self.tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("background tasks did not stop within {:?}", grace);
            self.tasks.abort_all();
        }
        info!("sidecar stopped");
    }

    /// First background task to end before shutdown was requested
    async fn task_failure(&mut self) -> SidecarError {
        match self.tasks.join_next().await {
            Some(Ok(())) => SidecarError::internal("background task exited unexpectedly"),
            Some(Err(e)) => SidecarError::internal(format!("background task failed: {}", e)),
            None => std::future::pending().await,
        }
    }

    /// Start, then run until `shutdown` resolves or a background task dies.
    ///
    /// A dead task is fatal: the alert names the failure and the error is
    /// returned so the caller can exit non-zero.
    pub async fn run_until<S>(mut self, shutdown: S) -> Result<()>
    where
        S: Future<Output = Result<()>>,
    {
        self.start().await?;
        let outcome = tokio::select! {
            requested = shutdown => requested,
            failure = self.task_failure() => Err(failure),
        };

        match outcome {
            Ok(()) => {
                self.shutdown().await;
                Ok(())
            }
            Err(e) => {
                error!("sidecar failed: {}", e);
                self.stop(format!("sbc-sip-sidecar failed: {}", e)).await;
                Err(e)
            }
        }
    }

    /// Install logging, start, wait for SIGINT or SIGTERM, then shut down
    pub async fn run_until_shutdown(self) -> Result<()> {
        if let Err(e) = setup_logging(LoggingConfig::from(&self.config)) {
            debug!("keeping the installed subscriber: {}", e);
        }
        self.run_until(wait_for_signal()).await
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("received SIGINT");
            }
            _ = terminate.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl+C");
    }
    Ok(())
}

/// Announce this SBC's addresses and purge stale ones every `interval`
async fn keep_sbc_addresses_alive(
    services: Services,
    addresses: Vec<SbcAddress>,
    interval: Duration,
    cancel: CancellationToken,
) {
    // an address that missed two refreshes belongs to a dead SBC
    let stale_after = interval * 2;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for address in &addresses {
            if let Err(e) = services.directory.add_sbc_address(address).await {
                error!(ipv4 = %address.ipv4, "Error adding sbc address: {}", e);
            }
        }
        if let Err(e) = services.directory.clean_sbc_addresses(stale_after).await {
            error!("Error cleaning sbc addresses: {}", e);
        }
    }
}

async fn publish_user_count(registrar: Arc<dyn Registrar>, services: Services, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + USER_COUNT_INTERVAL, USER_COUNT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match registrar.count_users().await {
            Ok(count) => {
                debug!("count of registered users: {}", count);
                services.stats.gauge("sbc.users.count", count as f64, &[]);
            }
            Err(e) => error!("Error counting registered users: {}", e),
        }
    }
}
