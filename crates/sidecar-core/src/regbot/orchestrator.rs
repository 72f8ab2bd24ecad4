//! Leader election and regbot reconciliation

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::leader::{LeaderAction, Leadership, TokenState};
use super::{Regbot, RegbotContext, RegbotHandle, RegbotOptions, RegbotSnapshot};
use crate::directory::{CarrierProjection, Gateway, RegisterStatusRecord};
use crate::error::Result;
use crate::options_ping::OptionsPingFleet;

/// A gateway joined with the carrier it registers for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationTarget {
    pub gateway: Gateway,
    pub carrier: CarrierProjection,
}

impl RegistrationTarget {
    fn sip_realm(&self) -> &str {
        self.carrier
            .register_sip_realm
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(&self.gateway.ipv4)
    }
}

/// Keep one target per (ipv4, realm, username, password); drop targets without a password
pub fn dedupe_targets(targets: Vec<RegistrationTarget>) -> Vec<RegistrationTarget> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(targets.len());

    for target in targets {
        let password = target.carrier.register_password.clone().unwrap_or_default();
        if password.is_empty() {
            warn!(
                carrier_sid = %target.carrier.voip_carrier_sid,
                gateway_sid = %target.gateway.sip_gateway_sid,
                "skipping gateway without a register password"
            );
            continue;
        }

        let key = (
            target.gateway.ipv4.clone(),
            target.sip_realm().to_string(),
            target.carrier.register_username.clone().unwrap_or_default(),
            password,
        );
        if !seen.insert(key) {
            info!(
                carrier_sid = %target.carrier.voip_carrier_sid,
                gateway_sid = %target.gateway.sip_gateway_sid,
                "skipping duplicate registration for {}@{}",
                target.carrier.register_username.as_deref().unwrap_or_default(),
                target.sip_realm()
            );
            continue;
        }
        unique.push(target);
    }
    unique
}

/// Counters kept by the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    /// Reconciliations that replaced the bot set
    pub reconciliations: u64,
    pub regbots_started: u64,
    pub regbots_stopped: u64,
}

#[derive(Debug, Default)]
struct MonitorState {
    active: AtomicBool,
    epoch: AtomicU64,
    reconciliations: AtomicU64,
    regbots_started: AtomicU64,
    regbots_stopped: AtomicU64,
    bots: RwLock<Vec<Arc<Regbot>>>,
}

/// Read-only view of a running orchestrator, safe to clone across tasks
#[derive(Debug, Clone, Default)]
pub struct OrchestratorMonitor {
    state: Arc<MonitorState>,
}

impl OrchestratorMonitor {
    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    pub fn epoch(&self) -> u64 {
        self.state.epoch.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            reconciliations: self.state.reconciliations.load(Ordering::SeqCst),
            regbots_started: self.state.regbots_started.load(Ordering::SeqCst),
            regbots_stopped: self.state.regbots_stopped.load(Ordering::SeqCst),
        }
    }

    pub fn regbot_snapshots(&self) -> Vec<RegbotSnapshot> {
        self.state.bots.read().iter().map(|b| b.snapshot()).collect()
    }
}

/// Cluster singleton that owns every regbot (and optionally the OPTIONS fleet)
///
/// Only the task running [`RegbotOrchestrator::run`] mutates the bot set;
/// other tasks observe it through an [`OrchestratorMonitor`].
pub struct RegbotOrchestrator {
    ctx: Arc<RegbotContext>,
    leadership: Leadership,
    carriers: Vec<CarrierProjection>,
    targets: Vec<RegistrationTarget>,
    regbots: Vec<RegbotHandle>,
    options_fleet: Option<OptionsPingFleet>,
    monitor: OrchestratorMonitor,
}

impl RegbotOrchestrator {
    pub fn new(ctx: RegbotContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            leadership: Leadership::new(),
            carriers: Vec::new(),
            targets: Vec::new(),
            regbots: Vec::new(),
            options_fleet: None,
            monitor: OrchestratorMonitor::default(),
        }
    }

    /// Also drive the OPTIONS ping fleet while leading
    pub fn with_options_fleet(mut self, fleet: OptionsPingFleet) -> Self {
        self.options_fleet = Some(fleet);
        self
    }

    pub fn monitor(&self) -> OrchestratorMonitor {
        self.monitor.clone()
    }

    pub fn is_active(&self) -> bool {
        self.leadership.is_active()
    }

    pub fn leadership(&self) -> &Leadership {
        &self.leadership
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.monitor.stats()
    }

    pub fn regbot_snapshots(&self) -> Vec<RegbotSnapshot> {
        self.regbots.iter().map(RegbotHandle::snapshot).collect()
    }

    pub fn options_fleet(&self) -> Option<&OptionsPingFleet> {
        self.options_fleet.as_ref()
    }

    fn sync_leadership(&self) {
        let state = &self.monitor.state;
        state.active.store(self.leadership.is_active(), Ordering::SeqCst);
        state.epoch.store(self.leadership.epoch(), Ordering::SeqCst);
    }

    /// Run until cancelled: jitter, claim, then check in every `check_interval`
    pub async fn run(mut self, cancel: CancellationToken) {
        let max_delay = self.ctx.settings.max_initial_delay.as_secs();
        let jitter = std::time::Duration::from_secs(rand::thread_rng().gen_range(0..=max_delay));
        info!(
            token = %self.leadership.token(),
            "waiting {:?} before attempting to claim regbot responsibility",
            jitter
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(jitter) => {}
        }

        let period = self.ctx.settings.check_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        // a slow reconcile must not be followed by a burst of catch-up checks
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let interrupted = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = self.initial_claim() => false,
        };

        if !interrupted {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.check_status() => {}
                }
            }
        }

        self.stop_all().await;
        info!("regbot orchestrator stopped");
    }

    async fn initial_claim(&mut self) {
        if self.try_claim().await {
            self.reconcile_all().await;
        }
    }

    /// Atomically claim the leadership key
    pub async fn try_claim(&mut self) -> bool {
        let key = self.ctx.services.keys.regbot_token();
        let token = self.leadership.token().clone();
        let ttl = self.ctx.settings.token_ttl();

        match self.ctx.services.store.set_nx(&key, token.as_str(), ttl).await {
            Ok(true) => {
                self.leadership.promote();
                self.sync_leadership();
                info!(token = %token, epoch = self.leadership.epoch(), "successfully claimed regbot responsibility");
                true
            }
            Ok(false) => {
                info!(token = %token, "failed to claim regbot responsibility");
                false
            }
            Err(e) => {
                error!("Error claiming regbot responsibility: {}", e);
                false
            }
        }
    }

    /// One leader-election step
    pub async fn check_status(&mut self) {
        let key = self.ctx.services.keys.regbot_token();
        let active = self.leadership.is_active();
        info!(active, token = %self.leadership.token(), "checking in on regbot status");

        let stored = match self.ctx.services.store.get(&key).await {
            Ok(stored) => stored,
            Err(e) => {
                error!("error reading regbot token: {}", e);
                return;
            }
        };
        let state = TokenState::classify(stored.as_deref(), self.leadership.token());

        match LeaderAction::decide(active, &state) {
            LeaderAction::Refresh => {
                info!("I am active, and shall continue in my role as regbot");
                let ttl = self.ctx.settings.token_ttl();
                let token = self.leadership.token().clone();
                match self.ctx.services.store.set(&key, token.as_str(), Some(ttl)).await {
                    Ok(()) => self.reconcile_all().await,
                    Err(e) => error!("Error refreshing regbot token: {}", e),
                }
            }
            LeaderAction::StandDown => {
                info!("Someone else grabbed the role! I need to stand down");
                self.stand_down().await;
            }
            LeaderAction::Reclaim => {
                info!("regbot token vacated while active, restarting");
                self.stand_down().await;
                if self.try_claim().await {
                    self.reconcile_all().await;
                }
            }
            LeaderAction::Claim => {
                info!("regbot status is vacated, try to grab it!");
                if self.try_claim().await {
                    self.reconcile_all().await;
                }
            }
            LeaderAction::Idle => {
                debug!("I am inactive and someone else is performing the role");
            }
        }
    }

    async fn stand_down(&mut self) {
        self.stop_all().await;
        self.leadership.demote();
        self.sync_leadership();
    }

    async fn reconcile_all(&mut self) {
        if let Err(e) = self.reconcile().await {
            error!("regbot reconcile failed: {}", e);
        }
        if let Some(fleet) = self.options_fleet.as_mut() {
            if let Err(e) = fleet.reconcile().await {
                error!("options fleet reconcile failed: {}", e);
            }
        }
    }

    /// Diff carriers and gateways against the running bots; restart all of them on change
    ///
    /// Returns whether the bot set was replaced. Does nothing unless leading.
    /// A directory failure leaves the running bots untouched.
    pub async fn reconcile(&mut self) -> Result<bool> {
        if !self.leadership.is_active() {
            return Ok(false);
        }
        let directory = self.ctx.services.directory.clone();

        let carriers: Vec<CarrierProjection> = directory
            .lookup_all_carriers()
            .await?
            .iter()
            .filter(|c| c.requires_register && c.is_active)
            .map(CarrierProjection::from)
            .collect();

        let mut targets = Vec::new();
        for carrier in &carriers {
            let gateways = directory.lookup_gateways_by_carrier(&carrier.voip_carrier_sid).await?;
            targets.extend(
                gateways
                    .into_iter()
                    .filter(|g| g.outbound && g.is_active)
                    .map(|gateway| RegistrationTarget {
                        gateway,
                        carrier: carrier.clone(),
                    }),
            );
        }

        if carriers == self.carriers && targets == self.targets {
            debug!("regbot reconcile: no carrier changes");
            return Ok(false);
        }

        info!(
            carriers = carriers.len(),
            gateways = targets.len(),
            "carriers changed, restarting regbots"
        );
        self.stop_regbots().await;
        self.carriers = carriers;
        self.targets = targets;

        let unique = dedupe_targets(self.targets.clone());
        self.start_regbots(unique).await;
        self.monitor.state.reconciliations.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn start_regbots(&mut self, targets: Vec<RegistrationTarget>) {
        let settings = self.ctx.settings.clone();
        let total = targets.len();

        for (index, target) in targets.into_iter().enumerate() {
            let account_sip_realm = self.account_sip_realm(&target).await;
            let opts = RegbotOptions {
                voip_carrier_sid: target.carrier.voip_carrier_sid.clone(),
                ipv4: target.gateway.ipv4.clone(),
                port: target.gateway.port,
                protocol: target.gateway.protocol.clone(),
                username: target.carrier.register_username.clone().unwrap_or_default(),
                password: target.carrier.register_password.clone().unwrap_or_default(),
                sip_realm: target.carrier.register_sip_realm.clone(),
                from_user: target.carrier.register_from_user.clone(),
                from_domain: target.carrier.register_from_domain.clone(),
                use_public_ip_in_contact: target.carrier.register_public_ip_in_contact,
                use_sips_scheme: target.carrier.register_use_sips_scheme || target.gateway.use_sips_scheme,
                outbound_sip_proxy: target.carrier.outbound_sip_proxy.clone(),
                account_sip_realm,
                trunk_type: target.carrier.trunk_type,
            };

            match Regbot::new(opts, &settings) {
                Ok(bot) => {
                    let handle = Arc::new(bot).start(self.ctx.clone());
                    self.monitor.state.bots.write().push(handle.bot().clone());
                    self.regbots.push(handle);
                    self.monitor.state.regbots_started.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    error!(
                        carrier_sid = %target.carrier.voip_carrier_sid,
                        gateway_sid = %target.gateway.sip_gateway_sid,
                        "Error creating regbot: {}", e
                    );
                    let record = RegisterStatusRecord::failure(e.to_string());
                    if let Err(e) = self
                        .ctx
                        .services
                        .directory
                        .update_register_status(&target.carrier.voip_carrier_sid, &record)
                        .await
                    {
                        warn!("Failed to write register status: {}", e);
                    }
                    continue;
                }
            }

            let started = index + 1;
            if started == total {
                break;
            }
            if settings.batch_size > 0 {
                if started % settings.batch_size == 0 && !settings.batch_sleep.is_zero() {
                    debug!("started {} of {} regbots, pausing {:?}", started, total, settings.batch_sleep);
                    tokio::time::sleep(settings.batch_sleep).await;
                }
            } else if !settings.start_delay.is_zero() {
                tokio::time::sleep(settings.start_delay).await;
            }
        }
        debug!("{} regbots running", self.regbots.len());
    }

    async fn account_sip_realm(&self, target: &RegistrationTarget) -> Option<String> {
        let account_sid = target.carrier.account_sid.as_deref()?;
        match self.ctx.services.directory.lookup_account_sip_realm(account_sid).await {
            Ok(realm) => realm,
            Err(e) => {
                warn!(account_sid, "Error looking up account sip realm: {}", e);
                None
            }
        }
    }

    async fn stop_regbots(&mut self) {
        let handles = std::mem::take(&mut self.regbots);
        let stopped = handles.len() as u64;
        // cancel everything before the first await so an interrupted stop leaks nothing
        for handle in &handles {
            handle.stop();
        }
        for handle in handles {
            handle.stop_and_wait().await;
        }
        self.monitor.state.bots.write().clear();
        self.monitor.state.regbots_stopped.fetch_add(stopped, Ordering::SeqCst);
    }

    /// Stop every owned bot and forget the remembered configuration
    pub async fn stop_all(&mut self) {
        self.stop_regbots().await;
        self.carriers.clear();
        self.targets.clear();
        if let Some(fleet) = self.options_fleet.as_mut() {
            fleet.stop_all().await;
        }
    }
}
