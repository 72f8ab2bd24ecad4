//! Tracked set of OPTIONS ping bots

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{OptionsBot, OptionsBotHandle, OptionsContext};
use crate::directory::Gateway;
use crate::error::Result;

/// One bot per pingable gateway, restarted only when the gateway list changes
pub struct OptionsPingFleet {
    ctx: Arc<OptionsContext>,
    gateways: Vec<Gateway>,
    bots: Vec<OptionsBotHandle>,
}

impl OptionsPingFleet {
    pub fn new(ctx: OptionsContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            gateways: Vec::new(),
            bots: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }

    /// URIs of the running bots
    pub fn uris(&self) -> Vec<String> {
        self.bots.iter().map(|b| b.uri().to_string()).collect()
    }

    /// Re-read pingable gateways; replace every bot if the list changed.
    ///
    /// Returns whether the fleet was replaced. A lookup failure leaves the
    /// running bots alone.
    pub async fn reconcile(&mut self) -> Result<bool> {
        let gateways = self.ctx.services.directory.lookup_options_ping_gateways().await?;
        if gateways == self.gateways {
            debug!("options fleet: no gateway changes");
            return Ok(false);
        }

        info!(gateways = gateways.len(), "options fleet: gateways changed, restarting pings");
        self.stop_bots().await;
        for gateway in &gateways {
            let bot = OptionsBot::new(gateway.clone());
            self.bots.push(bot.start(self.ctx.clone()));
        }
        self.gateways = gateways;
        debug!("options fleet: started {} options bots", self.bots.len());
        Ok(true)
    }

    async fn stop_bots(&mut self) {
        let bots = std::mem::take(&mut self.bots);
        for bot in &bots {
            bot.stop();
        }
        for bot in bots {
            bot.stop_and_wait().await;
        }
    }

    /// Stop every bot and forget the gateway list
    pub async fn stop_all(&mut self) {
        self.stop_bots().await;
        self.gateways.clear();
    }

    /// Reconcile every ping interval until cancelled, for deployments where
    /// no orchestrator owns the fleet
    pub async fn run(mut self, cancel: CancellationToken) {
        let period = self.ctx.settings.interval;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let reconciled = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.reconcile() => result,
            };
            if let Err(e) = reconciled {
                error!("options fleet reconcile failed: {}", e);
            }
        }
        self.stop_all().await;
    }
}
