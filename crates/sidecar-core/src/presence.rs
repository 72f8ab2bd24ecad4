//! Presence of internal feature servers and RTP servers
//!
//! Internal servers check in with OPTIONS pings carrying `X-FS-Status` or
//! `X-RTP-Status`. Each check-in refreshes a local last-seen map and the
//! mirrored shared-store set; a periodic sweep evicts servers that stopped
//! pinging. OPTIONS without those headers come from outside and are simply
//! answered.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PresenceSettings;
use crate::error::Result;
use crate::runtime_config::FeatureServerConfig;
use crate::sip::{InboundRequest, SipMessage, SipReply};
use crate::store::{ClusterKeys, KeyValueStore};
use crate::telemetry::StatsSink;

const FS_STATUS: &str = "X-FS-Status";
const RTP_STATUS: &str = "X-RTP-Status";
const FS_SERVICE_URL: &str = "X-FS-ServiceUrl";

/// Last-seen times mirrored into one shared-store set
struct PresenceMap {
    set_name: String,
    seen: DashMap<String, Instant>,
}

impl PresenceMap {
    fn new(set_name: String) -> Self {
        Self {
            set_name,
            seen: DashMap::new(),
        }
    }

    fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.seen.iter().map(|e| e.key().clone()).collect();
        members.sort();
        members
    }
}

pub struct PresenceTracker {
    store: Arc<dyn KeyValueStore>,
    stats: Arc<dyn StatsSink>,
    feature_servers: FeatureServerConfig,
    settings: PresenceSettings,
    fs: PresenceMap,
    rtp: PresenceMap,
    service_urls: PresenceMap,
}

impl PresenceTracker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: &ClusterKeys,
        stats: Arc<dyn StatsSink>,
        feature_servers: FeatureServerConfig,
        settings: PresenceSettings,
    ) -> Self {
        Self {
            store,
            stats,
            feature_servers,
            settings,
            fs: PresenceMap::new(keys.active_fs()),
            rtp: PresenceMap::new(keys.active_rtp()),
            service_urls: PresenceMap::new(keys.fs_service_url()),
        }
    }

    /// Seed the local maps from the store so servers that checked in before
    /// this process started are still watched for expiry
    pub async fn init(&self) {
        let now = Instant::now();
        for map in [&self.fs, &self.service_urls, &self.rtp] {
            match self.store.retrieve_set(&map.set_name).await {
                Ok(members) => {
                    if !members.is_empty() {
                        info!(?members, "start watching members of {}", map.set_name);
                    }
                    for member in members {
                        map.seen.insert(member, now);
                    }
                }
                Err(e) => error!("error initializing {} from store: {}", map.set_name, e),
            }
        }
    }

    /// Answer an inbound OPTIONS
    pub async fn handle_options(&self, req: &InboundRequest) -> SipReply {
        if !req.has_header(FS_STATUS) && !req.has_header(RTP_STATUS) {
            debug!("got external OPTIONS ping");
            return SipReply::ok();
        }

        match self.check_in(req).await {
            Ok(members) => SipReply::ok().with_header("X-Members", members.to_string()),
            Err(e) => {
                error!("Error handling OPTIONS: {}", e);
                SipReply::new(503)
            }
        }
    }

    async fn check_in(&self, req: &InboundRequest) -> Result<usize> {
        let is_rtp = req.has_header(RTP_STATUS);
        let (map, key, status_header, gauge) = if is_rtp {
            (&self.rtp, req.source_address.clone(), RTP_STATUS, "rtpservers")
        } else {
            (
                &self.fs,
                format!("{}:{}", req.source_address, req.source_port),
                FS_STATUS,
                "featureservers",
            )
        };

        let mut open = req.header(status_header).map(str::trim) == Some("open");
        if open && !is_rtp && self.feature_servers.is_drained(&req.source_address).await {
            warn!(fs_ip = %req.source_address, "drained feature server attempted to check in - rejecting");
            open = false;
        }

        let members = self.update(map, open, &key).await?;
        if let Some(url) = req.header(FS_SERVICE_URL) {
            self.update(&self.service_urls, open, url).await?;
        }
        self.stats.gauge(gauge, map.seen.len() as f64, &[]);
        Ok(members)
    }

    /// Apply one check-in to a map and its store set; returns the set size
    async fn update(&self, map: &PresenceMap, open: bool, key: &str) -> Result<usize> {
        let set = map.set_name.as_str();
        if open {
            map.seen.insert(key.to_string(), Instant::now());
            if self.store.is_member_of_set(set, key).await? {
                let members = self.store.retrieve_set(set).await?;
                debug!("checkin from existing member {} to {}", key, set);
                Ok(members.len())
            } else {
                self.store.add_to_set(set, key).await?;
                let members = self.store.retrieve_set(set).await?;
                info!(?members, "added new member {} to {} we now have {}", key, set, members.len());
                Ok(members.len())
            }
        } else {
            map.seen.remove(key);
            self.store.remove_from_set(set, key).await?;
            let members = self.store.retrieve_set(set).await?;
            info!(?members, "removed member {} from {} we now have {}", key, set, members.len());
            Ok(members.len())
        }
    }

    /// Evict every entry not seen within the expiry window; returns how many
    pub async fn sweep_expired(&self) -> usize {
        let expires = self.settings.expires;
        let mut evicted = 0;

        for map in [&self.fs, &self.service_urls, &self.rtp] {
            let now = Instant::now();
            let stale: Vec<String> = map
                .seen
                .iter()
                .filter(|e| now.duration_since(*e.value()) > expires)
                .map(|e| e.key().clone())
                .collect();

            for key in stale {
                // a check-in may have landed since the scan
                if map
                    .seen
                    .remove_if(&key, |_, seen| now.duration_since(*seen) > expires)
                    .is_none()
                {
                    continue;
                }
                evicted += 1;
                if let Err(e) = self.store.remove_from_set(&map.set_name, &key).await {
                    error!("failed to remove expired member {} from {}: {}", key, map.set_name, e);
                    continue;
                }
                match self.store.retrieve_set(&map.set_name).await {
                    Ok(members) => info!(
                        ?members,
                        "expired member {} from {} we now have {}",
                        key,
                        map.set_name,
                        members.len()
                    ),
                    Err(e) => error!("failed to read {}: {}", map.set_name, e),
                }
            }
        }
        evicted
    }

    /// Sweep every `check_interval` until cancelled
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.settings.check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_expired().await;
                }
            }
        }
        debug!("presence sweeper stopped");
    }

    /// Feature servers (`ip:port`) in the local view
    pub fn feature_servers(&self) -> Vec<String> {
        self.fs.members()
    }

    /// RTP servers (`ip`) in the local view
    pub fn rtp_servers(&self) -> Vec<String> {
        self.rtp.members()
    }

    pub fn service_urls(&self) -> Vec<String> {
        self.service_urls.members()
    }
}
