//! Handles to the external collaborators
//!
//! Every background component receives the same bundle of trait objects.
//! Cloning the bundle is cheap: each field is an `Arc`.

use std::sync::Arc;

use crate::directory::CarrierDirectory;
use crate::dns::DnsResolver;
use crate::sip::SipClient;
use crate::store::{ClusterKeys, KeyValueStore};
use crate::telemetry::{AlertWriter, StatsSink};

/// Shared collaborators of the sidecar components
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn KeyValueStore>,
    pub directory: Arc<dyn CarrierDirectory>,
    pub sip: Arc<dyn SipClient>,
    pub dns: Arc<dyn DnsResolver>,
    pub alerts: Arc<dyn AlertWriter>,
    pub stats: Arc<dyn StatsSink>,
    pub keys: ClusterKeys,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("cluster_id", &self.keys.cluster_id())
            .finish_non_exhaustive()
    }
}
