//! DNS lookups for registration trunks
//!
//! Resolution never fails from the caller's point of view: a lookup error
//! is logged and yields an empty list, which simply means no ephemeral
//! gateways are created for that attempt.

use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use tracing::{debug, info};

use crate::error::{Result, SidecarError};
use crate::sip::Transport;

/// Resolves hostnames into IPv4 addresses
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// A records of `host`
    async fn resolve_a(&self, host: &str) -> Vec<String>;

    /// A records of every target of the SRV record `name`
    async fn resolve_srv(&self, name: &str) -> Vec<String>;
}

/// SRV owner name for a SIP domain and transport
pub fn srv_name(host: &str, transport: Transport) -> String {
    match transport {
        Transport::Tls => format!("_sips._tcp.{}", host),
        Transport::Tcp => format!("_sip._tcp.{}", host),
        _ => format!("_sip._udp.{}", host),
    }
}

/// System resolver backed by hickory
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: TokioResolver,
}

impl HickoryResolver {
    /// Build from the system resolver configuration (`/etc/resolv.conf`)
    pub fn from_system_conf() -> Result<Self> {
        let resolver = TokioResolver::builder_tokio()
            .map_err(|e| SidecarError::dns(format!("failed to create system resolver: {}", e)))?
            .build();
        Ok(Self { resolver })
    }

    pub fn new(resolver: TokioResolver) -> Self {
        Self { resolver }
    }
}

impl std::fmt::Debug for HickoryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HickoryResolver").finish_non_exhaustive()
    }
}

#[async_trait]
impl DnsResolver for HickoryResolver {
    async fn resolve_a(&self, host: &str) -> Vec<String> {
        match self.resolver.ipv4_lookup(host).await {
            Ok(lookup) => {
                let addresses: Vec<String> = lookup.iter().map(|a| a.to_string()).collect();
                debug!(?addresses, "resolved {} into {} IPs", host, addresses.len());
                addresses
            }
            Err(e) => {
                info!("Error resolving {}: {}", host, e);
                Vec::new()
            }
        }
    }

    async fn resolve_srv(&self, name: &str) -> Vec<String> {
        let targets: Vec<String> = match self.resolver.srv_lookup(name).await {
            Ok(lookup) => lookup
                .iter()
                .map(|srv| srv.target().to_utf8().trim_end_matches('.').to_string())
                .collect(),
            Err(e) => {
                info!("SRV error resolving {}: {}", name, e);
                return Vec::new();
            }
        };
        debug!(?targets, "resolved {} into {} SRV targets", name, targets.len());

        let mut addresses = Vec::new();
        for target in targets {
            addresses.extend(self.resolve_a(&target).await);
        }
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srv_names_follow_transport() {
        assert_eq!(srv_name("carrier.net", Transport::Tls), "_sips._tcp.carrier.net");
        assert_eq!(srv_name("carrier.net", Transport::Tcp), "_sip._tcp.carrier.net");
        assert_eq!(srv_name("carrier.net", Transport::Udp), "_sip._udp.carrier.net");
        assert_eq!(srv_name("carrier.net", Transport::Wss), "_sip._udp.carrier.net");
    }
}
