//! In-process carrier directory

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

use super::{Carrier, CarrierDirectory, Gateway, RegisterStatusRecord, SbcAddress};
use crate::error::{Result, SidecarError};

#[derive(Debug, Default)]
struct State {
    carriers: Vec<Carrier>,
    gateways: Vec<Gateway>,
    account_realms: HashMap<String, String>,
    register_status: HashMap<String, Vec<RegisterStatusRecord>>,
    sbc_addresses: HashMap<SbcAddress, Instant>,
}

/// Carrier directory held in memory
///
/// Used by tests and by embedders that source configuration elsewhere.
/// `set_available(false)` makes every call fail, like an unreachable
/// database.
#[derive(Debug)]
pub struct MemoryDirectory {
    state: RwLock<State>,
    available: AtomicBool,
    carrier_lookups: AtomicU64,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            available: AtomicBool::new(true),
            carrier_lookups: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// How many times the full carrier list has been read
    pub fn carrier_lookups(&self) -> u64 {
        self.carrier_lookups.load(Ordering::SeqCst)
    }

    /// Insert or replace a carrier
    pub fn upsert_carrier(&self, carrier: Carrier) {
        let mut state = self.state.write();
        match state
            .carriers
            .iter_mut()
            .find(|c| c.voip_carrier_sid == carrier.voip_carrier_sid)
        {
            Some(existing) => *existing = carrier,
            None => state.carriers.push(carrier),
        }
    }

    /// Insert or replace a gateway
    pub fn upsert_gateway(&self, gateway: Gateway) {
        let mut state = self.state.write();
        match state
            .gateways
            .iter_mut()
            .find(|g| g.sip_gateway_sid == gateway.sip_gateway_sid)
        {
            Some(existing) => *existing = gateway,
            None => state.gateways.push(gateway),
        }
    }

    pub fn remove_gateway(&self, gateway_sid: &str) {
        self.state
            .write()
            .gateways
            .retain(|g| g.sip_gateway_sid != gateway_sid);
    }

    pub fn set_account_sip_realm(&self, account_sid: impl Into<String>, realm: impl Into<String>) {
        self.state
            .write()
            .account_realms
            .insert(account_sid.into(), realm.into());
    }

    pub fn carrier(&self, carrier_sid: &str) -> Option<Carrier> {
        self.state
            .read()
            .carriers
            .iter()
            .find(|c| c.voip_carrier_sid == carrier_sid)
            .cloned()
    }

    pub fn gateway(&self, gateway_sid: &str) -> Option<Gateway> {
        self.state
            .read()
            .gateways
            .iter()
            .find(|g| g.sip_gateway_sid == gateway_sid)
            .cloned()
    }

    /// Every status record written for a carrier, oldest first
    pub fn register_status_history(&self, carrier_sid: &str) -> Vec<RegisterStatusRecord> {
        self.state
            .read()
            .register_status
            .get(carrier_sid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn sbc_addresses(&self) -> Vec<SbcAddress> {
        self.state.read().sbc_addresses.keys().cloned().collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SidecarError::directory("directory unavailable"))
        }
    }
}

#[async_trait]
impl CarrierDirectory for MemoryDirectory {
    async fn lookup_all_carriers(&self) -> Result<Vec<Carrier>> {
        self.carrier_lookups.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.state.read().carriers.clone())
    }

    async fn lookup_carrier_by_sid(&self, carrier_sid: &str) -> Result<Option<Carrier>> {
        self.check_available()?;
        Ok(self.carrier(carrier_sid))
    }

    async fn lookup_gateways_by_carrier(&self, carrier_sid: &str) -> Result<Vec<Gateway>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .gateways
            .iter()
            .filter(|g| g.voip_carrier_sid == carrier_sid)
            .cloned()
            .collect())
    }

    async fn lookup_options_ping_gateways(&self) -> Result<Vec<Gateway>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .gateways
            .iter()
            .filter(|g| g.send_options_ping && g.outbound && g.is_active)
            .cloned()
            .collect())
    }

    async fn lookup_account_sip_realm(&self, account_sid: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.state.read().account_realms.get(account_sid).cloned())
    }

    async fn update_register_status(&self, carrier_sid: &str, record: &RegisterStatusRecord) -> Result<()> {
        self.check_available()?;
        self.state
            .write()
            .register_status
            .entry(carrier_sid.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn disable_carrier_registration(&self, carrier_sid: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write();
        if let Some(carrier) = state
            .carriers
            .iter_mut()
            .find(|c| c.voip_carrier_sid == carrier_sid)
        {
            carrier.requires_register = false;
        }
        Ok(())
    }

    async fn disable_gateway_options_ping(&self, gateway_sid: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write();
        if let Some(gateway) = state
            .gateways
            .iter_mut()
            .find(|g| g.sip_gateway_sid == gateway_sid)
        {
            gateway.send_options_ping = false;
        }
        Ok(())
    }

    async fn add_sbc_address(&self, address: &SbcAddress) -> Result<()> {
        self.check_available()?;
        self.state
            .write()
            .sbc_addresses
            .insert(address.clone(), Instant::now());
        Ok(())
    }

    async fn clean_sbc_addresses(&self, stale_after: Duration) -> Result<()> {
        self.check_available()?;
        let now = Instant::now();
        self.state
            .write()
            .sbc_addresses
            .retain(|_, seen| now.duration_since(*seen) <= stale_after);
        Ok(())
    }
}
