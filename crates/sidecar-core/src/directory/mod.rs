//! Carrier directory
//!
//! Read access to carrier and gateway configuration, plus the few writes
//! the sidecar performs back (registration status, disabling a carrier's
//! registration or a gateway's pings, announcing this SBC's addresses).
//!
//! The relational schema itself is owned elsewhere; [`MySqlDirectory`]
//! only issues the queries this crate needs.

mod memory;
#[cfg(feature = "mysql")]
mod mysql;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::MemoryDirectory;
#[cfg(feature = "mysql")]
pub use mysql::MySqlDirectory;

/// How a carrier trunk authenticates inbound traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrunkType {
    /// Fixed gateway addresses
    #[default]
    Static,
    /// Digest authentication of inbound requests
    Auth,
    /// Registration trunk; inbound sources are learned from the realm's DNS
    Reg,
}

impl TrunkType {
    pub fn from_db(value: Option<&str>) -> Self {
        match value {
            Some("reg") => TrunkType::Reg,
            Some("auth") => TrunkType::Auth,
            _ => TrunkType::Static,
        }
    }
}

/// A carrier row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Carrier {
    pub voip_carrier_sid: String,
    pub name: String,
    pub account_sid: Option<String>,
    pub service_provider_sid: Option<String>,
    pub requires_register: bool,
    pub is_active: bool,
    pub register_username: Option<String>,
    pub register_password: Option<String>,
    pub register_sip_realm: Option<String>,
    pub register_from_user: Option<String>,
    pub register_from_domain: Option<String>,
    pub register_public_ip_in_contact: bool,
    pub register_use_sips_scheme: bool,
    pub outbound_sip_proxy: Option<String>,
    pub trunk_type: TrunkType,
}

/// The carrier fields that matter to a registration bot
///
/// Reconciliation compares these projections rather than full rows so
/// that unrelated column changes do not restart every bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CarrierProjection {
    pub voip_carrier_sid: String,
    pub account_sid: Option<String>,
    pub requires_register: bool,
    pub is_active: bool,
    pub register_username: Option<String>,
    pub register_password: Option<String>,
    pub register_sip_realm: Option<String>,
    pub register_from_user: Option<String>,
    pub register_from_domain: Option<String>,
    pub register_public_ip_in_contact: bool,
    pub register_use_sips_scheme: bool,
    pub outbound_sip_proxy: Option<String>,
    pub trunk_type: TrunkType,
}

impl From<&Carrier> for CarrierProjection {
    fn from(c: &Carrier) -> Self {
        Self {
            voip_carrier_sid: c.voip_carrier_sid.clone(),
            account_sid: c.account_sid.clone(),
            requires_register: c.requires_register,
            is_active: c.is_active,
            register_username: c.register_username.clone(),
            register_password: c.register_password.clone(),
            register_sip_realm: c.register_sip_realm.clone(),
            register_from_user: c.register_from_user.clone(),
            register_from_domain: c.register_from_domain.clone(),
            register_public_ip_in_contact: c.register_public_ip_in_contact,
            register_use_sips_scheme: c.register_use_sips_scheme,
            outbound_sip_proxy: c.outbound_sip_proxy.clone(),
            trunk_type: c.trunk_type,
        }
    }
}

/// A SIP gateway row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    pub sip_gateway_sid: String,
    pub voip_carrier_sid: String,
    pub ipv4: String,
    pub port: Option<u16>,
    /// Transport name, possibly with a suffix (`udp`, `tls/srtp`, ...)
    pub protocol: String,
    pub outbound: bool,
    pub is_active: bool,
    pub send_options_ping: bool,
    pub use_sips_scheme: bool,
}

/// Registration outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterOutcome {
    Ok,
    Fail,
}

/// Status written back to the carrier after every registration attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterStatusRecord {
    pub status: RegisterOutcome,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cseq: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<u32>,
}

impl RegisterStatusRecord {
    /// Record for a final response from the registrar
    pub fn from_response(
        status: u16,
        reason: &str,
        cseq: Option<String>,
        call_id: Option<String>,
        expires: u32,
    ) -> Self {
        Self {
            status: if status == 200 {
                RegisterOutcome::Ok
            } else {
                RegisterOutcome::Fail
            },
            reason: format!("{} {}", status, reason),
            cseq,
            call_id,
            timestamp: Utc::now(),
            expires: Some(expires),
        }
    }

    /// Record for an attempt that never got a response
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            status: RegisterOutcome::Fail,
            reason: reason.into(),
            cseq: None,
            call_id: None,
            timestamp: Utc::now(),
            expires: None,
        }
    }
}

/// Public signalling address of an SBC instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SbcAddress {
    pub ipv4: String,
    pub port: u16,
    pub tls_port: Option<u16>,
    pub wss_port: Option<u16>,
}

/// Carrier and gateway configuration source
#[async_trait]
pub trait CarrierDirectory: Send + Sync {
    /// Every carrier, active or not
    async fn lookup_all_carriers(&self) -> Result<Vec<Carrier>>;

    async fn lookup_carrier_by_sid(&self, carrier_sid: &str) -> Result<Option<Carrier>>;

    /// Every gateway of one carrier
    async fn lookup_gateways_by_carrier(&self, carrier_sid: &str) -> Result<Vec<Gateway>>;

    /// Gateways with `send_options_ping && outbound && is_active`
    async fn lookup_options_ping_gateways(&self) -> Result<Vec<Gateway>>;

    /// SIP realm of an account, if it has one
    async fn lookup_account_sip_realm(&self, account_sid: &str) -> Result<Option<String>>;

    async fn update_register_status(&self, carrier_sid: &str, record: &RegisterStatusRecord) -> Result<()>;

    /// Set `requires_register = false` on a carrier
    async fn disable_carrier_registration(&self, carrier_sid: &str) -> Result<()>;

    /// Set `send_options_ping = false` on a gateway
    async fn disable_gateway_options_ping(&self, gateway_sid: &str) -> Result<()>;

    /// Announce (or refresh) this SBC's public address
    async fn add_sbc_address(&self, address: &SbcAddress) -> Result<()>;

    /// Remove addresses not refreshed within `stale_after`
    async fn clean_sbc_addresses(&self, stale_after: Duration) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_record_serializes_with_legacy_field_names() {
        let record = RegisterStatusRecord::from_response(
            401,
            "Unauthorized",
            Some("2 REGISTER".into()),
            Some("abc@host".into()),
            0,
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "fail");
        assert_eq!(json["reason"], "401 Unauthorized");
        assert_eq!(json["callId"], "abc@host");
        assert_eq!(json["expires"], 0);
    }

    #[test]
    fn trunk_type_defaults_to_static() {
        assert_eq!(TrunkType::from_db(Some("reg")), TrunkType::Reg);
        assert_eq!(TrunkType::from_db(Some("other")), TrunkType::Static);
        assert_eq!(TrunkType::from_db(None), TrunkType::Static);
    }
}
