//! MySQL-backed carrier directory

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use tracing::{debug, info};

use super::{Carrier, CarrierDirectory, Gateway, RegisterStatusRecord, SbcAddress, TrunkType};
use crate::config::MySqlConfig;
use crate::error::Result;

#[derive(sqlx::FromRow, Debug)]
struct CarrierRow {
    voip_carrier_sid: String,
    name: String,
    account_sid: Option<String>,
    service_provider_sid: Option<String>,
    requires_register: bool,
    is_active: bool,
    register_username: Option<String>,
    register_password: Option<String>,
    register_sip_realm: Option<String>,
    register_from_user: Option<String>,
    register_from_domain: Option<String>,
    register_public_ip_in_contact: bool,
    register_use_sips_scheme: bool,
    outbound_sip_proxy: Option<String>,
    trunk_type: Option<String>,
}

impl From<CarrierRow> for Carrier {
    fn from(row: CarrierRow) -> Self {
        Carrier {
            voip_carrier_sid: row.voip_carrier_sid,
            name: row.name,
            account_sid: row.account_sid,
            service_provider_sid: row.service_provider_sid,
            requires_register: row.requires_register,
            is_active: row.is_active,
            register_username: row.register_username,
            register_password: row.register_password,
            register_sip_realm: row.register_sip_realm,
            register_from_user: row.register_from_user,
            register_from_domain: row.register_from_domain,
            register_public_ip_in_contact: row.register_public_ip_in_contact,
            register_use_sips_scheme: row.register_use_sips_scheme,
            outbound_sip_proxy: row.outbound_sip_proxy,
            trunk_type: TrunkType::from_db(row.trunk_type.as_deref()),
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct GatewayRow {
    sip_gateway_sid: String,
    voip_carrier_sid: String,
    ipv4: String,
    port: Option<i64>,
    protocol: Option<String>,
    outbound: bool,
    is_active: bool,
    send_options_ping: bool,
    use_sips_scheme: bool,
}

impl From<GatewayRow> for Gateway {
    fn from(row: GatewayRow) -> Self {
        Gateway {
            sip_gateway_sid: row.sip_gateway_sid,
            voip_carrier_sid: row.voip_carrier_sid,
            ipv4: row.ipv4,
            port: row.port.and_then(|p| u16::try_from(p).ok()),
            protocol: row.protocol.unwrap_or_else(|| "udp".to_string()),
            outbound: row.outbound,
            is_active: row.is_active,
            send_options_ping: row.send_options_ping,
            use_sips_scheme: row.use_sips_scheme,
        }
    }
}

const CARRIER_COLUMNS: &str = "voip_carrier_sid, name, account_sid, service_provider_sid, \
     requires_register, is_active, register_username, register_password, register_sip_realm, \
     register_from_user, register_from_domain, register_public_ip_in_contact, \
     register_use_sips_scheme, outbound_sip_proxy, trunk_type";

const GATEWAY_COLUMNS: &str = "sip_gateway_sid, voip_carrier_sid, ipv4, CAST(port AS SIGNED) AS port, \
     protocol, outbound, is_active, send_options_ping, use_sips_scheme";

/// Carrier directory on the jambonz MySQL schema
#[derive(Clone, Debug)]
pub struct MySqlDirectory {
    pool: MySqlPool,
}

impl MySqlDirectory {
    /// Open a connection pool
    pub async fn connect(config: &MySqlConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.connection_limit)
            .connect(&config.url())
            .await?;
        info!("Connected to mysql at {}:{}", config.host, config.port);
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CarrierDirectory for MySqlDirectory {
    async fn lookup_all_carriers(&self) -> Result<Vec<Carrier>> {
        let rows: Vec<CarrierRow> =
            sqlx::query_as(&format!("SELECT {} FROM voip_carriers", CARRIER_COLUMNS))
                .fetch_all(&self.pool)
                .await?;
        debug!("Loaded {} carriers", rows.len());
        Ok(rows.into_iter().map(Carrier::from).collect())
    }

    async fn lookup_carrier_by_sid(&self, carrier_sid: &str) -> Result<Option<Carrier>> {
        let row: Option<CarrierRow> = sqlx::query_as(&format!(
            "SELECT {} FROM voip_carriers WHERE voip_carrier_sid = ?",
            CARRIER_COLUMNS
        ))
        .bind(carrier_sid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Carrier::from))
    }

    async fn lookup_gateways_by_carrier(&self, carrier_sid: &str) -> Result<Vec<Gateway>> {
        let rows: Vec<GatewayRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sip_gateways WHERE voip_carrier_sid = ?",
            GATEWAY_COLUMNS
        ))
        .bind(carrier_sid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Gateway::from).collect())
    }

    async fn lookup_options_ping_gateways(&self) -> Result<Vec<Gateway>> {
        let rows: Vec<GatewayRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sip_gateways \
             WHERE send_options_ping = 1 AND outbound = 1 AND is_active = 1",
            GATEWAY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Gateway::from).collect())
    }

    async fn lookup_account_sip_realm(&self, account_sid: &str) -> Result<Option<String>> {
        let realm: Option<(Option<String>,)> =
            sqlx::query_as("SELECT sip_realm FROM accounts WHERE account_sid = ?")
                .bind(account_sid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(realm.and_then(|(realm,)| realm).filter(|r| !r.is_empty()))
    }

    async fn update_register_status(&self, carrier_sid: &str, record: &RegisterStatusRecord) -> Result<()> {
        let status = serde_json::to_string(record)?;
        sqlx::query("UPDATE voip_carriers SET register_status = ? WHERE voip_carrier_sid = ?")
            .bind(status)
            .bind(carrier_sid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn disable_carrier_registration(&self, carrier_sid: &str) -> Result<()> {
        sqlx::query("UPDATE voip_carriers SET requires_register = 0 WHERE voip_carrier_sid = ?")
            .bind(carrier_sid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn disable_gateway_options_ping(&self, gateway_sid: &str) -> Result<()> {
        sqlx::query("UPDATE sip_gateways SET send_options_ping = 0 WHERE sip_gateway_sid = ?")
            .bind(gateway_sid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_sbc_address(&self, address: &SbcAddress) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE sbc_addresses SET port = ?, tls_port = ?, wss_port = ?, last_updated = NOW() \
             WHERE ipv4 = ?",
        )
        .bind(address.port)
        .bind(address.tls_port)
        .bind(address.wss_port)
        .bind(&address.ipv4)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO sbc_addresses (sbc_address_sid, ipv4, port, tls_port, wss_port, last_updated) \
                 VALUES (?, ?, ?, ?, ?, NOW())",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&address.ipv4)
            .bind(address.port)
            .bind(address.tls_port)
            .bind(address.wss_port)
            .execute(&self.pool)
            .await?;
            info!(ipv4 = %address.ipv4, "Added sbc address");
        }
        Ok(())
    }

    async fn clean_sbc_addresses(&self, stale_after: Duration) -> Result<()> {
        let removed = sqlx::query(
            "DELETE FROM sbc_addresses WHERE last_updated < DATE_SUB(NOW(), INTERVAL ? SECOND)",
        )
        .bind(stale_after.as_secs())
        .execute(&self.pool)
        .await?;
        if removed.rows_affected() > 0 {
            info!("Removed {} stale sbc addresses", removed.rows_affected());
        }
        Ok(())
    }
}
