//! Configuration for the sidecar
//!
//! Settings are read from the process environment through the `config`
//! crate. The variable names are the ones operators already deploy with
//! (`JAMBONES_CLUSTER_ID`, `SEND_OPTIONS_PING_INTERVAL`, ...), so the raw
//! environment is deserialized first and then folded into typed settings
//! with defaults applied.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::Level;

use crate::error::{Result, SidecarError};
use crate::logging::parse_log_level;

/// Default location of the control socket
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/sbc-sip-sidecar.sock";

/// Default cluster namespace for shared-store keys
pub const DEFAULT_CLUSTER_ID: &str = "default";

/// Top-level sidecar configuration
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Namespace prepended to every shared-store key
    pub cluster_id: String,
    /// Level for the global subscriber
    pub log_level: Level,
    /// Control socket path
    pub socket_path: PathBuf,
    /// Redis connection URL for the shared store
    pub redis_url: String,
    /// Carrier database connection, if configured
    pub mysql: Option<MySqlConfig>,
    /// Outbound registration settings
    pub regbot: RegbotSettings,
    /// Outbound OPTIONS ping settings
    pub options: OptionsPingSettings,
    /// Inbound OPTIONS presence settings
    pub presence: PresenceSettings,
    /// How often this SBC re-announces its public addresses
    pub sbc_address_keepalive: Duration,
    /// Expires advertised to UDP clients, which are assumed to sit behind NAT
    pub nat_expires: u32,
    /// Upper bound for the shutdown alert write
    pub shutdown_grace: Duration,
}

/// MySQL connection settings for the carrier directory
#[derive(Debug, Clone, PartialEq)]
pub struct MySqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub connection_limit: u32,
}

impl MySqlConfig {
    /// Connection URL understood by sqlx
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

/// Settings for registration bots and their orchestrator
#[derive(Debug, Clone)]
pub struct RegbotSettings {
    /// Leader check and reconciliation interval
    pub check_interval: Duration,
    /// Upper bound of the random start-up delay before the first claim
    pub max_initial_delay: Duration,
    /// Expires requested in REGISTER and assumed when the registrar sends none
    pub default_expires: u32,
    /// Lower bound applied to the expires granted by the registrar
    pub min_expires: u32,
    /// Always advertise the SBC public address in Contact
    pub contact_use_ip: bool,
    /// User-Agent header sent with REGISTER
    pub user_agent: String,
    /// Registrar response codes that permanently disable a carrier's registration
    pub remove_codes: Vec<u16>,
    /// Number of bots started per batch (0 starts everything at once)
    pub batch_size: usize,
    /// Pause between batches
    pub batch_sleep: Duration,
    /// Pause between individual bot starts
    pub start_delay: Duration,
    /// Cluster-wide SIP domain used in Contact when the account has none
    pub local_sip_domain: Option<String>,
}

impl Default for RegbotSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            max_initial_delay: Duration::from_secs(15),
            default_expires: 3600,
            min_expires: 30,
            contact_use_ip: false,
            user_agent: format!("sbc-sip-sidecar {}", env!("CARGO_PKG_VERSION")),
            remove_codes: Vec::new(),
            batch_size: 0,
            batch_sleep: Duration::ZERO,
            start_delay: Duration::ZERO,
            local_sip_domain: None,
        }
    }
}

impl RegbotSettings {
    /// TTL of the leadership key: one check interval plus slack
    pub fn token_ttl(&self) -> Duration {
        self.check_interval + Duration::from_secs(10)
    }
}

/// Settings for outbound OPTIONS pings
#[derive(Debug, Clone)]
pub struct OptionsPingSettings {
    /// Ping and fleet refresh interval
    pub interval: Duration,
    /// How long a failing gateway stays blacklisted
    pub blacklist_ttl: Duration,
    /// Response codes that permanently disable pinging a gateway
    pub remove_codes: Vec<u16>,
}

impl Default for OptionsPingSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            blacklist_ttl: Duration::from_secs(300),
            remove_codes: Vec::new(),
        }
    }
}

/// Settings for inbound OPTIONS presence tracking
#[derive(Debug, Clone)]
pub struct PresenceSettings {
    /// A server not seen for longer than this is evicted
    pub expires: Duration,
    /// How often the expiry sweep runs
    pub check_interval: Duration,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            expires: Duration::from_millis(60_000),
            check_interval: Duration::from_millis(20_000),
        }
    }
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            cluster_id: DEFAULT_CLUSTER_ID.to_string(),
            log_level: Level::INFO,
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            mysql: None,
            regbot: RegbotSettings::default(),
            options: OptionsPingSettings::default(),
            presence: PresenceSettings::default(),
            sbc_address_keepalive: Duration::from_millis(900_000),
            nat_expires: 30,
            shutdown_grace: Duration::from_millis(3_000),
        }
    }
}

/// Environment variables as the `config` crate sees them (lowercased)
#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    jambones_cluster_id: Option<String>,
    jambones_loglevel: Option<String>,
    sbc_socket_path: Option<String>,
    jambones_redis_host: Option<String>,
    jambones_redis_port: Option<u16>,
    jambones_mysql_host: Option<String>,
    jambones_mysql_port: Option<u16>,
    jambones_mysql_user: Option<String>,
    jambones_mysql_password: Option<String>,
    jambones_mysql_database: Option<String>,
    jambones_mysql_connection_limit: Option<u32>,
    regbot_status_check_interval: Option<u64>,
    regbot_max_initial_delay: Option<u64>,
    jambones_regbot_default_expires_interval: Option<u32>,
    jambones_regbot_min_expires_interval: Option<u32>,
    jambones_regbot_contact_use_ip: Option<bool>,
    jambones_regbot_user_agent: Option<String>,
    register_response_remove: Option<String>,
    jambones_regbot_batch_size: Option<usize>,
    jambones_regbot_batch_sleep_ms: Option<u64>,
    jambones_regbot_start_delay_ms: Option<u64>,
    jambones_local_sip_domain: Option<String>,
    send_options_ping_interval: Option<u64>,
    options_ping_ttl: Option<u64>,
    options_response_remove: Option<String>,
    expires_interval: Option<u64>,
    check_expires_interval: Option<u64>,
    sbc_public_address_keep_alive_in_milisecond: Option<u64>,
    jambones_nat_expires: Option<u32>,
    jambones_shutdown_grace_ms: Option<u64>,
}

impl SidecarConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        let source = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        Self::from_source(source)
    }

    /// Load configuration from an already-built `config::Config`
    pub fn from_source(source: config::Config) -> Result<Self> {
        let raw: RawEnv = source.try_deserialize()?;
        Self::from_raw(raw)
    }

    /// Reject settings that would stall or spin the periodic tasks.
    ///
    /// Environment values are already defaulted; this catches settings
    /// built in code.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("regbot check interval", self.regbot.check_interval),
            ("options ping interval", self.options.interval),
            ("options blacklist ttl", self.options.blacklist_ttl),
            ("presence expires", self.presence.expires),
            ("presence check interval", self.presence.check_interval),
            ("sbc address keep-alive", self.sbc_address_keepalive),
        ];
        match periods.iter().find(|(_, period)| period.is_zero()) {
            Some((name, _)) => Err(SidecarError::config(format!("{} must be non-zero", name))),
            None => Ok(()),
        }
    }

    fn from_raw(raw: RawEnv) -> Result<Self> {
        let defaults = SidecarConfig::default();
        let regbot_defaults = RegbotSettings::default();

        let redis_url = match raw.jambones_redis_host {
            Some(host) => format!("redis://{}:{}", host, raw.jambones_redis_port.unwrap_or(6379)),
            None => defaults.redis_url,
        };

        let mysql = match (
            raw.jambones_mysql_host,
            raw.jambones_mysql_user,
            raw.jambones_mysql_password,
            raw.jambones_mysql_database,
        ) {
            (Some(host), Some(user), Some(password), Some(database)) => Some(MySqlConfig {
                host,
                port: raw.jambones_mysql_port.unwrap_or(3306),
                user,
                password,
                database,
                connection_limit: raw.jambones_mysql_connection_limit.unwrap_or(10),
            }),
            (None, None, None, None) => None,
            _ => {
                return Err(SidecarError::config(
                    "missing JAMBONES_MYSQL_XXX env vars (host, user, password and database are all required)",
                ));
            }
        };

        let regbot = RegbotSettings {
            check_interval: positive(raw.regbot_status_check_interval)
                .map(Duration::from_secs)
                .unwrap_or(regbot_defaults.check_interval),
            max_initial_delay: raw
                .regbot_max_initial_delay
                .map(Duration::from_secs)
                .unwrap_or(regbot_defaults.max_initial_delay),
            default_expires: raw
                .jambones_regbot_default_expires_interval
                .filter(|v| *v > 0)
                .unwrap_or(regbot_defaults.default_expires),
            min_expires: raw
                .jambones_regbot_min_expires_interval
                .filter(|v| *v > 0)
                .unwrap_or(regbot_defaults.min_expires),
            contact_use_ip: raw.jambones_regbot_contact_use_ip.unwrap_or(false),
            user_agent: raw
                .jambones_regbot_user_agent
                .unwrap_or(regbot_defaults.user_agent),
            remove_codes: parse_status_codes(
                "REGISTER_RESPONSE_REMOVE",
                raw.register_response_remove.as_deref(),
            )?,
            batch_size: raw.jambones_regbot_batch_size.unwrap_or(0),
            batch_sleep: Duration::from_millis(raw.jambones_regbot_batch_sleep_ms.unwrap_or(0)),
            start_delay: Duration::from_millis(raw.jambones_regbot_start_delay_ms.unwrap_or(0)),
            local_sip_domain: raw.jambones_local_sip_domain.filter(|d| !d.is_empty()),
        };

        let options = OptionsPingSettings {
            interval: Duration::from_secs(positive(raw.send_options_ping_interval).unwrap_or(60)),
            blacklist_ttl: Duration::from_secs(positive(raw.options_ping_ttl).unwrap_or(300)),
            remove_codes: parse_status_codes(
                "OPTIONS_RESPONSE_REMOVE",
                raw.options_response_remove.as_deref(),
            )?,
        };

        let presence = PresenceSettings {
            expires: Duration::from_millis(positive(raw.expires_interval).unwrap_or(60_000)),
            check_interval: Duration::from_millis(positive(raw.check_expires_interval).unwrap_or(20_000)),
        };

        Ok(Self {
            cluster_id: raw
                .jambones_cluster_id
                .filter(|c| !c.is_empty())
                .unwrap_or(defaults.cluster_id),
            log_level: raw
                .jambones_loglevel
                .as_deref()
                .map(parse_log_level)
                .transpose()?
                .unwrap_or(defaults.log_level),
            socket_path: raw
                .sbc_socket_path
                .map(PathBuf::from)
                .unwrap_or(defaults.socket_path),
            redis_url,
            mysql,
            regbot,
            options,
            presence,
            sbc_address_keepalive: positive(raw.sbc_public_address_keep_alive_in_milisecond)
                .map(Duration::from_millis)
                .unwrap_or(defaults.sbc_address_keepalive),
            nat_expires: raw
                .jambones_nat_expires
                .filter(|v| *v > 0)
                .unwrap_or(defaults.nat_expires),
            shutdown_grace: raw
                .jambones_shutdown_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_grace),
        })
    }
}

/// Zero reads as unset, so the default applies
fn positive(value: Option<u64>) -> Option<u64> {
    value.filter(|v| *v > 0)
}

/// Parse a comma separated list of SIP status codes, e.g. `"403, 503"`.
pub fn parse_status_codes(var: &str, value: Option<&str>) -> Result<Vec<u16>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };

    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>()
                .ok()
                .filter(|code| (100..700).contains(code))
                .ok_or_else(|| SidecarError::config(format!("{}: invalid status code '{}'", var, s)))
        })
        .collect()
}
