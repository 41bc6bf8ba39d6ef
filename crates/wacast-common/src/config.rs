//! Configuration for wacast

use crate::types::{contains_keyword, PhoneRules};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "WACAST_CONFIG";

/// Prefix of environment overrides, e.g. `WACAST__GATEWAY__API_TOKEN`
pub const ENV_PREFIX: &str = "WACAST";

/// Upper bound on the delay between two sends of one campaign
pub const MAX_SEND_RATE_SECONDS: f64 = 86_400.0;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Messaging gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Campaign dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Message content configuration
    #[serde(default)]
    pub messaging: MessagingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP API
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// WhatsApp gateway configuration
///
/// Instance id and token are credentials and normally arrive through
/// `WACAST__GATEWAY__INSTANCE_ID` / `WACAST__GATEWAY__API_TOKEN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway base URL
    #[serde(default = "default_gateway_url")]
    pub api_url: String,

    /// Gateway instance identifier
    pub instance_id: Option<String>,

    /// Gateway API token
    pub api_token: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_url: default_gateway_url(),
            instance_id: None,
            api_token: None,
            timeout_secs: default_gateway_timeout(),
        }
    }
}

fn default_gateway_url() -> String {
    "https://api.green-api.com".to_string()
}

fn default_gateway_timeout() -> u64 {
    30
}

/// What to do with tasks left in `sending` by a crashed loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Mark them failed once older than the orphan timeout
    #[default]
    Fail,
    /// Refuse to run until an operator reconciles them
    Manual,
}

/// Campaign dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Send rate used when a campaign does not specify one
    #[serde(default = "default_send_rate")]
    pub default_send_rate_seconds: f64,

    /// Country calling code for local numbers
    #[serde(default = "default_country_code")]
    pub country_code: String,

    /// Local trunk prefix
    #[serde(default = "default_trunk_prefix")]
    pub trunk_prefix: String,

    /// Age after which a `sending` task is considered orphaned
    #[serde(default = "default_orphan_timeout")]
    pub orphan_timeout_secs: u64,

    /// Orphan reconciliation policy
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,

    /// Poll interval of the schedule trigger
    #[serde(default = "default_trigger_poll")]
    pub trigger_poll_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_send_rate_seconds: default_send_rate(),
            country_code: default_country_code(),
            trunk_prefix: default_trunk_prefix(),
            orphan_timeout_secs: default_orphan_timeout(),
            orphan_policy: OrphanPolicy::default(),
            trigger_poll_secs: default_trigger_poll(),
        }
    }
}

impl DispatchConfig {
    /// Phone normalization rules derived from this configuration
    pub fn phone_rules(&self) -> PhoneRules {
        PhoneRules {
            country_code: self.country_code.clone(),
            trunk_prefix: self.trunk_prefix.clone(),
        }
    }
}

fn default_send_rate() -> f64 {
    5.0
}

fn default_country_code() -> String {
    "972".to_string()
}

fn default_trunk_prefix() -> String {
    "0".to_string()
}

fn default_orphan_timeout() -> u64 {
    300
}

fn default_trigger_poll() -> u64 {
    30
}

/// Message content configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Footer appended to messages that carry no opt-out instruction
    #[serde(default = "default_opt_out_footer")]
    pub opt_out_footer: String,

    /// Words that mark a message as already carrying an opt-out instruction
    #[serde(default = "default_opt_out_keywords")]
    pub opt_out_keywords: Vec<String>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            opt_out_footer: default_opt_out_footer(),
            opt_out_keywords: default_opt_out_keywords(),
        }
    }
}

fn default_opt_out_footer() -> String {
    "To stop receiving these messages, reply STOP or REMOVE".to_string()
}

fn default_opt_out_keywords() -> Vec<String> {
    ["stop", "remove", "unsubscribe", "הסר"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the first file found, layered with
    /// `WACAST__*` environment overrides
    pub fn load() -> crate::Result<Self> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let paths = [
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/wacast/config.toml"),
        ];
        let file = explicit.or_else(|| paths.into_iter().find(|p| p.exists()));

        let mut builder = ::config::Config::builder();
        if let Some(path) = &file {
            tracing::info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path.as_path()));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("messaging.opt_out_keywords")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> crate::Result<()> {
        match self.database.backend.as_str() {
            "postgres" if self.database.url.is_none() => {
                return Err(crate::Error::Config(
                    "database.url is required for the postgres backend".to_string(),
                ));
            }
            "postgres" | "memory" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "Unsupported database backend: {}",
                    other
                )));
            }
        }

        let rate = self.dispatch.default_send_rate_seconds;
        if !rate.is_finite() || !(0.0..=MAX_SEND_RATE_SECONDS).contains(&rate) {
            return Err(crate::Error::Config(format!(
                "dispatch.default_send_rate_seconds must be between 0 and {}, got {}",
                MAX_SEND_RATE_SECONDS, rate
            )));
        }

        if self.dispatch.orphan_timeout_secs <= self.gateway.timeout_secs {
            return Err(crate::Error::Config(format!(
                "dispatch.orphan_timeout_secs ({}) must exceed gateway.timeout_secs ({})",
                self.dispatch.orphan_timeout_secs, self.gateway.timeout_secs
            )));
        }

        if self.dispatch.country_code.is_empty()
            || !self.dispatch.country_code.chars().all(|c| c.is_ascii_digit())
        {
            return Err(crate::Error::Config(format!(
                "dispatch.country_code must be digits, got {:?}",
                self.dispatch.country_code
            )));
        }

        if self.messaging.opt_out_keywords.is_empty() {
            return Err(crate::Error::Config(
                "messaging.opt_out_keywords must not be empty".to_string(),
            ));
        }

        if !contains_keyword(
            &self.messaging.opt_out_footer,
            &self.messaging.opt_out_keywords,
        ) {
            return Err(crate::Error::Config(
                "messaging.opt_out_footer must contain one of the opt-out keywords".to_string(),
            ));
        }

        Ok(())
    }
}
