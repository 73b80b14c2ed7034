//! Service configuration.

use crate::error::{LastPriceError, Result};
use ::config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Instruments accepted when [`ServiceConfig::with_default_instruments`] is used.
pub const DEFAULT_INSTRUMENTS: &[&str] = &["AIR", "TEAM", "NEE", "SAF", "TKWY", "VOW", "RDSA"];

/// Prefix of the environment variables read by [`ServiceConfig::from_env`],
/// joined to the field name with `_` (`LASTPRICE_MAX_KEY_LEN`).
pub const ENV_PREFIX: &str = "LASTPRICE";

/// Service configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Max key length in bytes.
    /// Default: 32
    pub max_key_len: usize,

    /// Max payload size in bytes.
    /// Default: 64KB
    pub max_payload_bytes: usize,

    /// Instruments producers may publish and consumers may query
    /// (None = any well-formed key).
    pub supported_instruments: Option<Vec<String>>,

    /// Producers allowed to publish (None = any producer).
    pub authorized_producers: Option<Vec<String>>,

    /// Soft cap on concurrently open batch runs.
    /// Default: 500
    pub max_active_batch_runs: usize,

    /// How often abandoned batch runs are swept.
    /// Default: 60s
    pub batch_cleanup_interval_ms: u64,

    /// Batch runs idle for longer than this are abandoned.
    /// Default: 5s
    pub abandoned_batch_run_timeout_ms: u64,

    /// Capacity of the channel sink created by `attach_channel`.
    /// Default: 64
    pub sink_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_key_len: 32,
            max_payload_bytes: 64 * 1024,
            supported_instruments: None,
            authorized_producers: None,
            max_active_batch_runs: 500,
            batch_cleanup_interval_ms: 60_000,
            abandoned_batch_run_timeout_ms: 5_000,
            sink_capacity: 64,
        }
    }
}

impl ServiceConfig {
    /// Restrict instruments to [`DEFAULT_INSTRUMENTS`].
    pub fn with_default_instruments(mut self) -> Self {
        self.supported_instruments = Some(DEFAULT_INSTRUMENTS.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read `LASTPRICE_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_environment(Self::environment())
    }

    /// Same as [`from_env`](Self::from_env) over an explicit variable list.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: ::config::Map<String, String> = vars.into_iter().collect();
        Self::from_environment(Self::environment().source(Some(vars)))
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("supported_instruments")
            .with_list_parse_key("authorized_producers")
    }

    fn from_environment(environment: Environment) -> Result<Self> {
        let mut config: Self = Config::builder()
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        config.supported_instruments = config.supported_instruments.map(tidy_list);
        config.authorized_producers = config.authorized_producers.map(tidy_list);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_key_len", self.max_key_len as u64),
            ("max_payload_bytes", self.max_payload_bytes as u64),
            ("max_active_batch_runs", self.max_active_batch_runs as u64),
            ("batch_cleanup_interval_ms", self.batch_cleanup_interval_ms),
            ("abandoned_batch_run_timeout_ms", self.abandoned_batch_run_timeout_ms),
            ("sink_capacity", self.sink_capacity as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(LastPriceError::InvalidConfig(format!("{} must be positive", name)));
        }
        Ok(())
    }

    pub fn batch_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.batch_cleanup_interval_ms)
    }

    pub fn abandoned_batch_run_timeout(&self) -> Duration {
        Duration::from_millis(self.abandoned_batch_run_timeout_ms)
    }
}

/// Trim list entries and drop empty ones (`"AIR, VOW,,"`).
fn tidy_list(list: Vec<String>) -> Vec<String> {
    list.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
