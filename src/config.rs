//! Configuration for the mirror.

use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{
    logging::{FileLogging, LogFilter},
    proxy::RateLimit,
};

const ENV_DATA_DIR: &str = "AT_MIRROR_DATA_DIR";
const ENV_CONFIG_DIR: &str = "AT_MIRROR_CONFIG_DIR";
const ENV_FILE_RUST_LOG: &str = "AT_MIRROR_FILE_RUST_LOG";

/// Name of the optional config file in the config directory.
pub const CONFIG_FILE_NAME: &str = "at-mirror.config.toml";

/// File name of the relational store inside the data directory.
pub const STORE_FILE_NAME: &str = "mirror.redb";

/// Mirror configuration.
///
/// Loaded from a TOML file with [`Config::load`]. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where repositories and the store live. Overridden by `AT_MIRROR_DATA_DIR`.
    pub data_dir: Option<PathBuf>,
    /// Bind address on which to serve Prometheus metrics.
    pub metrics_addr: Option<SocketAddr>,
    /// Configuration for the logfile of long running commands.
    pub file_logs: FileLogging,
    pub plc: PlcConfig,
    pub proxy: ProxyConfig,
    pub backfill: BackfillConfig,
    pub run: RunConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            metrics_addr: None,
            file_logs: FileLogging::default(),
            plc: PlcConfig::default(),
            proxy: ProxyConfig::default(),
            backfill: BackfillConfig::default(),
            run: RunConfig::default(),
        }
    }
}

/// PLC log mirror settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlcConfig {
    /// Base URL of the PLC directory.
    pub upstream: Url,
    /// Skip entries that fail validation instead of storing them.
    pub filter: bool,
    /// Hosting-server endpoints whose operations are never stored.
    pub denylist: Vec<String>,
    /// Entries requested per export page.
    pub page_size: usize,
    /// Sleep between passes.
    #[serde(with = "humantime_serde")]
    pub pass_delay: Duration,
    /// The mirror counts as caught up once its newest entry is this close to now.
    #[serde(with = "humantime_serde")]
    pub caught_up_threshold: Duration,
    /// Export requests per second while behind.
    pub backfill_rate: f64,
    /// Export requests per second once caught up.
    pub caught_up_rate: f64,
    pub burst: u32,
    /// Fetch retries on the same cursor before a pass gives up.
    pub max_retries: usize,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            upstream: Url::parse("https://plc.directory").expect("valid url"),
            filter: true,
            denylist: vec!["https://uwu".to_string(), "https://pds.trump.com".to_string()],
            page_size: 1000,
            pass_delay: Duration::from_secs(10),
            caught_up_threshold: Duration::from_secs(10 * 60),
            backfill_rate: 450.0 / 300.0,
            caught_up_rate: 0.2,
            burst: 4,
            max_retries: 5,
        }
    }
}

/// Outbound HTTP settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Requests per second to a host before it advertises its own limits.
    pub default_rate: f64,
    pub default_burst: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_rate: RateLimit::DEFAULT.rate,
            default_burst: RateLimit::DEFAULT.burst,
            timeout: Duration::from_secs(60),
            user_agent: concat!("at-mirror/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn default_limit(&self) -> RateLimit {
        RateLimit::new(self.default_rate, self.default_burst)
    }
}

/// Batch job settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackfillConfig {
    /// Units processed concurrently.
    pub parallelism: usize,
    /// Units selected per batch.
    pub batch_size: usize,
    /// Project new records into the per-account index after each repo sync.
    pub index_records: bool,
    /// Download missing blobs after each repo sync.
    pub sync_blobs: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            parallelism: 16,
            batch_size: 1000,
            index_records: false,
            sync_blobs: false,
        }
    }
}

/// What the long running `run` command does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub plc_mirror: bool,
    pub repo_mirror: bool,
    /// Repositories not attempted for this long are synced again.
    #[serde(with = "humantime_serde")]
    pub repo_mirror_interval: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            plc_mirror: true,
            repo_mirror: false,
            repo_mirror_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl Config {
    /// Loads the config.
    ///
    /// If `file` is `Some` the configuration is read from it. Otherwise the
    /// default config file is used if present, else the defaults.
    pub async fn load(file: Option<&Path>) -> Result<Config> {
        let default_config = config_dir()?.join(CONFIG_FILE_NAME);

        let config_file = match file {
            Some(file) => Some(file),
            None => default_config
                .exists()
                .then_some(default_config.as_path()),
        };
        let mut config = if let Some(file) = config_file {
            debug!("loading config from {:?}", file);
            let s = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            Self::load_toml(&s)?
        } else {
            debug!("using default config");
            Self::default()
        };

        if let Some(env_filter) = env_file_rust_log().transpose()? {
            config.file_logs.filter = env_filter;
        }
        Ok(config)
    }

    fn load_toml(s: &str) -> Result<Config> {
        let config = toml::from_str(s)?;
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(val) = env::var_os(ENV_DATA_DIR) {
            return Ok(PathBuf::from(val));
        }
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let path = dirs_next::data_dir().ok_or_else(|| {
            anyhow!("operating environment provides no directory for application data")
        })?;
        Ok(path.join("at-mirror"))
    }

    /// Get the path to the store database file.
    pub fn store_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(STORE_FILE_NAME))
    }
}

/// Directory holding the config file. Overridden by `AT_MIRROR_CONFIG_DIR`.
pub fn config_dir() -> Result<PathBuf> {
    if let Some(val) = env::var_os(ENV_CONFIG_DIR) {
        return Ok(PathBuf::from(val));
    }
    let cfg = dirs_next::config_dir()
        .ok_or_else(|| anyhow!("operating environment provides no directory for configuration"))?;
    Ok(cfg.join("at-mirror"))
}

fn env_file_rust_log() -> Option<Result<LogFilter>> {
    match env::var(ENV_FILE_RUST_LOG) {
        Ok(s) => Some(
            LogFilter::from_str(&s).with_context(|| format!("invalid {ENV_FILE_RUST_LOG}")),
        ),
        Err(e) => match e {
            env::VarError::NotPresent => None,
            e @ env::VarError::NotUnicode(_) => Some(Err(e.into())),
        },
    }
}
