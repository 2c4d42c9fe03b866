//! Configuration for the server

use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    cache::CacheConfig, dht::DhtConfig, http::HttpConfig, republish::DEFAULT_REPUBLISH_SCHEDULE,
    service::RecordsConfig,
};

const DEFAULT_METRICS_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9117);

/// Environment variable to override the data directory.
pub const DATA_DIR_ENV: &str = "PKARR_RELAY_DATA_DIR";

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse {}", path.display()))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("operating environment provides no directory for application data"))]
    NoDataDir,
}

/// Server configuration
///
/// The config is usually loaded from a file with [`Self::load`]. Missing sections fall
/// back to their defaults.
///
/// The struct also implements [`Default`] which creates a config suitable for local development
/// and testing.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Config for the HTTP server
    pub http: HttpConfig,
    /// Where records are stored.
    pub store: StoreConfig,
    /// Config for the resolution cache.
    pub cache: CacheConfig,
    /// Limits for publishing and resolving records.
    pub records: RecordsConfig,
    /// Config for the DHT client.
    pub dht: DhtConfig,
    /// Config for republishing stored records.
    pub republish: RepublishConfig,
    /// Config for the metrics server.
    ///
    /// The metrics server is started by default. To disable the metrics server, set to
    /// `Some(MetricsConfig::disabled())`.
    pub metrics: Option<MetricsConfig>,
}

/// Where records are stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the database file, defaults to `records-1.db` in the data directory.
    pub path: Option<PathBuf>,
    /// Keep records in memory only.
    pub in_memory: bool,
}

/// When stored records are put back onto the DHT.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepublishConfig {
    /// When passes run, as a cron expression such as `0 */3 * * *` or a period such
    /// as `3h`.
    pub schedule: String,
    /// Number of records read from the store at once.
    pub page_size: usize,
}

impl Default for RepublishConfig {
    fn default() -> Self {
        Self {
            schedule: DEFAULT_REPUBLISH_SCHEDULE.to_string(),
            page_size: crate::store::DEFAULT_PAGE_SIZE,
        }
    }
}

/// The config for the metrics server.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Set to true to disable the metrics server.
    pub disabled: bool,
    /// Optionally set a custom address to bind to.
    pub bind_addr: Option<SocketAddr>,
}

impl MetricsConfig {
    /// Disable the metrics server.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            bind_addr: None,
        }
    }
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        let config: Config = toml::from_str(&s).context(ParseSnafu { path })?;
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> Result<PathBuf, ConfigError> {
        let dir = if let Some(val) = env::var_os(DATA_DIR_ENV) {
            PathBuf::from(val)
        } else {
            let path = dirs_next::data_dir().context(NoDataDirSnafu)?;
            path.join("pkarr-relay")
        };
        Ok(dir)
    }

    /// Get the path to the record database file.
    pub fn record_store_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.store.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("records-1.db")),
        }
    }

    /// Get the address where the metrics server should be bound, if set.
    pub(crate) fn metrics_addr(&self) -> Option<SocketAddr> {
        match &self.metrics {
            None => Some(DEFAULT_METRICS_ADDR),
            Some(conf) => match conf.disabled {
                true => None,
                false => Some(conf.bind_addr.unwrap_or(DEFAULT_METRICS_ADDR)),
            },
        }
    }
}
