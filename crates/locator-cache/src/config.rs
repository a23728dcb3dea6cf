use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "locators".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning the product image cache.
///
/// These differ from [`StoriesCacheConfig`] in the [`Default`] implementation.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ProductsCacheConfig {
    /// How long a resolved locator stays valid.
    #[serde(with = "humantime_serde")]
    pub cache_duration: Duration,

    /// Locator handed out when a resolution fails or nothing is cached yet.
    pub placeholder: String,

    /// Maximum number of concurrent resolutions during a preload.
    pub preload_concurrency: usize,
}

impl Default for ProductsCacheConfig {
    fn default() -> Self {
        Self {
            cache_duration: Duration::from_secs(3600 * 24),
            placeholder: "/api/placeholder/800/500".into(),
            preload_concurrency: 5,
        }
    }
}

/// Fine-tuning the story image cache.
///
/// Story locators are short-lived, so they expire much sooner than product locators.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct StoriesCacheConfig {
    /// How long a resolved locator stays valid.
    #[serde(with = "humantime_serde")]
    pub cache_duration: Duration,

    /// Locator handed out when a resolution fails or nothing is cached yet.
    pub placeholder: String,

    /// Maximum number of concurrent resolutions during a preload.
    pub preload_concurrency: usize,
}

impl Default for StoriesCacheConfig {
    fn default() -> Self {
        Self {
            cache_duration: Duration::from_secs(30 * 60),
            placeholder: "/api/placeholder/100/100".into(),
            preload_concurrency: 10,
        }
    }
}

/// Struct to treat all cache configs identical in cache code.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CacheConfig {
    Products(ProductsCacheConfig),
    Stories(StoriesCacheConfig),
}

impl CacheConfig {
    pub fn cache_duration(&self) -> Duration {
        match self {
            Self::Products(cfg) => cfg.cache_duration,
            Self::Stories(cfg) => cfg.cache_duration,
        }
    }

    pub fn placeholder(&self) -> &str {
        match self {
            Self::Products(cfg) => &cfg.placeholder,
            Self::Stories(cfg) => &cfg.placeholder,
        }
    }

    /// The preload concurrency, clamped to at least `1`.
    pub fn preload_concurrency(&self) -> usize {
        let concurrency = match self {
            Self::Products(cfg) => cfg.preload_concurrency,
            Self::Stories(cfg) => cfg.preload_concurrency,
        };
        concurrency.max(1)
    }
}

impl From<ProductsCacheConfig> for CacheConfig {
    fn from(source: ProductsCacheConfig) -> Self {
        Self::Products(source)
    }
}

impl From<StoriesCacheConfig> for CacheConfig {
    fn from(source: StoriesCacheConfig) -> Self {
        Self::Stories(source)
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configure how long product image locators are cached for.
    pub products: ProductsCacheConfig,
    /// Configure how long story image locators are cached for.
    pub stories: StoriesCacheConfig,
}

/// Configuration of the remote endpoint that turns storage keys into locators.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// The presigning endpoint. The storage key is passed as the `key` query parameter.
    pub url: Option<Url>,

    /// The timeout for a whole resolution request.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// The timeout for establishing a connection to the endpoint.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to persist resolved locators in. Default is not to persist.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune cache expiry
    pub caches: CacheConfigs,

    /// The endpoint used to resolve storage keys.
    pub resolver: ResolverConfig,

    /// How often expired locators are swept from the caches.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this means no persistence should happen
    /// and this returns None.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            resolver: ResolverConfig::default(),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
