//! Server configuration.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use serde::Deserialize;
use xdg::BaseDirectories;

use crate::storage::{LocalStorageConfig, S3StorageConfig};
use stash::pool::PoolAlias;

/// Application prefix in XDG base directories.
///
/// This will be concatenated into `$XDG_CONFIG_HOME/stash`.
const XDG_PREFIX: &str = "stash";

/// Environment variable storing the Base64-encoded TOML configuration.
///
/// This is useful for deploying to certain application platforms like Fly.io
const ENV_CONFIG_BASE64: &str = "STASH_SERVER_CONFIG_BASE64";

/// Index of the temporary destination.
///
/// Every new upload lands here before it is analyzed.
pub const TEMPORARY_DESTINATION: usize = 0;

/// Configuration for the Stash Server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Database connection.
    pub database: DatabaseConfig,

    /// Storage destinations.
    ///
    /// A destination is identified by its position in this list.
    /// The first one (index 0) is the temporary destination.
    pub destinations: Vec<DestinationConfig>,

    /// Index of the destination analyzed attachments are promoted to.
    #[serde(rename = "permanent-destination")]
    #[serde(default = "default_permanent_destination")]
    pub permanent_destination: usize,

    /// Size of each chunk of a multipart upload, in bytes.
    #[serde(rename = "chunk-size")]
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Background workers.
    #[serde(default = "Default::default")]
    pub workers: WorkersConfig,

    /// Pool settings.
    #[serde(default = "Default::default")]
    pub pools: PoolsConfig,

    /// Metadata cache.
    #[serde(default = "Default::default")]
    pub cache: CacheConfig,

    /// Content analysis.
    #[serde(default = "Default::default")]
    pub analysis: AnalysisConfig,

    /// Garbage collection.
    #[serde(rename = "garbage-collection")]
    #[serde(default = "Default::default")]
    pub garbage_collection: GarbageCollectionConfig,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL.
    pub url: String,

    /// Whether to enable sending of periodic heartbeat queries.
    ///
    /// If enabled, a heartbeat query will be sent every minute.
    #[serde(default = "default_db_heartbeat")]
    pub heartbeat: bool,
}

/// A storage destination.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum DestinationConfig {
    /// Local file storage.
    #[serde(rename = "local")]
    Local(LocalStorageConfig),

    /// S3 storage.
    #[serde(rename = "s3")]
    S3(S3StorageConfig),
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of concurrent analysis workers.
    #[serde(default = "default_analyze_workers")]
    pub analyze: usize,

    /// Number of concurrent byte deletion workers.
    #[serde(default = "default_deletion_workers")]
    pub deletion: usize,

    /// Capacity of each work queue.
    ///
    /// Publishers wait when a queue is full.
    #[serde(rename = "queue-capacity")]
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Pool settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolsConfig {
    /// Well-known aliases that resolve to another pool.
    ///
    /// For example, `{ avatar = "interactive" }` makes uploads
    /// to "avatar" land in the "interactive" pool.
    #[serde(default = "HashMap::new")]
    pub aliases: HashMap<String, PoolAlias>,

    /// Accepted values of the usage tag.
    ///
    /// If empty, any usage is accepted.
    #[serde(rename = "accepted-usages")]
    #[serde(default = "Vec::new")]
    pub accepted_usages: Vec<String>,
}

/// Metadata cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum number of entries per kind of record.
    #[serde(default = "default_cache_capacity")]
    pub capacity: u64,

    /// Time-to-live of entries.
    #[serde(with = "humantime_serde", default = "default_cache_ttl")]
    pub ttl: Duration,
}

/// Content analysis configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Path to the `ffprobe` binary.
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,

    /// Time limit of a single probe.
    #[serde(rename = "probe-timeout")]
    #[serde(with = "humantime_serde", default = "default_probe_timeout")]
    pub probe_timeout: Duration,
}

/// Garbage collection config.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GarbageCollectionConfig {
    /// The frequency to mark expired attachments at.
    ///
    /// If zero, automatic garbage collection is disabled, but
    /// it can still be run manually with `stashd --mode garbage-collector-once`.
    #[serde(with = "humantime_serde", default = "default_gc_interval")]
    pub interval: Duration,

    /// The frequency to sweep marked attachments at.
    #[serde(rename = "sweep-interval")]
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,

    /// How long unfinished uploads are kept around.
    ///
    /// Attachments that never received their bytes and fragments
    /// that were never completed are cleaned up after this period.
    #[serde(rename = "staging-ttl")]
    #[serde(with = "humantime_serde", default = "default_staging_ttl")]
    pub staging_ttl: Duration,
}

impl Config {
    /// Checks the configuration for inconsistencies.
    pub fn validate(&self) -> Result<()> {
        if self.destinations.len() < 2 {
            return Err(anyhow!(
                "At least two destinations (temporary and permanent) must be configured"
            ));
        }

        if self.permanent_destination == TEMPORARY_DESTINATION {
            return Err(anyhow!(
                "The permanent destination cannot be the temporary destination"
            ));
        }

        if self.permanent_destination >= self.destinations.len() {
            return Err(anyhow!(
                "The permanent destination {} does not exist",
                self.permanent_destination
            ));
        }

        if self.chunk_size == 0 {
            return Err(anyhow!("The chunk size must not be zero"));
        }

        if self.workers.analyze == 0 || self.workers.deletion == 0 || self.workers.queue_capacity == 0 {
            return Err(anyhow!("Worker counts and queue capacity must not be zero"));
        }

        Ok(())
    }
}

impl DestinationConfig {
    /// Returns the human-readable label.
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Local(c) => c.label.as_deref(),
            Self::S3(c) => c.label.as_deref(),
        }
    }

    /// Returns the region tag used for boost selection.
    pub fn region(&self) -> Option<&str> {
        match self {
            Self::Local(c) => c.region.as_deref(),
            Self::S3(c) => Some(&c.region),
        }
    }

    /// Returns whether the destination accepts boost copies.
    pub fn is_boost(&self) -> bool {
        match self {
            Self::Local(c) => c.is_boost,
            Self::S3(c) => c.is_boost,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            analyze: default_analyze_workers(),
            deletion: default_deletion_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl: default_cache_ttl(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            ffprobe: default_ffprobe(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

impl Default for GarbageCollectionConfig {
    fn default() -> Self {
        Self {
            interval: default_gc_interval(),
            sweep_interval: default_sweep_interval(),
            staging_ttl: default_staging_ttl(),
        }
    }
}

fn default_permanent_destination() -> usize {
    1
}

fn default_chunk_size() -> u64 {
    5 * 1024 * 1024
}

fn default_db_heartbeat() -> bool {
    false
}

fn default_analyze_workers() -> usize {
    4
}

fn default_deletion_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    256
}

fn default_cache_capacity() -> u64 {
    10_000
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_gc_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_staging_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

pub fn load_config_from_path(path: &Path) -> Result<Config> {
    tracing::info!("Using configurations: {:?}", path);

    let config = std::fs::read_to_string(path)?;
    load_config_from_str(&config)
}

pub fn load_config_from_str(s: &str) -> Result<Config> {
    let config: Config = toml::from_str(s)?;
    config.validate()?;

    Ok(config)
}

/// Loads the configuration in the standard order of precedence.
///
/// 1. The path passed in
/// 2. The `STASH_SERVER_CONFIG_BASE64` environment variable
/// 3. `$XDG_CONFIG_HOME/stash/server.toml`
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    if let Some(config_path) = config_path {
        load_config_from_path(config_path)
    } else if let Ok(config_env) = env::var(ENV_CONFIG_BASE64) {
        tracing::info!("Using configurations from environment variable");

        let decoded = String::from_utf8(BASE64_STANDARD.decode(config_env.as_bytes())?)?;
        load_config_from_str(&decoded)
    } else {
        let config_path = get_xdg_config_path()?;

        if !config_path.exists() {
            return Err(anyhow!(
                "No configuration file found at {:?}",
                config_path
            ));
        }

        load_config_from_path(&config_path)
    }
}

pub fn get_xdg_config_path() -> Result<PathBuf> {
    let xdg_dirs = BaseDirectories::with_prefix(XDG_PREFIX)?;
    let config_path = xdg_dirs.place_config_file("server.toml")?;

    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [database]
        url = "sqlite://stash.db"

        [[destinations]]
        type = "local"
        path = "/var/lib/stash/temporary"

        [[destinations]]
        type = "s3"
        label = "Primary"
        region = "us-east-1"
        bucket = "stash"
        endpoint = "https://s3.example.com"
    "#;

    #[test]
    fn test_defaults() {
        let config = load_config_from_str(MINIMAL).unwrap();

        assert_eq!(1, config.permanent_destination);
        assert_eq!(5 * 1024 * 1024, config.chunk_size);
        assert_eq!(4, config.workers.analyze);
        assert_eq!(2, config.workers.deletion);
        assert_eq!(256, config.workers.queue_capacity);
        assert_eq!(Duration::from_secs(3600), config.cache.ttl);
        assert_eq!(Duration::from_secs(10), config.analysis.probe_timeout);
        assert_eq!(Duration::from_secs(3600), config.garbage_collection.staging_ttl);

        assert_eq!(None, config.destinations[0].region());
        assert_eq!(Some("us-east-1"), config.destinations[1].region());
        assert_eq!(Some("Primary"), config.destinations[1].label());
        assert!(!config.destinations[1].is_boost());
    }

    #[test]
    fn test_pools() {
        let s = format!(
            r#"
            {}
            [pools]
            accepted-usages = ["avatar", "banner"]

            [pools.aliases]
            avatar = "interactive"
            "#,
            MINIMAL
        );

        let config = load_config_from_str(&s).unwrap();
        assert_eq!(
            "interactive",
            config.pools.aliases.get("avatar").unwrap().as_str()
        );
        assert_eq!(vec!["avatar", "banner"], config.pools.accepted_usages);
    }

    #[test]
    fn test_validation() {
        let single = r#"
            [database]
            url = "sqlite://stash.db"

            [[destinations]]
            type = "local"
            path = "/tmp/stash"
        "#;
        load_config_from_str(single).unwrap_err();

        let temporary_as_permanent = format!("permanent-destination = 0\n{}", MINIMAL);
        load_config_from_str(&temporary_as_permanent).unwrap_err();

        let out_of_range = format!("permanent-destination = 5\n{}", MINIMAL);
        load_config_from_str(&out_of_range).unwrap_err();

        let zero_chunk = format!("chunk-size = 0\n{}", MINIMAL);
        load_config_from_str(&zero_chunk).unwrap_err();

        let unknown = format!("listen = \"[::]:8080\"\n{}", MINIMAL);
        load_config_from_str(&unknown).unwrap_err();
    }
}
