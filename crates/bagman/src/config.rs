//! Configuration file support (`bagman.toml`), grounded on the teacher's
//! `.shipper.toml` loader in `config.rs`: a serde/toml struct tree with
//! `#[serde(default)]` on every section, validated once after load, and
//! merged against CLI overrides via an `Option`-fields-win pattern.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bagman_retry::{RetryPolicy, RetryStrategyConfig, RetryStrategyType};
use serde::{Deserialize, Serialize};

use crate::types::{deserialize_duration, serialize_duration};

/// Per-topic attempt budget and visibility-timeout hint (spec §7: "the
/// retry-budget-per-topic modeled as `max_attempts: u32`").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_visibility_timeout"
    )]
    pub visibility_timeout: Duration,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            visibility_timeout: default_visibility_timeout(),
        }
    }
}

fn default_max_attempts() -> u32 {
    6
}

fn default_visibility_timeout() -> Duration {
    Duration::from_secs(60 * 90)
}

/// Bucket-naming configuration (spec §3 `S3File::institution_domain`/
/// `bag_name`, §4.5 intake discovery, §4.10 restoration bucket).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Permanent-storage (preservation) bucket, region A.
    #[serde(default = "default_preservation_bucket")]
    pub preservation_bucket: String,
    /// Secondary-region replication bucket.
    #[serde(default = "default_replication_bucket")]
    pub replication_bucket: String,
    /// Institution domains Bagman discovers intake buckets for
    /// (`aptrust.receiving.<domain>`, spec §3 `receiving_bucket_for`).
    #[serde(default)]
    pub institutions: Vec<String>,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            preservation_bucket: default_preservation_bucket(),
            replication_bucket: default_replication_bucket(),
            institutions: Vec::new(),
        }
    }
}

fn default_preservation_bucket() -> String {
    "aptrust.preservation.storage".to_string()
}

fn default_replication_bucket() -> String {
    "aptrust.preservation.replication".to_string()
}

/// Concurrency knobs (spec §5: channel capacity conventions `workers × 10`,
/// `fetchers × 4`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_fetchers")]
    pub fetchers: usize,
    /// Prepare-stage channel capacity is `workers * channel_capacity_per_worker`.
    #[serde(default = "default_channel_capacity_per_worker")]
    pub channel_capacity_per_worker: usize,
    /// Fetch-stage channel capacity is `fetchers * fetch_channel_capacity_per_fetcher`.
    #[serde(default = "default_fetch_channel_capacity_per_fetcher")]
    pub fetch_channel_capacity_per_fetcher: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            fetchers: default_fetchers(),
            channel_capacity_per_worker: default_channel_capacity_per_worker(),
            fetch_channel_capacity_per_fetcher: default_fetch_channel_capacity_per_fetcher(),
        }
    }
}

fn default_workers() -> usize {
    8
}

fn default_fetchers() -> usize {
    4
}

fn default_channel_capacity_per_worker() -> usize {
    10
}

fn default_fetch_channel_capacity_per_fetcher() -> usize {
    4
}

/// Volume-arbiter configuration (spec §4.3). Because the workspace forbids
/// `unsafe`, the free-byte snapshot cannot be queried via a raw `statvfs`
/// binding; it must be supplied here (operator-provided, or read from a
/// platform-specific tool outside this crate) and is taken once at startup
/// per spec's own snapshot-only semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub working_dir: PathBuf,
    /// Free bytes available on `working_dir`'s filesystem at startup.
    pub initial_free_bytes: u64,
    /// A bag whose size exceeds this is "large" for the two-large-bag
    /// admission gate (spec §4.6).
    #[serde(default = "default_large_bag_threshold")]
    pub large_bag_threshold_bytes: u64,
    /// At most this many large bags fetch concurrently.
    #[serde(default = "default_max_concurrent_large_bags")]
    pub max_concurrent_large_bags: usize,
}

fn default_large_bag_threshold() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_max_concurrent_large_bags() -> usize {
    2
}

impl VolumeConfig {
    fn default_with_working_dir() -> Self {
        Self {
            working_dir: PathBuf::from("./bagman-work"),
            initial_free_bytes: 0,
            large_bag_threshold_bytes: default_large_bag_threshold(),
            max_concurrent_large_bags: default_max_concurrent_large_bags(),
        }
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self::default_with_working_dir()
    }
}

/// Cleanup-worker configuration (spec §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Delete the source tar from the intake bucket once it is fully
    /// recorded. Operators auditing ingest can set this `false` to keep
    /// intake buckets as a secondary copy.
    #[serde(default = "default_delete_on_success")]
    pub delete_on_success: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            delete_on_success: default_delete_on_success(),
        }
    }
}

fn default_delete_on_success() -> bool {
    true
}

/// Retry-policy configuration, mirroring the teacher's `RetryConfig`
/// (policy preset vs. explicit custom strategy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub policy: RetryPolicy,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_base_delay"
    )]
    pub base_delay: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_max_delay"
    )]
    pub max_delay: Duration,
    #[serde(default)]
    pub strategy: RetryStrategyType,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::Default,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            strategy: RetryStrategyType::Exponential,
            jitter: default_jitter(),
        }
    }
}

fn default_base_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(600)
}

fn default_jitter() -> f64 {
    0.3
}

impl RetryConfig {
    pub fn to_strategy_config(&self) -> RetryStrategyConfig {
        if self.policy == RetryPolicy::Custom {
            RetryStrategyConfig {
                strategy: self.strategy,
                max_attempts: self.max_attempts,
                base_delay: self.base_delay,
                max_delay: self.max_delay,
                jitter: self.jitter,
            }
        } else {
            self.policy.to_config()
        }
    }
}

/// Per-topic overrides (spec §6 topic table); topics not listed use
/// [`TopicConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopicsConfig {
    #[serde(default)]
    pub prepare: TopicConfig,
    #[serde(default)]
    pub store: TopicConfig,
    #[serde(default)]
    pub record: TopicConfig,
    #[serde(default)]
    pub cleanup: TopicConfig,
    #[serde(default)]
    pub replicate: TopicConfig,
    #[serde(default)]
    pub restore: TopicConfig,
    #[serde(default)]
    pub delete: TopicConfig,
    #[serde(default)]
    pub fixity: TopicConfig,
}

impl TopicsConfig {
    pub fn for_topic(&self, topic: &str) -> &TopicConfig {
        match topic {
            crate::topics::PREPARE_TOPIC => &self.prepare,
            crate::topics::STORE_TOPIC => &self.store,
            crate::topics::RECORD_TOPIC => &self.record,
            crate::topics::CLEANUP_TOPIC => &self.cleanup,
            crate::topics::REPLICATE_TOPIC => &self.replicate,
            crate::topics::RESTORE_TOPIC => &self.restore,
            crate::topics::DELETE_TOPIC => &self.delete,
            crate::topics::FIXITY_TOPIC => &self.fixity,
            _ => &self.prepare,
        }
    }
}

/// Top-level configuration loaded from `bagman.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BagmanConfig {
    #[serde(default)]
    pub buckets: BucketConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default = "VolumeConfig::default_with_working_dir")]
    pub volume: VolumeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Directory `statuslog`/`trouble` write under.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Base URL of the metadata registry's HTTP API.
    #[serde(default)]
    pub registry_api_base: Option<String>,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./bagman-logs")
}

/// CLI overrides that take precedence over `bagman.toml` values, mirroring
/// the teacher's `CliOverrides` (`Option` = "flag not passed").
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub workers: Option<usize>,
    pub fetchers: Option<usize>,
    pub working_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub registry_api_base: Option<String>,
    pub initial_free_bytes: Option<u64>,
}

impl BagmanConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: BagmanConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_workspace(workspace_root: &Path) -> Result<Option<Self>> {
        let path = workspace_root.join("bagman.toml");
        if !path.is_file() {
            return Ok(None);
        }
        Self::load_from_file(&path).map(Some)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency.workers == 0 {
            bail!("concurrency.workers must be greater than 0");
        }
        if self.concurrency.fetchers == 0 {
            bail!("concurrency.fetchers must be greater than 0");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be greater than 0");
        }
        if self.retry.base_delay.is_zero() {
            bail!("retry.base_delay must be greater than 0");
        }
        if self.retry.max_delay < self.retry.base_delay {
            bail!("retry.max_delay must be >= retry.base_delay");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            bail!("retry.jitter must be between 0.0 and 1.0");
        }
        if self.volume.max_concurrent_large_bags == 0 {
            bail!("volume.max_concurrent_large_bags must be greater than 0");
        }
        Ok(())
    }

    /// Merge CLI overrides in; `Option` fields win over file values when set.
    pub fn apply_overrides(mut self, cli: CliOverrides) -> Self {
        if let Some(workers) = cli.workers {
            self.concurrency.workers = workers;
        }
        if let Some(fetchers) = cli.fetchers {
            self.concurrency.fetchers = fetchers;
        }
        if let Some(dir) = cli.working_dir {
            self.volume.working_dir = dir;
        }
        if let Some(dir) = cli.log_dir {
            self.log_dir = dir;
        }
        if let Some(api_base) = cli.registry_api_base {
            self.registry_api_base = Some(api_base);
        }
        if let Some(free_bytes) = cli.initial_free_bytes {
            self.volume.initial_free_bytes = free_bytes;
        }
        self
    }

    /// `prepare`-stage channel capacity, per spec §5's `workers × 10` convention.
    pub fn prepare_channel_capacity(&self) -> usize {
        self.concurrency.workers * self.concurrency.channel_capacity_per_worker
    }

    /// Fetch-stage channel capacity, per spec §5's `fetchers × 4` convention.
    pub fn fetch_channel_capacity(&self) -> usize {
        self.concurrency.fetchers * self.concurrency.fetch_channel_capacity_per_fetcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = BagmanConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency.workers, 8);
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = BagmanConfig::default();
        config.concurrency.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_max_delay_below_base_delay() {
        let mut config = BagmanConfig::default();
        config.retry.base_delay = Duration::from_secs(10);
        config.retry.max_delay = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_toml_overrides_defaults() {
        let toml = r#"
[buckets]
preservation_bucket = "custom.preservation"
institutions = ["unc.edu", "ncsu.edu"]

[concurrency]
workers = 16
fetchers = 8

[volume]
working_dir = "/tmp/bagman"
initial_free_bytes = 1000000000

[retry]
policy = "conservative"
"#;
        let config: BagmanConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.buckets.preservation_bucket, "custom.preservation");
        assert_eq!(config.buckets.institutions, vec!["unc.edu", "ncsu.edu"]);
        assert_eq!(config.concurrency.workers, 16);
        assert_eq!(config.volume.working_dir, PathBuf::from("/tmp/bagman"));
        assert_eq!(config.retry.policy, RetryPolicy::Conservative);
    }

    #[test]
    fn cli_overrides_win_over_file_values() {
        let config = BagmanConfig::default();
        let cli = CliOverrides {
            workers: Some(2),
            ..Default::default()
        };
        let merged = config.apply_overrides(cli);
        assert_eq!(merged.concurrency.workers, 2);
        assert_eq!(merged.concurrency.fetchers, 4);
    }

    #[test]
    fn channel_capacities_follow_spec_conventions() {
        let config = BagmanConfig::default();
        assert_eq!(config.prepare_channel_capacity(), 8 * 10);
        assert_eq!(config.fetch_channel_capacity(), 4 * 4);
    }

    #[test]
    fn topics_config_falls_back_to_default_for_unknown_topic() {
        let topics = TopicsConfig::default();
        assert_eq!(topics.for_topic("nonsense").max_attempts, 6);
        assert_eq!(topics.for_topic(crate::topics::STORE_TOPIC).max_attempts, 6);
    }
}
