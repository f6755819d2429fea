//! Transfer subsystem configuration.
//!
//! Every field carries a default so callers can load a partial file (or none
//! at all) and still get the stock behaviour.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};

/// Environment variable prefix for overrides, e.g.
/// `SNAPSHARE__UPLOAD__BATCH_SIZE=4`.
pub const ENV_PREFIX: &str = "SNAPSHARE";

/// Global knobs for the transfer core.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Batch upload sizing, retry and progress smoothing.
    pub upload: UploadConfig,
    /// Bulk save-to-library settings.
    pub download: DownloadConfig,
    /// Per-request timeouts for the blob transfer client.
    pub timeouts: TimeoutConfig,
    /// Local cache TTL and location.
    pub cache: CacheConfig,
    /// Background preloading after a feed load.
    pub preload: PreloadConfig,
    /// Change-feed reconnect policy.
    pub subscription: SubscriptionConfig,
}

impl TransferConfig {
    /// Load from an optional TOML file layered under environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let cfg: TransferConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload.batch_size == 0 {
            return Err(TransferError::Config(
                "upload.batch_size must be at least 1".into(),
            ));
        }
        let p = &self.upload.progress;
        if !(p.ceiling > 0.0 && p.ceiling < 1.0) {
            return Err(TransferError::Config(format!(
                "upload.progress.ceiling must be in (0, 1), got {}",
                p.ceiling
            )));
        }
        if !(p.smoothing_factor > 0.0 && p.smoothing_factor <= 1.0) {
            return Err(TransferError::Config(format!(
                "upload.progress.smoothing_factor must be in (0, 1], got {}",
                p.smoothing_factor
            )));
        }
        if p.tick_ms == 0 {
            return Err(TransferError::Config(
                "upload.progress.tick_ms must be positive".into(),
            ));
        }
        if self.preload.priority_count > 0 && self.preload.priority_concurrency == 0
        {
            return Err(TransferError::Config(
                "preload.priority_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    /// Uploads in flight at once.
    pub batch_size: usize,
    /// Pause between successive rounds of the queue.
    pub inter_batch_delay_ms: u64,
    /// Quality hint forwarded to the blob store (0..=1).
    pub quality: f32,
    pub retry: RetryConfig,
    pub progress: ProgressConfig,
}

impl UploadConfig {
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            inter_batch_delay_ms: 500,
            quality: 0.8,
            retry: RetryConfig::default(),
            progress: ProgressConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Re-attempts granted after the first failure.
    pub max_retries: u32,
    /// Delay before the first re-attempt; doubles per attempt.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 4_000,
        }
    }
}

/// Smoothed progress bar tuning. The values shape a UI approximation, not a
/// byte count.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProgressConfig {
    pub tick_ms: u64,
    /// Asymptote approached while jobs are still running.
    pub ceiling: f32,
    /// Fraction of the remaining gap closed per tick.
    pub smoothing_factor: f32,
    /// How long a finished batch stays visible before it is retired.
    pub completion_linger_ms: u64,
}

impl ProgressConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn completion_linger(&self) -> Duration {
        Duration::from_millis(self.completion_linger_ms)
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            tick_ms: 150,
            ceiling: 0.95,
            smoothing_factor: 0.15,
            completion_linger_ms: 500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DownloadConfig {
    /// Album that saved photos are filed under in the device library.
    pub album_name: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            album_name: "Snapshare".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub upload_secs: u64,
    pub download_secs: u64,
}

impl TimeoutConfig {
    pub fn upload(&self) -> Duration {
        Duration::from_secs(self.upload_secs)
    }

    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upload_secs: 30,
            download_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries older than this are treated as misses.
    pub ttl_secs: u64,
    /// Directory for cached files; the platform cache dir when unset.
    pub directory: Option<std::path::PathBuf>,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 7 * 24 * 60 * 60,
            directory: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PreloadConfig {
    /// Most recent items fetched first, concurrently.
    pub priority_count: usize,
    pub priority_concurrency: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            priority_count: 12,
            priority_concurrency: 4,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Reconnect attempts after an `Error`, before giving up.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl SubscriptionConfig {
    /// Delay before reconnect attempt `attempt` (1-based): base doubled per
    /// prior attempt, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let scaled = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(scaled.min(self.backoff_max_ms))
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}
