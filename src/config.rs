//! Configuration types for attachment-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Transfer behavior (concurrency, retries, temp storage)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Maximum transfers executing at once, process-wide (default: 4)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_transfers: usize,

    /// Retry policy for network failures and timeouts
    #[serde(default)]
    pub retry: RetryConfig,

    /// Timeout applied to each HTTP request (default: 60 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Directory for ciphertext, partial and decrypted temp files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: default_max_concurrent(),
            retry: RetryConfig::default(),
            request_timeout: default_request_timeout(),
            temp_dir: default_temp_dir(),
        }
    }
}

/// Retry configuration for transient failures
///
/// The defaults allow 16 attempts in total with a flat 250ms pause between them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, counting the first (default: 16)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 250 milliseconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 250 milliseconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 1.0, i.e. constant spacing)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// Fixed system size ceilings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest backup archive accepted (default: 10 GiB)
    #[serde(default = "default_backup_max_download_size")]
    pub backup_max_download_size_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            backup_max_download_size_bytes: default_backup_max_download_size(),
        }
    }
}

/// Origin configuration selected by a CDN number
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdnConfig {
    /// Base URL that remote paths are joined onto
    pub base_url: String,
}

impl CdnConfig {
    /// Config for the given base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

/// Main configuration for DownloadCoordinator
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Concurrency, retry and temp storage settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Fixed size ceilings
    #[serde(default)]
    pub limits: LimitsConfig,

    /// CDN origins keyed by CDN number
    #[serde(default = "default_cdns")]
    pub cdns: BTreeMap<u32, CdnConfig>,

    /// Capacity of the event broadcast channel (default: 1000)
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            limits: LimitsConfig::default(),
            cdns: default_cdns(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl Config {
    /// Check the configuration for values that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.transfer.max_concurrent_transfers == 0 {
            return Err(Error::Config {
                message: "max_concurrent_transfers must be at least 1".to_string(),
                key: Some("max_concurrent_transfers".to_string()),
            });
        }
        let multiplier = self.transfer.retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(Error::Config {
                message: format!("backoff_multiplier must be a positive number, got {multiplier}"),
                key: Some("backoff_multiplier".to_string()),
            });
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Config {
                message: "event_channel_capacity must be at least 1".to_string(),
                key: Some("event_channel_capacity".to_string()),
            });
        }
        if self.cdns.is_empty() {
            return Err(Error::Config {
                message: "at least one CDN must be configured".to_string(),
                key: Some("cdns".to_string()),
            });
        }
        for (number, cdn) in &self.cdns {
            url::Url::parse(&cdn.base_url).map_err(|e| Error::Config {
                message: format!("invalid base URL for CDN {number}: {e}"),
                key: Some("cdns".to_string()),
            })?;
        }
        Ok(())
    }

    /// Temp directory for transfer files
    pub fn temp_dir(&self) -> &PathBuf {
        &self.transfer.temp_dir
    }
}

/// Source of the remotely configured attachment size ceiling
pub trait RemoteConfigProvider: Send + Sync {
    /// Largest attachment or transient attachment ciphertext accepted, in bytes
    fn max_attachment_download_size_bytes(&self) -> u64;
}

/// Remote configuration snapshot, updatable at runtime
#[derive(Debug)]
pub struct RemoteConfig {
    max_attachment_download_size_bytes: AtomicU64,
}

#[derive(Deserialize)]
struct RemoteConfigPayload {
    #[serde(
        rename = "attachments.maxDownloadSizeBytes",
        default = "default_max_attachment_download_size"
    )]
    max_attachment_download_size_bytes: u64,
}

impl RemoteConfig {
    /// Snapshot with the given attachment ceiling
    pub fn new(max_attachment_download_size_bytes: u64) -> Self {
        Self {
            max_attachment_download_size_bytes: AtomicU64::new(max_attachment_download_size_bytes),
        }
    }

    /// Parse a JSON remote-config payload; missing keys fall back to defaults
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let payload: RemoteConfigPayload = serde_json::from_slice(bytes)?;
        Ok(Self::new(payload.max_attachment_download_size_bytes))
    }

    /// Replace the attachment ceiling; affects requests enqueued afterwards
    pub fn set_max_attachment_download_size_bytes(&self, bytes: u64) {
        self.max_attachment_download_size_bytes
            .store(bytes, Ordering::Relaxed);
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self::new(default_max_attachment_download_size())
    }
}

impl RemoteConfigProvider for RemoteConfig {
    fn max_attachment_download_size_bytes(&self) -> u64 {
        self.max_attachment_download_size_bytes
            .load(Ordering::Relaxed)
    }
}

// Default value functions
fn default_max_concurrent() -> usize {
    4
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("attachment-dl")
}

fn default_max_attempts() -> u32 {
    16
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_max_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_backup_max_download_size() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_max_attachment_download_size() -> u64 {
    100 * 1024 * 1024
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_cdns() -> BTreeMap<u32, CdnConfig> {
    BTreeMap::from([
        (0, CdnConfig::new("https://cdn.signal.org")),
        (2, CdnConfig::new("https://cdn2.signal.org")),
        (3, CdnConfig::new("https://cdn3.signal.org")),
    ])
}

// Durations are stored as milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
