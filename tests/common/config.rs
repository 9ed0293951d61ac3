//! Coordinators wired to a local mock CDN

use attachment_dl::config::CdnConfig;
use attachment_dl::{Config, DownloadCoordinator, RemoteConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// CDN number used for attachments in these tests
pub const ATTACHMENT_CDN: u32 = 2;

/// CDN number used for backups in these tests
pub const BACKUP_CDN: u32 = 3;

/// Config pointing both test CDNs at `base_url`, with short timeouts and few retries
pub fn test_config(base_url: &str, temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.cdns = BTreeMap::from([
        (ATTACHMENT_CDN, CdnConfig::new(base_url)),
        (BACKUP_CDN, CdnConfig::new(base_url)),
    ]);
    config.transfer.temp_dir = temp_dir.path().join("temp");
    config.transfer.request_timeout = Duration::from_millis(300);
    config.transfer.retry.max_attempts = 3;
    config.transfer.retry.initial_delay = Duration::from_millis(10);
    config.transfer.retry.max_delay = Duration::from_millis(10);
    config
}

/// HTTP-backed coordinator with an attachment ceiling of `max_attachment_bytes`
pub fn create_http_coordinator(
    base_url: &str,
    max_attachment_bytes: u64,
) -> (DownloadCoordinator, Arc<RemoteConfig>, TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let remote = Arc::new(RemoteConfig::new(max_attachment_bytes));
    let coordinator =
        DownloadCoordinator::with_http(test_config(base_url, &temp_dir), remote.clone())
            .expect("Failed to create coordinator");
    (coordinator, remote, temp_dir)
}
