//! # attachment-dl
//!
//! Download-and-decrypt pipeline for encrypted attachments and backup archives.
//!
//! ## Design
//!
//! - **Bounded** - A FIFO admission queue caps concurrent transfers
//! - **Resilient** - Network failures are retried with resumable partial transfers
//! - **Defensive** - Server size claims are checked against per-request ceilings
//! - **Serial decryption** - One decryption at a time keeps peak memory flat
//! - **Event-driven** - Consumers subscribe to lifecycle events and progress
//!
//! ## Quick Start
//!
//! ```no_run
//! use attachment_dl::{Config, DownloadCoordinator, RemoteConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let remote = Arc::new(RemoteConfig::default());
//!     let coordinator = DownloadCoordinator::with_http(Config::default(), remote)?;
//!
//!     // Subscribe to events
//!     let mut events = coordinator.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let info = attachment_dl::BackupRemoteInfo {
//!         cdn: 3,
//!         backup_dir: "dir".to_string(),
//!         backup_name: "backup".to_string(),
//!     };
//!     let file = coordinator
//!         .download_backup(info, Default::default(), &CancellationToken::new())
//!         .await?;
//!     println!("backup ciphertext at {:?}", file.path);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Attachment decryption and the serial decryption pipeline
pub mod decryption;
/// Download coordination (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Per-attachment progress tracking
pub mod progress;
/// Retry classification and backoff
pub mod retry;
/// Network transport abstraction and HTTP implementation
pub mod transport;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;
/// Content validation
pub mod validator;

// Re-export commonly used types
pub use config::{Config, RemoteConfig, RemoteConfigProvider};
pub use decryption::DecryptionPipeline;
pub use downloader::{DownloadCoordinator, DownloadQueue, TransferAttempt};
pub use error::{DecryptionError, Error, Result};
pub use progress::{ProgressTracker, ProgressUpdate};
pub use transport::{HttpTransport, Transport, TransportRequest};
pub use types::{
    AttachmentId, BackupRemoteInfo, CiphertextFile, DownloadLimits, DownloadMetadata,
    DownloadRequest, EncryptionKey, Event, ResumeData, TransferId, TransferState,
};
pub use validator::{ContentValidator, DecryptingValidator, PendingAttachment};

/// Run the coordinator until the process is asked to terminate, then shut it down.
///
/// Listens for SIGTERM and Ctrl+C on Unix, Ctrl+C elsewhere. Shutdown cancels
/// every outstanding download.
///
/// # Example
///
/// ```no_run
/// use attachment_dl::{Config, DownloadCoordinator, RemoteConfig, run_with_shutdown};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let remote = Arc::new(RemoteConfig::default());
///     let coordinator = DownloadCoordinator::with_http(Config::default(), remote)?;
///
///     run_with_shutdown(coordinator).await;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(coordinator: DownloadCoordinator) {
    shutdown_on(&coordinator, termination_signal()).await;
}

/// Shut `coordinator` down once `signal` completes
pub async fn shutdown_on(
    coordinator: &DownloadCoordinator,
    signal: impl std::future::Future<Output = ()>,
) {
    signal.await;
    coordinator.shutdown();
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = ctrl_c() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for Ctrl+C only");
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    ctrl_c().await;
}

// Never completes when no handler can be installed; shutdown() still works
async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C"),
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}
