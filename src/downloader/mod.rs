//! Download coordination split into focused submodules.
//!
//! The [`DownloadCoordinator`] façade composes:
//! - [`queue`] - FIFO admission control bounding concurrent transfers
//! - [`attempt`] - Retry/resume state machine for one transfer
//! - [`crate::decryption`] - Serial decryption and validation
//! - [`crate::progress`] - Per-attachment progress publication

pub mod attempt;
pub mod queue;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

pub use attempt::TransferAttempt;
pub use queue::{AdmissionPermit, DownloadQueue};

use crate::config::{Config, RemoteConfigProvider};
use crate::decryption::{DecryptionPipeline, estimated_download_size};
use crate::error::{Error, Result};
use crate::progress::{ProgressTracker, ProgressUpdate};
use crate::transport::{HttpTransport, Transport};
use crate::types::{
    AttachmentId, BackupRemoteInfo, CiphertextFile, DownloadLimits, DownloadMetadata,
    DownloadRequest, Event, TransferId,
};
use crate::validator::{ContentValidator, DecryptingValidator, PendingAttachment};
use futures::Stream;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Public façade for backup and attachment downloads (cloneable - all fields are Arc-wrapped)
///
/// Every request is admitted through one shared [`DownloadQueue`], so at most
/// `max_concurrent_transfers` transfers run at once across all request kinds.
/// Attachment downloads then pass through the single-worker
/// [`DecryptionPipeline`].
#[derive(Clone)]
pub struct DownloadCoordinator {
    /// Static configuration
    config: Arc<Config>,
    /// Network collaborator
    transport: Arc<dyn Transport>,
    /// Content validation for tracked attachments
    validator: Arc<dyn ContentValidator>,
    /// Source of the attachment size ceiling
    remote_config: Arc<dyn RemoteConfigProvider>,
    /// Admission control shared by all requests
    queue: DownloadQueue,
    /// Serial decryption worker
    decryption: DecryptionPipeline,
    /// Attachment progress map
    progress: ProgressTracker,
    /// Event broadcast channel sender (multiple subscribers supported)
    event_tx: broadcast::Sender<Event>,
    /// Next transfer ID
    next_id: Arc<AtomicU64>,
    /// Parent of every request's cancellation token
    shutdown: CancellationToken,
    /// Set to false once shutdown begins
    accepting_new: Arc<AtomicBool>,
}

impl DownloadCoordinator {
    /// Create a coordinator around the given collaborators
    ///
    /// Must be called inside a tokio runtime; the decryption worker is spawned here.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        validator: Arc<dyn ContentValidator>,
        remote_config: Arc<dyn RemoteConfigProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let (event_tx, _rx) = broadcast::channel(config.event_channel_capacity);
        let decryption = DecryptionPipeline::new(config.temp_dir().join("plaintext"), event_tx.clone());
        let queue = DownloadQueue::new(config.transfer.max_concurrent_transfers);

        tracing::info!(
            max_concurrent_transfers = queue.capacity(),
            max_attempts = config.transfer.retry.max_attempts,
            cdns = config.cdns.len(),
            "download coordinator started"
        );

        Ok(Self {
            config: Arc::new(config),
            transport,
            validator,
            remote_config,
            queue,
            decryption,
            progress: ProgressTracker::new(),
            event_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            shutdown: CancellationToken::new(),
            accepting_new: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Create a coordinator using [`HttpTransport`] and [`DecryptingValidator`]
    pub fn with_http(config: Config, remote_config: Arc<dyn RemoteConfigProvider>) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        let validator = Arc::new(DecryptingValidator::new(config.temp_dir().join("validated")));
        Self::new(config, transport, validator, remote_config)
    }

    /// Download a backup archive to a ciphertext file owned by the caller
    ///
    /// Backups are capped by `limits.backup_max_download_size_bytes`.
    pub async fn download_backup(
        &self,
        info: BackupRemoteInfo,
        auth_headers: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<CiphertextFile> {
        let limits = DownloadLimits::new(self.config.limits.backup_max_download_size_bytes);
        let request = DownloadRequest::Backup { info, auth_headers };
        let token = self.link(cancel)?;
        let _guard = token.clone().drop_guard();
        let id = self.next_transfer_id();
        self.transfer(id, &request, limits, &token).await
    }

    /// Download and decrypt an attachment that is not tracked by id
    ///
    /// Returns a plaintext temp file owned by the caller.
    pub async fn download_transient_attachment(
        &self,
        metadata: DownloadMetadata,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let limits = self.attachment_limits(&metadata)?;
        let token = self.link(cancel)?;
        let _guard = token.clone().drop_guard();
        let id = self.next_transfer_id();
        let request = DownloadRequest::TransientAttachment(metadata.clone());

        let ciphertext = self.transfer(id, &request, limits, &token).await?;
        self.decryption.decrypt(id, ciphertext, &metadata, &token).await
    }

    /// Download an attachment, publishing progress under `id`, and validate it
    pub async fn download_attachment(
        &self,
        metadata: DownloadMetadata,
        id: AttachmentId,
        cancel: &CancellationToken,
    ) -> Result<PendingAttachment> {
        let limits = self.attachment_limits(&metadata)?;
        let token = self.link(cancel)?;
        let _guard = token.clone().drop_guard();
        let transfer_id = self.next_transfer_id();
        let request = DownloadRequest::Attachment {
            metadata: metadata.clone(),
            id,
        };

        let ciphertext = self.transfer(transfer_id, &request, limits, &token).await?;
        self.decryption
            .validate(
                transfer_id,
                ciphertext,
                metadata,
                self.validator.clone(),
                &token,
            )
            .await
    }

    /// Queue, admit and run one transfer
    async fn transfer(
        &self,
        id: TransferId,
        request: &DownloadRequest,
        limits: DownloadLimits,
        cancel: &CancellationToken,
    ) -> Result<CiphertextFile> {
        tracing::info!(
            transfer_id = %id,
            kind = ?request.kind(),
            limit = limits.max_download_size_bytes,
            "download queued"
        );
        self.emit_event(Event::Queued {
            id,
            kind: request.kind(),
        });

        let result = self
            .queue
            .enqueue(cancel, move || async move {
                tracing::info!(transfer_id = %id, in_flight = self.queue.in_flight(), "download admitted");
                self.emit_event(Event::Admitted { id });
                let mut attempt = TransferAttempt::new(
                    id,
                    request,
                    limits,
                    self.transport.as_ref(),
                    &self.progress,
                    &self.config.transfer.retry,
                    &self.event_tx,
                );
                attempt.run(cancel).await
            })
            .await;

        if let Err(e) = &result {
            self.emit_event(Event::TransferFailed {
                id,
                error: e.to_string(),
            });
        }
        result
    }

    /// Size ceiling for an attachment, rejecting it early when the declared
    /// plaintext length already implies a ciphertext over the ceiling
    fn attachment_limits(&self, metadata: &DownloadMetadata) -> Result<DownloadLimits> {
        let limit = self.remote_config.max_attachment_download_size_bytes();
        if let Some(plaintext_length) = metadata.plaintext_length {
            let estimate = estimated_download_size(u64::from(plaintext_length));
            if estimate > limit {
                tracing::warn!(
                    cdn = metadata.cdn_number,
                    limit,
                    observed = estimate,
                    "attachment too large, not downloading"
                );
                return Err(Error::Oversize {
                    limit,
                    observed: estimate,
                });
            }
        }
        Ok(DownloadLimits::new(limit))
    }

    /// Token cancelled by the caller's token or by shutdown, whichever comes first
    fn link(&self, caller: &CancellationToken) -> Result<CancellationToken> {
        if !self.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let token = self.shutdown.child_token();
        let linked = token.clone();
        let caller = caller.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = caller.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
        Ok(token)
    }

    fn next_transfer_id(&self) -> TransferId {
        TransferId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Latest progress fraction for an attachment, if any byte has arrived
    pub fn download_progress(&self, id: AttachmentId) -> Option<f64> {
        self.progress.get(id)
    }

    /// Shared progress tracker
    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Attachment progress updates as a stream
    pub fn progress_stream(&self) -> impl Stream<Item = ProgressUpdate> + Send + 'static {
        self.progress.stream()
    }

    /// Subscribe to lifecycle events
    ///
    /// Each subscriber receives all events independently. A subscriber that
    /// falls more than `event_channel_capacity` events behind receives
    /// `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Transfers currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.queue.in_flight()
    }

    /// Requests waiting for a slot
    pub fn waiting(&self) -> usize {
        self.queue.waiting()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Stop accepting requests and cancel everything outstanding
    ///
    /// Running transfers abort with [`Error::Cancelled`]; later calls fail
    /// with [`Error::ShuttingDown`].
    pub fn shutdown(&self) {
        if self.accepting_new.swap(false, Ordering::SeqCst) {
            tracing::info!(
                in_flight = self.queue.in_flight(),
                waiting = self.queue.waiting(),
                "shutting down download coordinator"
            );
            self.shutdown.cancel();
        }
    }

    /// Whether [`DownloadCoordinator::shutdown`] has been called
    pub fn is_shut_down(&self) -> bool {
        !self.accepting_new.load(Ordering::SeqCst)
    }

    pub(crate) fn emit_event(&self, event: Event) {
        // No subscribers is fine
        self.event_tx.send(event).ok();
    }
}
