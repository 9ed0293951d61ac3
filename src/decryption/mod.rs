//! Serial decryption and validation of downloaded ciphertext
//!
//! [`DecryptionPipeline`] runs at most one decryption or validation job at a
//! time, on a blocking thread, in submission order. Peak memory stays bounded
//! no matter how many transfers finish together.
//!
//! A job whose cancellation token fired while it waited is never started. Any
//! job that fails or is skipped deletes its ciphertext file before replying.

pub mod cipher;

pub use cipher::{decrypt_attachment, estimated_download_size, padded_size};

use crate::error::{Error, Result};
use crate::types::{CiphertextFile, DownloadMetadata, Event, TransferId};
use crate::utils::{remove_file_if_exists, remove_file_if_exists_blocking, temp_file_path};
use crate::validator::{ContentValidator, PendingAttachment};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Cleanup for a job result whose caller stopped waiting
pub trait Discard {
    /// Remove whatever files the result owns
    fn discard(self);
}

impl Discard for PathBuf {
    fn discard(self) {
        if let Err(e) = remove_file_if_exists_blocking(&self) {
            tracing::error!(path = ?self, error = %e, "failed to remove abandoned output");
        }
    }
}

impl Discard for PendingAttachment {
    fn discard(self) {
        self.path.discard();
    }
}

enum Start {
    Run,
    Skip,
}

struct Job {
    id: TransferId,
    cancel: CancellationToken,
    run: Box<dyn FnOnce(Start) + Send>,
}

/// Single-worker queue for CPU-bound post-download work (cloneable - shares one worker)
#[derive(Clone)]
pub struct DecryptionPipeline {
    jobs: mpsc::UnboundedSender<Job>,
    output_dir: PathBuf,
    event_tx: broadcast::Sender<Event>,
}

impl DecryptionPipeline {
    /// Start the worker; plaintext files are written to `output_dir`
    ///
    /// Must be called inside a tokio runtime. The worker exits once every
    /// clone of the pipeline has been dropped.
    pub fn new(output_dir: impl Into<PathBuf>, event_tx: broadcast::Sender<Event>) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(rx));
        Self {
            jobs,
            output_dir: output_dir.into(),
            event_tx,
        }
    }

    /// Queue `op` to run against `ciphertext` on the worker
    ///
    /// `op` runs on a blocking thread. If it fails, or `cancel` fires before
    /// it starts, the ciphertext is deleted. Once started, a job runs to
    /// completion; its result is discarded if the caller has gone away.
    pub async fn submit<T, F>(
        &self,
        id: TransferId,
        ciphertext: CiphertextFile,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        T: Discard + Send + 'static,
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
    {
        if cancel.is_cancelled() {
            if let Err(e) = remove_file_if_exists(&ciphertext.path).await {
                tracing::error!(transfer_id = %id, error = %e, "failed to remove ciphertext");
            }
            return Err(Error::Cancelled);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let event_tx = self.event_tx.clone();
        let path = ciphertext.path;
        let run = Box::new(move |start: Start| {
            let result = match start {
                Start::Run => {
                    event_tx.send(Event::DecryptionStarted { id }).ok();
                    let result = op(&path);
                    let event = match &result {
                        Ok(_) => Event::DecryptionComplete { id },
                        Err(e) => Event::DecryptionFailed {
                            id,
                            error: e.to_string(),
                        },
                    };
                    event_tx.send(event).ok();
                    result
                }
                Start::Skip => Err(Error::Cancelled),
            };

            if let Err(e) = &result {
                tracing::debug!(transfer_id = %id, error = %e, "removing ciphertext after failed job");
                if let Err(e) = remove_file_if_exists_blocking(&path) {
                    tracing::error!(transfer_id = %id, path = ?path, error = %e, "failed to remove ciphertext");
                }
            }

            if let Err(Ok(orphan)) = reply_tx.send(result) {
                tracing::debug!(transfer_id = %id, "caller stopped waiting, discarding result");
                orphan.discard();
            }
        });

        let job = Job {
            id,
            cancel: cancel.clone(),
            run,
        };
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
            (job.run)(Start::Skip);
            return Err(Error::ShuttingDown);
        }

        // Sender dropped without replying means the job panicked
        reply_rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Decrypt a transient attachment into a fresh plaintext temp file
    ///
    /// The ciphertext is deleted whether or not decryption succeeds.
    pub async fn decrypt(
        &self,
        id: TransferId,
        ciphertext: CiphertextFile,
        metadata: &DownloadMetadata,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let output_dir = self.output_dir.clone();
        let key = metadata.encryption_key.clone();
        let digest = metadata.digest;
        let plaintext_length = metadata.plaintext_length.map(u64::from);

        self.submit(id, ciphertext, cancel, move |input| {
            std::fs::create_dir_all(&output_dir)?;
            let output = temp_file_path(&output_dir, "plaintext");
            match decrypt_attachment(input, &key, digest.as_ref(), plaintext_length, &output) {
                Ok(bytes) => {
                    tracing::debug!(transfer_id = %id, bytes, "decrypted attachment");
                    if let Err(e) = remove_file_if_exists_blocking(input) {
                        tracing::warn!(transfer_id = %id, error = %e, "failed to remove ciphertext");
                    }
                    Ok(output)
                }
                Err(e) => {
                    output.discard();
                    Err(e)
                }
            }
        })
        .await
    }

    /// Hand a tracked attachment's ciphertext to `validator`
    pub async fn validate(
        &self,
        id: TransferId,
        ciphertext: CiphertextFile,
        metadata: DownloadMetadata,
        validator: Arc<dyn ContentValidator>,
        cancel: &CancellationToken,
    ) -> Result<PendingAttachment> {
        self.submit(id, ciphertext, cancel, move |input| {
            validator.validate_contents(input, &metadata)
        })
        .await
    }
}

async fn run_worker(mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let start = if job.cancel.is_cancelled() {
            tracing::debug!(transfer_id = %job.id, "skipping cancelled decryption job");
            Start::Skip
        } else {
            Start::Run
        };
        let run = job.run;
        if let Err(e) = tokio::task::spawn_blocking(move || run(start)).await {
            tracing::error!(transfer_id = %job.id, error = %e, "decryption job panicked");
        }
    }
    tracing::debug!("decryption worker stopped");
}
