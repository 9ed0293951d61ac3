//! Retry/resume state machine for one logical transfer.
//!
//! ```text
//! Idle -> InFlight -> Succeeded
//!            |  ^
//!            v  |
//!          Retrying -> Failed
//! ```
//!
//! A retryable failure hands its resume token to the next attempt. A token
//! that will never be used again is returned to the transport for cleanup.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::progress::{ProgressTracker, fraction_completed};
use crate::retry::{Backoff, IsRetryable};
use crate::transport::{OCTET_STREAM, Transport, TransportRequest};
use crate::types::{
    CiphertextFile, DownloadLimits, DownloadRequest, Event, ResumeData, TransferId, TransferState,
};
use crate::utils::remove_file_if_exists;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Observed size recorded by the progress guard; zero means not tripped
const NO_VIOLATION: u64 = 0;

/// One logical download: the first GET plus any resumed retries
pub struct TransferAttempt<'a> {
    id: TransferId,
    request: &'a DownloadRequest,
    limits: DownloadLimits,
    transport: &'a dyn Transport,
    progress: &'a ProgressTracker,
    retry: &'a RetryConfig,
    event_tx: &'a broadcast::Sender<Event>,
    state: TransferState,
}

impl<'a> TransferAttempt<'a> {
    /// Prepare a transfer in the `Idle` state
    pub fn new(
        id: TransferId,
        request: &'a DownloadRequest,
        limits: DownloadLimits,
        transport: &'a dyn Transport,
        progress: &'a ProgressTracker,
        retry: &'a RetryConfig,
        event_tx: &'a broadcast::Sender<Event>,
    ) -> Self {
        Self {
            id,
            request,
            limits,
            transport,
            progress,
            retry,
            event_tx,
            state: TransferState::Idle,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TransferState {
        self.state
    }

    fn transition(&mut self, next: TransferState) {
        tracing::debug!(transfer_id = %self.id, from = ?self.state, to = ?next, "transfer state");
        self.state = next;
    }

    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    fn transport_request(&self) -> Result<TransportRequest> {
        let mut headers = self.request.additional_headers();
        headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| OCTET_STREAM.to_string());
        Ok(TransportRequest {
            cdn_number: self.request.cdn_number(),
            path: self.request.url_path()?,
            headers,
        })
    }

    /// Run attempts until one succeeds, a terminal error occurs, or the
    /// attempt budget (`max_attempts`, counting the first) is spent
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<CiphertextFile> {
        let result = self.run_attempts(cancel).await;
        match &result {
            Ok(_) => self.transition(TransferState::Succeeded),
            Err(e) => {
                tracing::error!(transfer_id = %self.id, error = %e, "transfer failed");
                self.transition(TransferState::Failed);
            }
        }
        result
    }

    async fn run_attempts(&mut self, cancel: &CancellationToken) -> Result<CiphertextFile> {
        let request = self.transport_request()?;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut backoff = Backoff::new(self.retry);
        let mut resume: Option<ResumeData> = None;
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                self.discard(resume).await;
                return Err(Error::Cancelled);
            }

            self.transition(TransferState::InFlight);
            tracing::debug!(
                transfer_id = %self.id,
                attempt,
                cdn = request.cdn_number,
                resumed = resume.is_some(),
                "starting attempt"
            );

            match self.attempt_once(&request, resume.take(), cancel).await {
                Ok((file, bytes)) => {
                    if attempt > 1 {
                        tracing::info!(transfer_id = %self.id, attempts = attempt, "transfer succeeded after retry");
                    }
                    self.emit(Event::TransferComplete { id: self.id, bytes });
                    return Ok(file);
                }
                Err(mut e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        transfer_id = %self.id,
                        error = %e,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, retrying"
                    );
                    self.emit(Event::Retrying {
                        id: self.id,
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    });
                    self.transition(TransferState::Retrying);
                    resume = e.take_resume_data();

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            self.discard(resume).await;
                            return Err(Error::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(mut e) => {
                    if e.is_retryable() {
                        tracing::warn!(transfer_id = %self.id, attempts = attempt, "retry attempts exhausted");
                    }
                    self.discard(e.take_resume_data()).await;
                    return Err(e);
                }
            }
        }
    }

    /// One GET guarded by the size ceiling; returns the file and its size
    async fn attempt_once(
        &self,
        request: &TransportRequest,
        resume: Option<ResumeData>,
        cancel: &CancellationToken,
    ) -> Result<(CiphertextFile, u64)> {
        let limit = self.limits.max_download_size_bytes;
        let attachment_id = self.request.attachment_id();
        let guard = cancel.child_token();
        let violation = AtomicU64::new(NO_VIOLATION);

        let on_progress = |completed: u64, total: Option<u64>| {
            if completed == 0 {
                return;
            }
            let observed = match total {
                Some(total) if total > limit => Some(total),
                _ if completed > limit => Some(completed),
                _ => None,
            };
            if let Some(observed) = observed {
                violation
                    .compare_exchange(NO_VIOLATION, observed, Ordering::AcqRel, Ordering::Acquire)
                    .ok();
                guard.cancel();
                return;
            }
            if let (Some(id), Some(fraction)) = (attachment_id, fraction_completed(completed, total)) {
                self.progress.set(id, fraction);
            }
        };

        let result = self
            .transport
            .download(request, resume, &on_progress, &guard)
            .await;

        let observed = violation.load(Ordering::Acquire);
        if observed != NO_VIOLATION {
            // Whatever the transport made of the abort, the answer is Oversize
            match result {
                Ok(file) => cleanup(&file).await,
                Err(mut e) => self.discard(e.take_resume_data()).await,
            }
            tracing::warn!(transfer_id = %self.id, limit, observed, "server exceeded size ceiling, aborted");
            return Err(Error::Oversize { limit, observed });
        }

        let file = result?;
        let size = match tokio::fs::metadata(&file.path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                cleanup(&file).await;
                return Err(e.into());
            }
        };
        if size > limit {
            tracing::warn!(transfer_id = %self.id, limit, observed = size, "downloaded file exceeds size ceiling");
            cleanup(&file).await;
            return Err(Error::Oversize {
                limit,
                observed: size,
            });
        }
        Ok((file, size))
    }

    async fn discard(&self, resume: Option<ResumeData>) {
        if let Some(resume) = resume {
            self.transport.discard_resume_data(resume).await;
        }
    }
}

async fn cleanup(file: &CiphertextFile) {
    if let Err(e) = remove_file_if_exists(&file.path).await {
        tracing::error!(path = ?file.path, error = %e, "failed to remove downloaded file");
    }
}
