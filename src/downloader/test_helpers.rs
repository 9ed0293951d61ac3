//! Shared test helpers: a scripted transport and coordinator constructors.

use crate::config::{Config, RemoteConfig};
use crate::downloader::DownloadCoordinator;
use crate::error::{Error, Result};
use crate::transport::{ProgressFn, Transport, TransportRequest};
use crate::types::{CiphertextFile, DownloadMetadata, EncryptionKey, ResumeData};
use crate::utils::temp_file_path;
use crate::validator::DecryptingValidator;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the next `download` call does
pub(crate) enum Step {
    /// Fail immediately with this error
    Fail(Error),
    /// Write these bytes in one chunk, reporting progress
    Body(Vec<u8>),
    /// Write `len` zero bytes in `chunk`-sized pieces, reporting `claimed_total`
    Zeros {
        len: u64,
        chunk: u64,
        claimed_total: Option<u64>,
    },
    /// Write `len` zero bytes without reporting progress
    Silent(u64),
    /// Make these exact progress calls, then write a small body
    Reports(Vec<(u64, Option<u64>)>),
    /// Block until cancelled
    Hang,
}

type StepFn = Box<dyn Fn() -> Step + Send + Sync>;

/// Scripted [`Transport`] recording how it was driven
pub(crate) struct MockTransport {
    dir: PathBuf,
    script: Mutex<VecDeque<Step>>,
    otherwise: StepFn,
    latency: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    requests: Mutex<Vec<TransportRequest>>,
    resumes: Mutex<Vec<Option<ResumeData>>>,
    discarded: Mutex<Vec<ResumeData>>,
}

impl MockTransport {
    /// Transport writing into `dir`; unscripted calls return a small body
    pub(crate) fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            script: Mutex::new(VecDeque::new()),
            otherwise: Box::new(|| Step::Body(vec![7u8; 1024])),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            resumes: Mutex::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
        }
    }

    /// Queue a scripted step
    pub(crate) fn then(self, step: Step) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    /// Step used once the script is exhausted
    pub(crate) fn otherwise(mut self, step: impl Fn() -> Step + Send + Sync + 'static) -> Self {
        self.otherwise = Box::new(step);
        self
    }

    /// Delay before each call does anything
    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn resumes(&self) -> Vec<Option<ResumeData>> {
        self.resumes.lock().unwrap().clone()
    }

    pub(crate) fn discarded(&self) -> Vec<ResumeData> {
        self.discarded.lock().unwrap().clone()
    }

    async fn run_step(
        &self,
        step: Step,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<CiphertextFile> {
        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.latency) => {}
            }
        }

        match step {
            Step::Fail(e) => Err(e),
            Step::Hang => {
                cancel.cancelled().await;
                Err(Error::Cancelled)
            }
            Step::Body(data) => {
                let path = temp_file_path(&self.dir, "download");
                tokio::fs::write(&path, &data).await?;
                progress(data.len() as u64, Some(data.len() as u64));
                Ok(CiphertextFile { path })
            }
            Step::Reports(reports) => {
                for (completed, total) in reports {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    progress(completed, total);
                }
                let path = temp_file_path(&self.dir, "download");
                tokio::fs::write(&path, [1u8; 16]).await?;
                Ok(CiphertextFile { path })
            }
            Step::Silent(len) => {
                let path = temp_file_path(&self.dir, "download");
                tokio::fs::write(&path, vec![0u8; len as usize]).await?;
                Ok(CiphertextFile { path })
            }
            Step::Zeros {
                len,
                chunk,
                claimed_total,
            } => {
                let path = temp_file_path(&self.dir, "download");
                let mut written = 0u64;
                let mut contents = Vec::new();
                while written < len {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let n = chunk.min(len - written);
                    contents.resize((written + n) as usize, 0);
                    written += n;
                    progress(written, claimed_total);
                    tokio::task::yield_now().await;
                }
                tokio::fs::write(&path, contents).await?;
                Ok(CiphertextFile { path })
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn download(
        &self,
        request: &TransportRequest,
        resume: Option<ResumeData>,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<CiphertextFile> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        self.resumes.lock().unwrap().push(resume);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| (self.otherwise)());
        let result = self.run_step(step, progress, cancel).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn discard_resume_data(&self, resume: ResumeData) {
        self.discarded.lock().unwrap().push(resume);
    }
}

/// Retryable failure, optionally carrying a resume token
pub(crate) fn timeout(resume: Option<&str>) -> Error {
    Error::Timeout {
        message: "read timed out".to_string(),
        resume_data: resume.and_then(|token| ResumeData::new(token.as_bytes().to_vec())),
    }
}

/// Config rooted in `dir` with the given concurrency
pub(crate) fn test_config(dir: &Path, max_concurrent_transfers: usize) -> Config {
    let mut config = Config::default();
    config.transfer.temp_dir = dir.join("temp");
    config.transfer.max_concurrent_transfers = max_concurrent_transfers;
    config
}

/// Coordinator over `transport` with an attachment ceiling of `max_attachment_bytes`
pub(crate) fn create_test_coordinator(
    dir: &Path,
    transport: Arc<MockTransport>,
    max_concurrent_transfers: usize,
    max_attachment_bytes: u64,
) -> (DownloadCoordinator, Arc<RemoteConfig>) {
    let remote = Arc::new(RemoteConfig::new(max_attachment_bytes));
    let coordinator = DownloadCoordinator::new(
        test_config(dir, max_concurrent_transfers),
        transport,
        Arc::new(DecryptingValidator::new(dir.join("validated"))),
        remote.clone(),
    )
    .unwrap();
    (coordinator, remote)
}

/// Attachment metadata keyed with `key`
pub(crate) fn attachment_metadata(
    key: EncryptionKey,
    digest: Option<[u8; 32]>,
    plaintext_length: Option<u32>,
) -> DownloadMetadata {
    DownloadMetadata {
        mime_type: "image/jpeg".to_string(),
        cdn_number: 2,
        cdn_key: "abc/def".to_string(),
        encryption_key: key,
        digest,
        plaintext_length,
    }
}
