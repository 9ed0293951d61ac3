//! Transport collaborator: one GET (or resumed GET) against a CDN.
//!
//! The core never builds HTTP requests itself. It hands a [`TransportRequest`]
//! to a [`Transport`] together with an optional [`ResumeData`] token from the
//! previous failed attempt, a progress callback and a cancellation token.

mod http;

pub use http::HttpTransport;

use crate::error::Result;
use crate::types::{CiphertextFile, ResumeData};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// MIME type sent on every CDN request
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Callback receiving cumulative bytes received and the expected total, if known
pub type ProgressFn<'a> = dyn Fn(u64, Option<u64>) + Send + Sync + 'a;

/// Everything a transport needs to issue one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportRequest {
    /// CDN number selecting the origin
    pub cdn_number: u32,
    /// Path relative to the origin's base URL
    pub path: String,
    /// Request headers, including `Content-Type`
    pub headers: BTreeMap<String, String>,
}

/// Abstraction over the network layer, enabling testability
///
/// Contract:
/// - `progress` is called with cumulative byte counts as data arrives
/// - when `cancel` fires, in-flight I/O is aborted, partial data is discarded
///   and [`crate::Error::Cancelled`] is returned
/// - a retryable failure ([`crate::Error::Network`] / [`crate::Error::Timeout`])
///   may carry a [`ResumeData`] token; every other failure leaves nothing behind
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Download the object to a local ciphertext file
    async fn download(
        &self,
        request: &TransportRequest,
        resume: Option<ResumeData>,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<CiphertextFile>;

    /// Release whatever a resume token holds (partial files, buffers)
    ///
    /// Called when a token will never be passed back to [`Transport::download`].
    async fn discard_resume_data(&self, _resume: ResumeData) {}
}
