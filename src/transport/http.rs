//! reqwest-backed [`Transport`] with Range-based resumption.

use super::{ProgressFn, Transport, TransportRequest};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{CiphertextFile, ResumeData};
use crate::utils::{remove_file_if_exists, temp_file_path};
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, ETAG, HeaderMap, IF_RANGE, LAST_MODIFIED, RANGE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

/// What an HTTP resume token remembers about a partial transfer
#[derive(Debug, Serialize, Deserialize)]
struct PartialTransfer {
    url: String,
    path: PathBuf,
    received: u64,
    validator: Option<String>,
}

impl PartialTransfer {
    fn encode(&self) -> Option<ResumeData> {
        match serde_json::to_vec(self) {
            Ok(bytes) => ResumeData::new(bytes),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode resume data");
                None
            }
        }
    }

    fn decode(data: &ResumeData) -> Option<Self> {
        serde_json::from_slice(data.as_bytes())
            .map_err(|e| tracing::warn!(error = %e, "ignoring unreadable resume data"))
            .ok()
    }
}

/// Production [`Transport`] that fetches from configured CDN origins over HTTPS
///
/// Bodies are streamed straight to a temp file. A connection failure or an
/// idle body (no bytes for `request_timeout`) yields a resume token; the next
/// attempt sends `Range` and `If-Range` so an unchanged object continues where
/// it stopped, while a changed object restarts from zero. A partial file is
/// only resumed when the server supplied an `ETag` or `Last-Modified` for it,
/// and a `206` whose `Content-Range` does not start at the received offset is
/// discarded in favour of a full fetch.
pub struct HttpTransport {
    client: reqwest::Client,
    origins: BTreeMap<u32, Url>,
    temp_dir: PathBuf,
    idle_timeout: Duration,
}

impl HttpTransport {
    /// Build a transport for the configured CDNs
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.transfer.request_timeout)
            .build()
            .map_err(|e| Error::Config {
                message: format!("failed to create HTTP client: {e}"),
                key: None,
            })?;

        let mut origins = BTreeMap::new();
        for (number, cdn) in &config.cdns {
            let mut base = Url::parse(&cdn.base_url).map_err(|e| Error::Config {
                message: format!("invalid base URL for CDN {number}: {e}"),
                key: Some("cdns".to_string()),
            })?;
            // Url::join replaces the last segment unless the base ends with '/'
            if !base.path().ends_with('/') {
                let path = format!("{}/", base.path());
                base.set_path(&path);
            }
            origins.insert(*number, base);
        }

        Ok(Self {
            client,
            origins,
            temp_dir: config.transfer.temp_dir.clone(),
            idle_timeout: config.transfer.request_timeout,
        })
    }

    fn url_for(&self, request: &TransportRequest) -> Result<Url> {
        let base = self.origins.get(&request.cdn_number).ok_or_else(|| {
            Error::Protocol(format!("no origin configured for CDN {}", request.cdn_number))
        })?;
        base.join(&request.path)
            .map_err(|e| Error::Protocol(format!("invalid path {:?}: {e}", request.path)))
    }

    /// Pick up a partial file from a resume token, if it still matches
    async fn resume_point(&self, url: &Url, resume: Option<ResumeData>) -> Option<PartialTransfer> {
        let partial = PartialTransfer::decode(&resume?)?;
        if partial.url != url.as_str() {
            tracing::debug!(url = %url, "resume data belongs to another URL, starting over");
            cleanup(&partial.path).await;
            return None;
        }
        if partial.validator.is_none() {
            tracing::debug!(url = %url, "partial file has no validator, starting over");
            cleanup(&partial.path).await;
            return None;
        }
        match tokio::fs::metadata(&partial.path).await {
            Ok(meta) if meta.len() == partial.received => Some(partial),
            _ => {
                tracing::debug!(path = ?partial.path, "partial file missing or changed, starting over");
                cleanup(&partial.path).await;
                None
            }
        }
    }

    /// Send the request, asking for the remainder when `partial` has a validated prefix
    async fn send(
        &self,
        url: &Url,
        request: &TransportRequest,
        partial: &PartialTransfer,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let mut builder = self.client.get(url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(validator) = partial.validator.as_ref().filter(|_| partial.received > 0) {
            builder = builder
                .header(RANGE, format!("bytes={}-", partial.received))
                .header(IF_RANGE, validator.as_str());
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            response = tokio::time::timeout(self.idle_timeout, builder.send()) => match response {
                Ok(response) => Ok(response?),
                Err(_) => Err(Error::Timeout {
                    message: format!(
                        "no response from {url} within {}ms",
                        self.idle_timeout.as_millis()
                    ),
                    resume_data: None,
                }),
            },
        }
    }

    async fn fetch(
        &self,
        url: &Url,
        request: &TransportRequest,
        partial: &mut PartialTransfer,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if partial.received > 0 && partial.validator.is_none() {
            partial.received = 0;
        }

        let mut response = self.send(url, request, partial, cancel).await?;
        if response.status() == StatusCode::PARTIAL_CONTENT && partial.received > 0 {
            let start = content_range_start(response.headers());
            if start != Some(partial.received) {
                tracing::debug!(
                    url = %url,
                    expected = partial.received,
                    got = ?start,
                    "partial response does not continue the file, restarting"
                );
                partial.received = 0;
                partial.validator = None;
                response = self.send(url, request, partial, cancel).await?;
            }
        }

        let status = response.status();
        let append = match status {
            StatusCode::PARTIAL_CONTENT if partial.received > 0 => true,
            s if s.is_success() => {
                if partial.received > 0 {
                    tracing::debug!(url = %url, "server ignored range request, restarting");
                }
                partial.received = 0;
                false
            }
            s => {
                return Err(Error::HttpStatus {
                    status: s.as_u16(),
                    url: url.to_string(),
                });
            }
        };

        partial.validator = response
            .headers()
            .get(ETAG)
            .or_else(|| response.headers().get(LAST_MODIFIED))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let total = response.content_length().map(|len| len + partial.received);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&partial.path)
            .await?;

        let mut body = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = tokio::time::timeout(self.idle_timeout, body.next()) => next,
            };
            match next {
                Err(_) => {
                    file.flush().await?;
                    return Err(Error::Timeout {
                        message: format!(
                            "no data from {url} for {}ms",
                            self.idle_timeout.as_millis()
                        ),
                        resume_data: None,
                    });
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    file.flush().await?;
                    return Err(e.into());
                }
                Ok(Some(Ok(chunk))) => {
                    file.write_all(&chunk).await?;
                    partial.received += chunk.len() as u64;
                    progress(partial.received, total);
                }
            }
        }
        file.flush().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn download(
        &self,
        request: &TransportRequest,
        resume: Option<ResumeData>,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<CiphertextFile> {
        let url = self.url_for(request)?;
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        let mut partial = match self.resume_point(&url, resume).await {
            Some(partial) => {
                tracing::debug!(url = %url, received = partial.received, "resuming download");
                partial
            }
            None => PartialTransfer {
                url: url.to_string(),
                path: temp_file_path(&self.temp_dir, "download"),
                received: 0,
                validator: None,
            },
        };

        match self.fetch(&url, request, &mut partial, progress, cancel).await {
            Ok(()) => Ok(CiphertextFile { path: partial.path }),
            Err(e) if matches!(e, Error::Network { .. } | Error::Timeout { .. })
                && partial.received > 0
                && partial.validator.is_some() =>
            {
                let token = partial.encode();
                if token.is_none() {
                    cleanup(&partial.path).await;
                }
                Err(e.with_resume_data(token))
            }
            Err(e) => {
                cleanup(&partial.path).await;
                Err(e)
            }
        }
    }

    async fn discard_resume_data(&self, resume: ResumeData) {
        if let Some(partial) = PartialTransfer::decode(&resume) {
            cleanup(&partial.path).await;
        }
    }
}

/// First byte offset of a `Content-Range: bytes <start>-<end>/<total>` header
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (start, _) = value.trim().strip_prefix("bytes ")?.split_once('-')?;
    start.trim().parse().ok()
}

async fn cleanup(path: &Path) {
    if let Err(e) = remove_file_if_exists(path).await {
        tracing::error!(path = ?path, error = %e, "failed to remove partial download");
    }
}
