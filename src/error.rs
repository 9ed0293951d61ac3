//! Error types for attachment-dl
//!
//! The taxonomy mirrors how failures are handled:
//! - [`Error::Network`] and [`Error::Timeout`] are retried, optionally with resume data
//! - [`Error::Oversize`], [`Error::Protocol`] and [`Error::HttpStatus`] fail immediately
//! - [`Error::Decryption`] and [`Error::Validation`] fail after the ciphertext is deleted
//! - [`Error::Cancelled`] is caller-initiated

use crate::types::ResumeData;
use thiserror::Error;

/// Result type alias for attachment-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for attachment-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "cdns")
        key: Option<String>,
    },

    /// The caller cancelled the download
    #[error("download cancelled")]
    Cancelled,

    /// Connection-level failure; may carry resume data for the next attempt
    #[error("network error: {message}")]
    Network {
        /// Underlying error message
        message: String,
        /// Opaque token for resuming the partial transfer
        resume_data: Option<ResumeData>,
    },

    /// Request or body read timed out; may carry resume data for the next attempt
    #[error("timed out: {message}")]
    Timeout {
        /// Underlying error message
        message: String,
        /// Opaque token for resuming the partial transfer
        resume_data: Option<ResumeData>,
    },

    /// Claimed or measured size exceeds the ceiling for this request
    #[error("download of {observed} bytes exceeds limit of {limit} bytes")]
    Oversize {
        /// Configured ceiling in bytes
        limit: u64,
        /// Size claimed by the server or measured on disk
        observed: u64,
    },

    /// Malformed remote path, unknown CDN, or other request construction failure
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server answered with a non-success status
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// Response status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// Ciphertext could not be authenticated or decrypted
    #[error("decryption error: {0}")]
    Decryption(#[from] DecryptionError),

    /// Content validator rejected the attachment
    #[error("validation error: {0}")]
    Validation(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new downloads
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,
}

impl Error {
    /// Resume token carried by a retryable transport failure
    pub fn resume_data(&self) -> Option<&ResumeData> {
        match self {
            Error::Network { resume_data, .. } | Error::Timeout { resume_data, .. } => {
                resume_data.as_ref()
            }
            _ => None,
        }
    }

    /// Take the resume token out of a retryable transport failure
    pub fn take_resume_data(&mut self) -> Option<ResumeData> {
        match self {
            Error::Network { resume_data, .. } | Error::Timeout { resume_data, .. } => {
                resume_data.take()
            }
            _ => None,
        }
    }

    /// Attach a resume token to a retryable transport failure
    ///
    /// Other variants are returned unchanged.
    pub fn with_resume_data(self, data: Option<ResumeData>) -> Self {
        match self {
            Error::Network { message, .. } => Error::Network {
                message,
                resume_data: data,
            },
            Error::Timeout { message, .. } => Error::Timeout {
                message,
                resume_data: data,
            },
            other => other,
        }
    }

    /// Whether this failure was classified as an oversize download
    pub fn is_oversize(&self) -> bool {
        matches!(self, Error::Oversize { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout {
                message: e.to_string(),
                resume_data: None,
            }
        } else if e.is_connect() || e.is_request() || e.is_body() {
            Error::Network {
                message: e.to_string(),
                resume_data: None,
            }
        } else if let Some(status) = e.status() {
            Error::HttpStatus {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            Error::Protocol(e.to_string())
        }
    }
}

/// Attachment decryption failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecryptionError {
    /// File is too short to hold an IV, one block and a MAC
    #[error("ciphertext too short: {len} bytes")]
    TooShort {
        /// Actual file length
        len: u64,
    },

    /// Ciphertext body is not a whole number of AES blocks
    #[error("ciphertext body of {len} bytes is not block aligned")]
    MisalignedCiphertext {
        /// Length of the encrypted body
        len: u64,
    },

    /// HMAC over IV and ciphertext did not verify
    #[error("MAC verification failed")]
    BadMac,

    /// SHA-256 of the ciphertext file did not match the expected digest
    #[error("ciphertext digest mismatch")]
    DigestMismatch,

    /// PKCS7 padding was malformed
    #[error("invalid PKCS7 padding")]
    InvalidPadding,

    /// Declared plaintext length exceeds the decrypted data
    #[error("declared plaintext length {declared} exceeds decrypted length {actual}")]
    PlaintextLengthMismatch {
        /// Length declared by the sender
        declared: u64,
        /// Length actually decrypted
        actual: u64,
    },

    /// Key material has the wrong length
    #[error("invalid key length")]
    InvalidKey,
}
