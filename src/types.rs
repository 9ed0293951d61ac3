//! Core types for attachment-dl

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Bytes escaped in a CDN key; `/` and sub-delimiters such as `+` and `=` stay literal
const CDN_KEY_ESCAPED: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Identifier assigned by the coordinator to each logical download
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub u64);

impl TransferId {
    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TransferId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque attachment identifier supplied by the persistence layer
///
/// Used only to key progress reports; the core never interprets it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentId(pub i64);

impl AttachmentId {
    /// Create a new AttachmentId
    pub fn new(id: i64) -> Self {
        Self(id)
    }
}

impl From<i64> for AttachmentId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 64-byte attachment key: AES-256 key followed by the HMAC-SHA256 key
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; EncryptionKey::LEN]);

impl EncryptionKey {
    /// Key length in bytes
    pub const LEN: usize = 64;

    /// Build a key from raw bytes, returning `None` unless exactly 64 bytes are given
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; Self::LEN]>::try_from(bytes).ok().map(Self)
    }

    pub(crate) fn aes_key(&self) -> &[u8] {
        &self.0[..32]
    }

    pub(crate) fn mac_key(&self) -> &[u8] {
        &self.0[32..]
    }
}

impl From<[u8; EncryptionKey::LEN]> for EncryptionKey {
    fn from(bytes: [u8; EncryptionKey::LEN]) -> Self {
        Self(bytes)
    }
}

// Never print key material
impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Remote metadata for an attachment or transient attachment download
#[derive(Clone, Debug)]
pub struct DownloadMetadata {
    /// MIME type declared by the sender
    pub mime_type: String,
    /// CDN number selecting the origin configuration
    pub cdn_number: u32,
    /// Object key on the CDN (percent-encoded before use)
    pub cdn_key: String,
    /// Key used to authenticate and decrypt the ciphertext
    pub encryption_key: EncryptionKey,
    /// SHA-256 digest of the full ciphertext file, if known
    pub digest: Option<[u8; 32]>,
    /// Unpadded plaintext length declared by the sender
    pub plaintext_length: Option<u32>,
}

/// Remote location of a backup archive
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRemoteInfo {
    /// CDN number; negative or oversized values are clamped
    pub cdn: i64,
    /// Backup directory on the CDN
    pub backup_dir: String,
    /// Backup object name
    pub backup_name: String,
}

/// A logical download, immutable once constructed
#[derive(Clone, Debug)]
pub enum DownloadRequest {
    /// Backup archive, fetched with caller-supplied auth headers
    Backup {
        /// Remote location
        info: BackupRemoteInfo,
        /// Authentication headers for the backup CDN
        auth_headers: BTreeMap<String, String>,
    },
    /// Attachment decrypted to a temp file and not tracked by id
    TransientAttachment(DownloadMetadata),
    /// Attachment tracked by id and handed to the content validator
    Attachment {
        /// Remote metadata
        metadata: DownloadMetadata,
        /// Progress key
        id: AttachmentId,
    },
}

impl DownloadRequest {
    /// Remote path relative to the CDN base URL
    pub fn url_path(&self) -> crate::Result<String> {
        match self {
            DownloadRequest::Backup { info, .. } => {
                if info.backup_dir.is_empty() || info.backup_name.is_empty() {
                    return Err(crate::Error::Protocol(
                        "backup location is missing a directory or name".to_string(),
                    ));
                }
                Ok(format!("backups/{}/{}", info.backup_dir, info.backup_name))
            }
            DownloadRequest::TransientAttachment(metadata)
            | DownloadRequest::Attachment { metadata, .. } => {
                if metadata.cdn_key.is_empty() {
                    return Err(crate::Error::Protocol("invalid cdn key".to_string()));
                }
                Ok(format!(
                    "attachments/{}",
                    utf8_percent_encode(&metadata.cdn_key, CDN_KEY_ESCAPED)
                ))
            }
        }
    }

    /// CDN number selecting the transport origin
    pub fn cdn_number(&self) -> u32 {
        match self {
            DownloadRequest::Backup { info, .. } => {
                info.cdn.clamp(0, i64::from(u32::MAX)) as u32
            }
            DownloadRequest::TransientAttachment(metadata)
            | DownloadRequest::Attachment { metadata, .. } => metadata.cdn_number,
        }
    }

    /// Headers sent in addition to the content type
    pub fn additional_headers(&self) -> BTreeMap<String, String> {
        match self {
            DownloadRequest::Backup { auth_headers, .. } => auth_headers.clone(),
            DownloadRequest::TransientAttachment(_) | DownloadRequest::Attachment { .. } => {
                BTreeMap::new()
            }
        }
    }

    /// Attachment id used for progress reporting, if this request publishes progress
    pub fn attachment_id(&self) -> Option<AttachmentId> {
        match self {
            DownloadRequest::Attachment { id, .. } => Some(*id),
            DownloadRequest::Backup { .. } | DownloadRequest::TransientAttachment(_) => None,
        }
    }

    /// Short name for logs and events
    pub fn kind(&self) -> RequestKind {
        match self {
            DownloadRequest::Backup { .. } => RequestKind::Backup,
            DownloadRequest::TransientAttachment(_) => RequestKind::TransientAttachment,
            DownloadRequest::Attachment { .. } => RequestKind::Attachment,
        }
    }
}

/// Discriminant of [`DownloadRequest`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Backup archive
    Backup,
    /// Transient attachment
    TransientAttachment,
    /// Tracked attachment
    Attachment,
}

/// Per-request limits
///
/// The process-wide transfer cap is not per request; it lives in
/// [`crate::config::TransferConfig::max_concurrent_transfers`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownloadLimits {
    /// Largest ciphertext accepted from the server, in bytes
    pub max_download_size_bytes: u64,
}

impl DownloadLimits {
    /// Limits with the given ceiling
    pub fn new(max_download_size_bytes: u64) -> Self {
        Self {
            max_download_size_bytes,
        }
    }
}

/// Downloaded, still-encrypted file owned by whoever holds this value
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CiphertextFile {
    /// Location on disk
    pub path: PathBuf,
}

/// Opaque token a transport hands back on a retryable failure
///
/// Passed verbatim into the next attempt; the core never inspects it.
#[derive(Clone, PartialEq, Eq)]
pub struct ResumeData(Vec<u8>);

impl ResumeData {
    /// Wrap transport bytes; empty tokens are treated as absent
    pub fn new(bytes: Vec<u8>) -> Option<Self> {
        if bytes.is_empty() {
            None
        } else {
            Some(Self(bytes))
        }
    }

    /// Raw token bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ResumeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeData({} bytes)", self.0.len())
    }
}

/// Lifecycle of a single logical transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Not yet started
    Idle,
    /// Network I/O in progress
    InFlight,
    /// Waiting out the backoff before the next attempt
    Retrying,
    /// Terminal: ciphertext is on disk
    Succeeded,
    /// Terminal: error surfaced to the caller
    Failed,
}

impl TransferState {
    /// Whether no further transitions can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Succeeded | TransferState::Failed)
    }
}

/// Event emitted during the download lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Request entered the admission queue
    Queued {
        /// Transfer ID
        id: TransferId,
        /// Request kind
        kind: RequestKind,
    },

    /// Request was granted a transfer slot
    Admitted {
        /// Transfer ID
        id: TransferId,
    },

    /// Attempt failed with a retryable error; the next one starts after `delay_ms`
    Retrying {
        /// Transfer ID
        id: TransferId,
        /// Number of the attempt that just failed (1-based)
        attempt: u32,
        /// Backoff before the next attempt
        delay_ms: u64,
        /// Error message of the failed attempt
        error: String,
    },

    /// Ciphertext fully downloaded
    TransferComplete {
        /// Transfer ID
        id: TransferId,
        /// Size of the ciphertext file
        bytes: u64,
    },

    /// Transfer failed terminally
    TransferFailed {
        /// Transfer ID
        id: TransferId,
        /// Error message
        error: String,
    },

    /// Decryption or validation began
    DecryptionStarted {
        /// Transfer ID
        id: TransferId,
    },

    /// Decryption or validation finished
    DecryptionComplete {
        /// Transfer ID
        id: TransferId,
    },

    /// Decryption or validation failed; the ciphertext has been deleted
    DecryptionFailed {
        /// Transfer ID
        id: TransferId,
        /// Error message
        error: String,
    },
}
