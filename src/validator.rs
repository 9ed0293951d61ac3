//! Content validation for tracked attachments
//!
//! A [`ContentValidator`] turns a downloaded ciphertext into a
//! [`PendingAttachment`] ready for the persistence layer. It runs on a
//! blocking thread inside the decryption pipeline, one job at a time.

use crate::decryption::cipher::decrypt_attachment;
use crate::error::{Error, Result};
use crate::types::DownloadMetadata;
use crate::utils::{remove_file_if_exists_blocking, temp_file_path};
use std::path::{Path, PathBuf};

/// Validated attachment awaiting persistence
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingAttachment {
    /// File holding the validated content
    pub path: PathBuf,
    /// MIME type to record
    pub mime_type: String,
    /// Plaintext size in bytes
    pub byte_count: u64,
}

/// Validates downloaded ciphertext
///
/// On success the validator owns the ciphertext file: it may keep it as part
/// of the returned [`PendingAttachment`] or delete it. On failure the pipeline
/// deletes the ciphertext.
pub trait ContentValidator: Send + Sync {
    /// Check the contents of `ciphertext` against `metadata`
    fn validate_contents(
        &self,
        ciphertext: &Path,
        metadata: &DownloadMetadata,
    ) -> Result<PendingAttachment>;
}

/// Validator that decrypts into `output_dir` and checks the result is non-empty
#[derive(Clone, Debug)]
pub struct DecryptingValidator {
    output_dir: PathBuf,
}

impl DecryptingValidator {
    /// Validator writing plaintext into `output_dir`
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

impl ContentValidator for DecryptingValidator {
    fn validate_contents(
        &self,
        ciphertext: &Path,
        metadata: &DownloadMetadata,
    ) -> Result<PendingAttachment> {
        std::fs::create_dir_all(&self.output_dir)?;
        let output = temp_file_path(&self.output_dir, "plaintext");

        let written = decrypt_attachment(
            ciphertext,
            &metadata.encryption_key,
            metadata.digest.as_ref(),
            metadata.plaintext_length.map(u64::from),
            &output,
        )
        .and_then(|written| {
            if written == 0 {
                Err(Error::Validation("attachment is empty".to_string()))
            } else {
                Ok(written)
            }
        });

        match written {
            Ok(byte_count) => {
                // The plaintext is valid and now belongs to the caller either way
                if let Err(e) = remove_file_if_exists_blocking(ciphertext) {
                    tracing::warn!(path = ?ciphertext, error = %e, "failed to remove consumed ciphertext");
                }
                Ok(PendingAttachment {
                    path: output,
                    mime_type: metadata.mime_type.clone(),
                    byte_count,
                })
            }
            Err(e) => {
                if let Err(cleanup) = remove_file_if_exists_blocking(&output) {
                    tracing::error!(path = ?output, error = %cleanup, "failed to remove rejected plaintext");
                }
                Err(e)
            }
        }
    }
}
