//! Attachment ciphertext format and streaming decryption.
//!
//! Layout on disk: `IV (16) || AES-256-CBC body, PKCS7 padded || HMAC-SHA256 (32)`.
//! The MAC covers the IV and the body. The optional digest is SHA-256 over the
//! whole file, MAC included.
//!
//! Decryption makes two passes over the file in fixed-size chunks: the first
//! authenticates, the second decrypts. Nothing is decrypted before the MAC
//! verifies, and memory use does not grow with the file size.

use crate::error::{DecryptionError, Result};
use crate::types::EncryptionKey;
use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block and IV length
pub const BLOCK_LEN: usize = 16;
/// HMAC-SHA256 tag length
pub const MAC_LEN: usize = 32;
/// Bytes added to every ciphertext besides padding (IV + MAC)
pub const ENCRYPTION_OVERHEAD: u64 = (BLOCK_LEN + MAC_LEN) as u64;

/// Read granularity; must stay a multiple of [`BLOCK_LEN`]
const CHUNK_LEN: usize = 64 * 1024;

/// Smallest padded plaintext size senders produce
const MIN_PADDED_SIZE: u64 = 541;

/// Size a sender pads a plaintext of `unpadded` bytes up to
///
/// Sizes are rounded up to the next power of 1.05, with a floor of 541 bytes,
/// so the ciphertext length leaks only a coarse size bucket.
pub fn padded_size(unpadded: u64) -> u64 {
    if unpadded <= 1 {
        return MIN_PADDED_SIZE;
    }
    let exponent = ((unpadded as f64).ln() / 1.05f64.ln()).ceil();
    let bucket = 1.05f64.powf(exponent).floor() as u64;
    bucket.max(MIN_PADDED_SIZE)
}

/// Expected ciphertext length for a declared plaintext length
pub fn estimated_download_size(plaintext_length: u64) -> u64 {
    let padded = padded_size(plaintext_length);
    let pkcs7_padding = BLOCK_LEN as u64 - padded % BLOCK_LEN as u64;
    padded + pkcs7_padding + ENCRYPTION_OVERHEAD
}

/// Authenticate and decrypt `input` into `output`
///
/// `plaintext_length`, when given, truncates the sender's zero padding. On
/// error `output` may hold partial plaintext; the caller removes it.
/// Returns the number of plaintext bytes written.
pub fn decrypt_attachment(
    input: &Path,
    key: &EncryptionKey,
    digest: Option<&[u8; 32]>,
    plaintext_length: Option<u64>,
    output: &Path,
) -> Result<u64> {
    let mut file = File::open(input)?;
    let len = file.metadata()?.len();
    if len < (BLOCK_LEN * 2 + MAC_LEN) as u64 {
        return Err(DecryptionError::TooShort { len }.into());
    }
    let body_len = len - ENCRYPTION_OVERHEAD;
    if body_len % BLOCK_LEN as u64 != 0 {
        return Err(DecryptionError::MisalignedCiphertext { len: body_len }.into());
    }

    let mut buf = vec![0u8; CHUNK_LEN];
    authenticate(&mut file, len, key, digest, &mut buf)?;

    file.seek(SeekFrom::Start(0))?;
    let mut iv = [0u8; BLOCK_LEN];
    file.read_exact(&mut iv)?;
    let mut decryptor = Aes256CbcDec::new_from_slices(key.aes_key(), &iv)
        .map_err(|_| DecryptionError::InvalidKey)?;

    let mut writer = LimitedWriter::new(BufWriter::new(File::create(output)?), plaintext_length);
    let mut remaining = body_len;
    let mut held_back = [0u8; BLOCK_LEN];
    let mut holding = false;

    while remaining > 0 {
        let n = remaining.min(CHUNK_LEN as u64) as usize;
        let chunk = &mut buf[..n];
        file.read_exact(chunk)?;
        for block in chunk.chunks_exact_mut(BLOCK_LEN) {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        remaining -= n as u64;

        // The final block carries the padding, so it is always written last
        if holding {
            writer.write(&held_back)?;
        }
        let (body, last) = chunk.split_at(n - BLOCK_LEN);
        writer.write(body)?;
        held_back.copy_from_slice(last);
        holding = true;
    }

    let pad = usize::from(held_back[BLOCK_LEN - 1]);
    if pad == 0
        || pad > BLOCK_LEN
        || !held_back[BLOCK_LEN - pad..]
            .iter()
            .all(|&b| usize::from(b) == pad)
    {
        return Err(DecryptionError::InvalidPadding.into());
    }
    writer.write(&held_back[..BLOCK_LEN - pad])?;

    let decrypted = body_len - pad as u64;
    if let Some(declared) = plaintext_length
        && declared > decrypted
    {
        return Err(DecryptionError::PlaintextLengthMismatch {
            declared,
            actual: decrypted,
        }
        .into());
    }
    writer.finish()
}

/// Verify the MAC and, if given, the whole-file digest
fn authenticate(
    file: &mut File,
    len: u64,
    key: &EncryptionKey,
    digest: Option<&[u8; 32]>,
    buf: &mut [u8],
) -> Result<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.mac_key())
        .map_err(|_| DecryptionError::InvalidKey)?;
    let mut sha = Sha256::new();

    let mut remaining = len - MAC_LEN as u64;
    while remaining > 0 {
        let n = remaining.min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..n])?;
        mac.update(&buf[..n]);
        sha.update(&buf[..n]);
        remaining -= n as u64;
    }

    let mut their_mac = [0u8; MAC_LEN];
    file.read_exact(&mut their_mac)?;
    sha.update(their_mac);

    mac.verify_slice(&their_mac)
        .map_err(|_| DecryptionError::BadMac)?;
    if let Some(expected) = digest
        && sha.finalize().as_slice() != expected.as_slice()
    {
        return Err(DecryptionError::DigestMismatch.into());
    }
    Ok(())
}

/// Writer that silently drops bytes past an optional limit
struct LimitedWriter<W: Write> {
    inner: W,
    limit: Option<u64>,
    written: u64,
}

impl<W: Write> LimitedWriter<W> {
    fn new(inner: W, limit: Option<u64>) -> Self {
        Self {
            inner,
            limit,
            written: 0,
        }
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        let allowed = match self.limit {
            Some(limit) => (limit.saturating_sub(self.written)).min(data.len() as u64) as usize,
            None => data.len(),
        };
        self.inner.write_all(&data[..allowed])?;
        self.written += allowed as u64;
        Ok(())
    }

    fn finish(mut self) -> Result<u64> {
        self.inner.flush()?;
        Ok(self.written)
    }
}
