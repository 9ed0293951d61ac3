//! Encrypted attachment fixtures

use aes::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use attachment_dl::EncryptionKey;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// Fixed 64-byte key: bytes 0..64
pub fn test_key_bytes() -> [u8; 64] {
    std::array::from_fn(|i| i as u8)
}

/// [`test_key_bytes`] as an [`EncryptionKey`]
pub fn test_key() -> EncryptionKey {
    EncryptionKey::from(test_key_bytes())
}

/// Encrypt `plaintext` into the IV || ciphertext || MAC layout
pub fn encrypt(plaintext: &[u8], key: &[u8; 64], iv: [u8; 16]) -> Vec<u8> {
    let body = Aes256CbcEnc::new_from_slices(&key[..32], &iv)
        .expect("AES-256 key and IV lengths are fixed")
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(16 + body.len() + 32);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&body);

    let mut mac = Hmac::<Sha256>::new_from_slice(&key[32..]).expect("HMAC accepts any key size");
    mac.update(&out);
    out.extend_from_slice(&mac.finalize().into_bytes());
    out
}

/// SHA-256 of `data`
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Deterministic plaintext of `len` bytes
pub fn plaintext(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
