//! Datagram protection for LAN discovery
//!
//! Every datagram is `HMAC-SHA256(plaintext) || AES-ECB(PKCS7(plaintext))`.
//! Both use the same fixed key, `SHA-256(0xDEADBEEF as little-endian u64)`.

use aes::Aes256;
use ecb::cipher::block_padding::Pkcs7;
use ecb::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Application ID the discovery key is derived from
pub const APPLICATION_ID: u64 = 0xDEADBEEF;

/// Length of the checksum prefix
pub const CHECKSUM_SIZE: usize = 32;

const BLOCK_SIZE: usize = 16;

type HmacSha256 = Hmac<Sha256>;
type Encryptor = ecb::Encryptor<Aes256>;
type Decryptor = ecb::Decryptor<Aes256>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("checksum mismatch")]
    Checksum,

    #[error("decryption failed")]
    Decrypt,

    #[error("invalid key length")]
    Key,
}

fn key() -> [u8; 32] {
    Sha256::digest(APPLICATION_ID.to_le_bytes()).into()
}

fn mac() -> Result<HmacSha256, CryptoError> {
    <HmacSha256 as Mac>::new_from_slice(&key()).map_err(|_| CryptoError::Key)
}

/// Encrypt and sign a plaintext packet
pub fn seal(plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut checksum = mac()?;
    checksum.update(plaintext);

    let ciphertext = Encryptor::new(&key().into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut datagram = Vec::with_capacity(CHECKSUM_SIZE + ciphertext.len());
    datagram.extend_from_slice(&checksum.finalize().into_bytes());
    datagram.extend_from_slice(&ciphertext);
    Ok(datagram)
}

/// Decrypt a datagram and verify its checksum
pub fn open(datagram: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if datagram.len() < CHECKSUM_SIZE + BLOCK_SIZE {
        return Err(CryptoError::TooShort(datagram.len()));
    }
    let (checksum, ciphertext) = datagram.split_at(CHECKSUM_SIZE);
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::Decrypt);
    }

    let plaintext = Decryptor::new(&key().into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;

    let mut expected = mac()?;
    expected.update(&plaintext);
    expected
        .verify_slice(checksum)
        .map_err(|_| CryptoError::Checksum)?;

    Ok(plaintext)
}
