//! Password-based encryption of admin-stored values.
//!
//! Token layout before base64 (URL-safe alphabet, padded):
//!
//! ```text
//! salt (16) | iterations (4, big-endian) | nonce (12) | AES-256-GCM ciphertext+tag
//! ```
//!
//! The iteration count travels with the token, so raising
//! [`DEFAULT_KDF_ITERATIONS`] never breaks existing tokens. Every decryption
//! failure is the same opaque [`ConfError::EncryptionKey`].

use crate::defaults::{DEFAULT_KDF_ITERATIONS, MAX_PASSWORD_ATTEMPTS};
use crate::errors::{self, ConfError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const SALT_LEN: usize = 16;
const ITER_LEN: usize = 4;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = SALT_LEN + ITER_LEN + NONCE_LEN;

// Upper bound accepted from a token, so a forged header can not stall the KDF.
const MAX_ITERATIONS: u32 = 10_000_000;

/// Password held in memory only as long as needed and wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop, Default)]
pub struct Password {
    inner: String,
}

impl Password {
    /// Take ownership of `s`.
    #[inline]
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self { inner: s.into() }
    }

    /// Borrow the password bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }
}

impl From<&str> for Password {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Password([REDACTED])")
    }
}

/// PBKDF2-HMAC-SHA256 key for `password` and `salt`.
#[must_use]
pub fn derive_key(password: &Password, salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key[..]);
    key
}

/// Encrypt with the default iteration count.
pub fn encrypt(message: &[u8], password: &Password) -> Result<String> {
    encrypt_with_iterations(message, password, DEFAULT_KDF_ITERATIONS)
}

/// Encrypt with an explicit iteration count.
///
/// The count must lie in `1..=10_000_000`, the range [`decrypt`] accepts.
pub fn encrypt_with_iterations(message: &[u8], password: &Password, iterations: u32) -> Result<String> {
    if iterations == 0 || iterations > MAX_ITERATIONS {
        return Err(errors::invalid_value(format!(
            "iteration count {iterations} is outside 1..={MAX_ITERATIONS}"
        )));
    }
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt, iterations);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), message)
        .map_err(|_| ConfError::EncryptionKey)?;

    let mut token = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    token.extend_from_slice(&salt);
    token.extend_from_slice(&iterations.to_be_bytes());
    token.extend_from_slice(&nonce);
    token.extend_from_slice(&ciphertext);
    debug!(iterations, "encrypted value");
    Ok(URL_SAFE.encode(token))
}

/// Decrypt `token`. Wrong password and damaged token are indistinguishable.
pub fn decrypt(token: &str, password: &Password) -> Result<Zeroizing<Vec<u8>>> {
    let raw = URL_SAFE
        .decode(token.trim())
        .map_err(|_| ConfError::EncryptionKey)?;
    if raw.len() < HEADER_LEN {
        return Err(ConfError::EncryptionKey);
    }
    let (salt, rest) = raw.split_at(SALT_LEN);
    let (iter_bytes, rest) = rest.split_at(ITER_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let mut iter_buf = [0u8; ITER_LEN];
    iter_buf.copy_from_slice(iter_bytes);
    let iterations = u32::from_be_bytes(iter_buf);
    if iterations == 0 || iterations > MAX_ITERATIONS {
        return Err(ConfError::EncryptionKey);
    }

    let key = derive_key(password, salt, iterations);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| ConfError::EncryptionKey)
}

/// Decrypt, asking `prompt` for a password up to three times.
///
/// `prompt` receives the attempt number starting at 1; `None` gives up.
pub fn decrypt_with_retries<F>(token: &str, mut prompt: F) -> Result<Zeroizing<Vec<u8>>>
where
    F: FnMut(u32) -> Option<Password>,
{
    for attempt in 1..=MAX_PASSWORD_ATTEMPTS {
        let Some(password) = prompt(attempt) else {
            break;
        };
        match decrypt(token, &password) {
            Ok(plain) => return Ok(plain),
            Err(_) => warn!(attempt, "decryption failed"),
        }
    }
    Err(ConfError::EncryptionKey)
}
