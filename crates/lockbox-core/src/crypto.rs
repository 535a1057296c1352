use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::ZeroizeOnDrop;

use crate::error::{Result, VaultError};

pub const KDF_ROUNDS: u32 = 600_000;
pub const DERIVED_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const MAC_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// 32-byte symmetric key derived from a password or recovery phrase.
/// Zeroized on drop; lives in the session tier only, never on disk.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SessionKey([u8; DERIVED_KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; DERIVED_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DERIVED_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// PBKDF2-HMAC-SHA256 at a fixed work factor. Same password and salt
/// always derive the same key.
pub fn derive_key(password: &str, salt: &[u8]) -> SessionKey {
    let mut key = [0u8; DERIVED_KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, KDF_ROUNDS, &mut key);
    SessionKey(key)
}

/// AES-256-GCM seal with a fresh random nonce per call. The 16-byte
/// authentication tag is split off and returned separately.
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>, [u8; TAG_LEN])> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Cipher(format!("aead init: {e}")))?;
    let nonce = generate_nonce();
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| VaultError::Cipher("aead encrypt".to_string()))?;
    let tag_vec = sealed.split_off(sealed.len() - TAG_LEN);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&tag_vec);
    Ok((nonce, sealed, tag))
}

/// All-or-nothing open. Any mismatch between key, nonce, ciphertext and tag
/// comes back as the same `InvalidCredential`, with no partial plaintext.
pub fn decrypt(
    key: &SessionKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Cipher(format!("aead init: {e}")))?;
    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed.as_slice())
        .map_err(|_| VaultError::InvalidCredential)
}

pub fn compute_mac(key: &SessionKey, data: &[u8]) -> Result<[u8; MAC_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Cipher(format!("mac init: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time comparison via the Mac trait.
pub fn verify_mac(key: &SessionKey, data: &[u8], expected: &[u8]) -> bool {
    let mut mac = match <HmacSha256 as Mac>::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(data);
    mac.verify_slice(expected).is_ok()
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// SHA-256 hex digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
