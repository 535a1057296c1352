use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::crypto::{NONCE_LEN, TAG_LEN};
use crate::error::{Result, VaultError};

pub const RECORD_VERSION: u32 = 1;

/// The at-rest and on-the-wire shape of an encrypted wallet. Binary fields
/// travel as base64; the authentication tag is stored apart from the
/// ciphertext, and `hmac` is a second integrity seal over the raw
/// ciphertext bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    pub version: u32,
    pub salt: String,
    pub iv: String,
    pub tag: String,
    pub ciphertext: String,
    pub hmac: String,
}

impl EncryptedRecord {
    pub fn assemble(salt: &[u8], iv: &[u8], ciphertext: &[u8], tag: &[u8], hmac: &[u8]) -> Self {
        Self {
            version: RECORD_VERSION,
            salt: general_purpose::STANDARD.encode(salt),
            iv: general_purpose::STANDARD.encode(iv),
            tag: general_purpose::STANDARD.encode(tag),
            ciphertext: general_purpose::STANDARD.encode(ciphertext),
            hmac: general_purpose::STANDARD.encode(hmac),
        }
    }

    /// Unknown layout versions fail closed; nothing else is attempted.
    pub fn check_version(&self) -> Result<()> {
        if self.version != RECORD_VERSION {
            return Err(VaultError::CorruptRecord(format!(
                "unsupported record version {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn salt_bytes(&self) -> Result<Vec<u8>> {
        let salt = decode_field("salt", &self.salt)?;
        if salt.is_empty() {
            return Err(VaultError::CorruptRecord("salt: empty".to_string()));
        }
        Ok(salt)
    }

    pub fn iv_bytes(&self) -> Result<[u8; NONCE_LEN]> {
        decode_array("iv", &self.iv)
    }

    pub fn tag_bytes(&self) -> Result<[u8; TAG_LEN]> {
        decode_array("tag", &self.tag)
    }

    pub fn ciphertext_bytes(&self) -> Result<Vec<u8>> {
        decode_field("ciphertext", &self.ciphertext)
    }

    pub fn hmac_bytes(&self) -> Result<Vec<u8>> {
        decode_field("hmac", &self.hmac)
    }

    /// Serialized form used for checksums and change detection. Field order
    /// is fixed by the struct, so equal records always hash equal.
    pub fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(value)
        .map_err(|e| VaultError::CorruptRecord(format!("{name}: {e}")))
}

fn decode_array<const N: usize>(name: &str, value: &str) -> Result<[u8; N]> {
    decode_field(name, value)?
        .try_into()
        .map_err(|_| VaultError::CorruptRecord(format!("{name}: wrong length")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncryptedRecord {
        EncryptedRecord::assemble(
            &[1u8; 32],
            &[2u8; NONCE_LEN],
            b"opaque bytes",
            &[3u8; TAG_LEN],
            &[4u8; 32],
        )
    }

    #[test]
    fn serde_roundtrip() {
        let record = sample();
        let json = serde_json::to_string(&record).unwrap();
        let back: EncryptedRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
        assert_eq!(back.iv_bytes().unwrap(), [2u8; NONCE_LEN]);
        assert_eq!(back.ciphertext_bytes().unwrap(), b"opaque bytes");
    }

    #[test]
    fn unknown_version_fails_closed() {
        let mut record = sample();
        record.version = 2;
        assert!(matches!(
            record.check_version().unwrap_err(),
            VaultError::CorruptRecord(_)
        ));
    }

    #[test]
    fn malformed_base64_is_corrupt() {
        let mut record = sample();
        record.ciphertext = "@@not-base64@@".to_string();
        assert!(matches!(
            record.ciphertext_bytes().unwrap_err(),
            VaultError::CorruptRecord(_)
        ));
    }

    #[test]
    fn wrong_length_iv_is_corrupt() {
        let mut record = sample();
        record.iv = general_purpose::STANDARD.encode([0u8; 7]);
        assert!(matches!(
            record.iv_bytes().unwrap_err(),
            VaultError::CorruptRecord(_)
        ));
    }

    #[test]
    fn canonical_json_is_stable() {
        let record = sample();
        assert_eq!(
            record.canonical_json().unwrap(),
            record.clone().canonical_json().unwrap()
        );
    }
}
