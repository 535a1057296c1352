//! Wallet codec: the lifecycle between a decrypted [`Wallet`] and its
//! [`EncryptedRecord`] forms.
//!
//! Two records exist side by side once recovery is set up: the primary
//! record keyed by the password KDF and the recovery record keyed by the
//! phrase-derived key. Both always seal the same wallet content. On every
//! open the HMAC is verified before the AEAD runs, and both failure modes
//! surface as the same `InvalidCredential`.

use base64::{engine::general_purpose, Engine as _};
use zeroize::Zeroizing;

use crate::crypto::{self, SessionKey};
use crate::error::{Result, VaultError};
use crate::record::EncryptedRecord;
use crate::recovery;
use crate::wallet::Wallet;

/// Everything produced by first-time setup. The phrase is shown to the user
/// exactly once and never persisted.
#[derive(Debug)]
pub struct CreatedWallet {
    pub wallet: Wallet,
    pub primary: EncryptedRecord,
    pub recovery: EncryptedRecord,
    pub recovery_phrase: Zeroizing<String>,
    pub session_key: SessionKey,
}

/// Create a wallet with one default vault, a fresh recovery phrase, and the
/// same content sealed under both the password and the recovery key.
pub fn create_wallet(password: &str) -> Result<CreatedWallet> {
    if password.is_empty() {
        return Err(VaultError::InvalidCredential);
    }
    let phrase = recovery::generate_phrase()?;
    let recovery_key = recovery::phrase_to_key(&phrase)?;

    let mut wallet = Wallet::with_default_vault();
    wallet.recovery_key = Some(general_purpose::STANDARD.encode(recovery_key.as_bytes()));

    let salt = crypto::generate_salt();
    let session_key = crypto::derive_key(password, &salt);
    let primary = seal(&wallet, &session_key, &salt)?;
    let recovery_record = seal(&wallet, &recovery_key, &crypto::generate_salt())?;

    Ok(CreatedWallet {
        wallet,
        primary,
        recovery: recovery_record,
        recovery_phrase: Zeroizing::new(phrase),
        session_key,
    })
}

/// Open a record with a password. The KDF runs against the record's own
/// salt, so the same password unlocks the record on any device.
pub fn unlock(password: &str, record: &EncryptedRecord) -> Result<(Wallet, SessionKey)> {
    record.check_version()?;
    let salt = record.salt_bytes()?;
    let key = crypto::derive_key(password, &salt);
    let wallet = open(&key, record)?;
    Ok((wallet, key))
}

/// Open a recovery record with the 12-word phrase. An unparseable phrase is
/// indistinguishable from a wrong one.
pub fn unlock_with_phrase(phrase: &str, record: &EncryptedRecord) -> Result<(Wallet, SessionKey)> {
    record.check_version()?;
    let key = recovery::phrase_to_key(phrase)?;
    let wallet = open(&key, record)?;
    Ok((wallet, key))
}

/// Re-open with an already-derived key, skipping the KDF. Used by the
/// background context and by conflict retries.
pub fn unlock_with_key(key: &SessionKey, record: &EncryptedRecord) -> Result<Wallet> {
    record.check_version()?;
    open(key, record)
}

/// Re-encrypt the wallet under its existing salt. The nonce and both
/// integrity seals are always fresh.
pub fn save(wallet: &Wallet, key: &SessionKey, salt: &[u8]) -> Result<EncryptedRecord> {
    seal(wallet, key, salt)
}

/// Seal the primary record, and when the wallet carries a recovery key,
/// regenerate the recovery record from the same content so the two can
/// never drift apart.
pub fn save_both(
    wallet: &Wallet,
    key: &SessionKey,
    salt: &[u8],
) -> Result<(EncryptedRecord, Option<EncryptedRecord>)> {
    let primary = seal(wallet, key, salt)?;
    let recovery_record = match wallet.recovery_key.as_deref() {
        Some(encoded) => {
            let recovery_key = decode_recovery_key(encoded)?;
            Some(seal(wallet, &recovery_key, &crypto::generate_salt())?)
        }
        None => None,
    };
    Ok((primary, recovery_record))
}

/// Rotate the password: verify the current one, then re-seal under a new
/// random salt. Fails closed, and never touches the recovery record.
pub fn change_password(
    current: &str,
    new_password: &str,
    record: &EncryptedRecord,
) -> Result<(Wallet, EncryptedRecord, SessionKey)> {
    if new_password.is_empty() {
        return Err(VaultError::InvalidCredential);
    }
    let (wallet, _) = unlock(current, record)?;
    let salt = crypto::generate_salt();
    let key = crypto::derive_key(new_password, &salt);
    let primary = seal(&wallet, &key, &salt)?;
    Ok((wallet, primary, key))
}

/// Embed a phrase-derived recovery key into a wallet created before
/// recovery existed. Subsequent saves will emit both records.
pub fn setup_recovery(phrase: &str, wallet: &mut Wallet) -> Result<()> {
    if !recovery::validate_phrase(phrase) {
        return Err(VaultError::InvalidCredential);
    }
    let key = recovery::phrase_to_key(phrase)?;
    wallet.recovery_key = Some(general_purpose::STANDARD.encode(key.as_bytes()));
    Ok(())
}

fn seal(wallet: &Wallet, key: &SessionKey, salt: &[u8]) -> Result<EncryptedRecord> {
    let plaintext = Zeroizing::new(serde_json::to_vec(wallet)?);
    let (iv, ciphertext, tag) = crypto::encrypt(key, &plaintext)?;
    let hmac = crypto::compute_mac(key, &ciphertext)?;
    Ok(EncryptedRecord::assemble(salt, &iv, &ciphertext, &tag, &hmac))
}

fn open(key: &SessionKey, record: &EncryptedRecord) -> Result<Wallet> {
    let ciphertext = record.ciphertext_bytes()?;
    let hmac = record.hmac_bytes()?;
    if !crypto::verify_mac(key, &ciphertext, &hmac) {
        return Err(VaultError::InvalidCredential);
    }
    let iv = record.iv_bytes()?;
    let tag = record.tag_bytes()?;
    let plaintext = Zeroizing::new(crypto::decrypt(key, &iv, &ciphertext, &tag)?);
    serde_json::from_slice(&plaintext)
        .map_err(|e| VaultError::CorruptRecord(format!("payload: {e}")))
}

fn decode_recovery_key(encoded: &str) -> Result<SessionKey> {
    let bytes = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| VaultError::CorruptRecord(format!("recoveryKey: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| VaultError::CorruptRecord("recoveryKey: wrong length".to_string()))?;
    Ok(SessionKey::from_bytes(bytes))
}
