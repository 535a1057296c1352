//! Recovery phrases: a 12-word BIP-39 mnemonic acts as a second,
//! password-independent credential for the wallet.

use bip39::{Language, Mnemonic, Seed};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::RngCore;

use crate::crypto::SessionKey;
use crate::error::{Result, VaultError};

pub const PHRASE_WORDS: usize = 12;
const PHRASE_ENTROPY_BYTES: usize = 16;

/// Generate a fresh 12-word phrase from 128 bits of OS entropy.
pub fn generate_phrase() -> Result<String> {
    let mut entropy = [0u8; PHRASE_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut entropy);
    let mnemonic = Mnemonic::from_entropy(&entropy, Language::English)
        .map_err(|e| VaultError::Cipher(format!("mnemonic: {e}")))?;
    Ok(mnemonic.into_phrase())
}

/// Checksum-validate a candidate phrase. Whitespace and case are forgiven;
/// anything other than 12 wordlist words is not.
pub fn validate_phrase(phrase: &str) -> bool {
    let normalized = normalize(phrase);
    if normalized.split(' ').count() != PHRASE_WORDS {
        return false;
    }
    Mnemonic::validate(&normalized, Language::English).is_ok()
}

/// Derive the 256-bit recovery key from a phrase: the first 32 bytes of the
/// BIP-39 seed with an empty passphrase. Deterministic, and entirely
/// independent of the password KDF.
pub fn phrase_to_key(phrase: &str) -> Result<SessionKey> {
    let normalized = normalize(phrase);
    let mnemonic = Mnemonic::from_phrase(&normalized, Language::English)
        .map_err(|_| VaultError::InvalidCredential)?;
    let seed = Seed::new(&mnemonic, "");
    let mut key = [0u8; 32];
    key.copy_from_slice(&seed.as_bytes()[..32]);
    Ok(SessionKey::from_bytes(key))
}

/// Pick `count` distinct random word positions for setup verification,
/// returned sorted by position as (index, word) pairs.
pub fn verification_challenge(phrase: &str, count: usize) -> Vec<(usize, String)> {
    let words: Vec<&str> = phrase.split_whitespace().collect();
    let mut positions: Vec<usize> = (0..words.len()).collect();
    positions.shuffle(&mut OsRng);
    positions.truncate(count.min(words.len()));
    positions.sort_unstable();
    positions
        .into_iter()
        .map(|i| (i, words[i].to_string()))
        .collect()
}

fn normalize(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_phrase_validates() {
        let phrase = generate_phrase().unwrap();
        assert_eq!(phrase.split(' ').count(), PHRASE_WORDS);
        assert!(validate_phrase(&phrase));
    }

    #[test]
    fn normalization_forgives_case_and_spacing() {
        let phrase = generate_phrase().unwrap();
        let messy = format!("  {}  ", phrase.to_uppercase().replace(' ', "   "));
        assert!(validate_phrase(&messy));
        let a = phrase_to_key(&phrase).unwrap();
        let b = phrase_to_key(&messy).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn tampered_phrase_rejected() {
        let phrase = generate_phrase().unwrap();
        let mut words: Vec<&str> = phrase.split(' ').collect();
        words[0] = if words[0] == "abandon" { "ability" } else { "abandon" };
        let tampered = words.join(" ");
        // A single-word swap breaks the checksum in almost every case; when
        // it happens to survive, the derived key must still differ.
        if validate_phrase(&tampered) {
            let a = phrase_to_key(&phrase).unwrap();
            let b = phrase_to_key(&tampered).unwrap();
            assert_ne!(a.as_bytes(), b.as_bytes());
        }
        assert!(!validate_phrase("not a mnemonic at all"));
        assert!(!validate_phrase(""));
    }

    #[test]
    fn phrase_key_is_deterministic() {
        let phrase = generate_phrase().unwrap();
        let a = phrase_to_key(&phrase).unwrap();
        let b = phrase_to_key(&phrase).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn challenge_positions_are_distinct_sorted_members() {
        let phrase = generate_phrase().unwrap();
        let words: Vec<&str> = phrase.split(' ').collect();
        let challenge = verification_challenge(&phrase, 3);
        assert_eq!(challenge.len(), 3);
        for window in challenge.windows(2) {
            assert!(window[0].0 < window[1].0);
        }
        for (index, word) in &challenge {
            assert_eq!(words[*index], word);
        }
    }

    #[test]
    fn challenge_caps_at_phrase_length() {
        let phrase = generate_phrase().unwrap();
        let challenge = verification_challenge(&phrase, 40);
        assert_eq!(challenge.len(), PHRASE_WORDS);
    }
}
