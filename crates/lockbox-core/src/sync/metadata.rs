//! Dashboard metadata extraction.
//!
//! The dashboard renders vault and service counts without ever holding key
//! material. Everything in [`SyncMetadata`] is safe to store server-side:
//! key values and key names never leave the client.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto;
use crate::error::Result;
use crate::record::EncryptedRecord;
use crate::wallet::Wallet;

/// Per-vault summary shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultSummary {
    pub id: Uuid,
    pub name: String,
    pub key_count: usize,
    pub services: Vec<String>,
    pub last_modified: DateTime<Utc>,
}

/// Per-service aggregate across all vaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub name: String,
    pub key_count: usize,
    /// Always empty. Key names stay on the client.
    pub key_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub vault_count: usize,
    pub total_keys: usize,
    pub vaults: Vec<VaultSummary>,
    pub services: Vec<ServiceSummary>,
    pub last_modified: DateTime<Utc>,
}

impl SyncMetadata {
    /// Placeholder pushed when no decrypted wallet is available, e.g. a push
    /// triggered while the wallet is locked.
    pub fn empty() -> Self {
        Self {
            vault_count: 0,
            total_keys: 0,
            vaults: Vec::new(),
            services: Vec::new(),
            last_modified: Utc::now(),
        }
    }
}

/// Summarise a decrypted wallet for the dashboard.
pub fn extract_metadata(wallet: &Wallet) -> SyncMetadata {
    let mut service_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut total_keys = 0;

    let vaults = wallet
        .vaults
        .iter()
        .map(|vault| {
            let mut services: Vec<String> = Vec::new();
            for key in &vault.keys {
                if !services.contains(&key.service) {
                    services.push(key.service.clone());
                }
                *service_counts.entry(key.service.clone()).or_insert(0) += 1;
            }
            total_keys += vault.keys.len();
            VaultSummary {
                id: vault.id,
                name: vault.name.clone(),
                key_count: vault.keys.len(),
                services,
                last_modified: vault.updated_at,
            }
        })
        .collect();

    let services = service_counts
        .into_iter()
        .map(|(name, key_count)| ServiceSummary {
            name,
            key_count,
            key_names: Vec::new(),
        })
        .collect();

    SyncMetadata {
        vault_count: wallet.vaults.len(),
        total_keys,
        vaults,
        services,
        last_modified: Utc::now(),
    }
}

/// Checksum over the exact serialised record the server will store, so the
/// dashboard can detect divergence without decrypting anything.
pub fn record_checksum(record: &EncryptedRecord) -> Result<String> {
    Ok(crypto::sha256_hex(record.canonical_json()?.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::KeyDraft;

    fn wallet_with_keys() -> Wallet {
        let mut wallet = Wallet::with_default_vault();
        let vault_id = wallet.vaults[0].id;
        wallet
            .add_key(
                vault_id,
                KeyDraft {
                    service: "openai".into(),
                    name: "API_KEY".into(),
                    value: "sk-test-123".into(),
                    notes: String::new(),
                    expires_at: None,
                    favourite: false,
                },
            )
            .unwrap();
        wallet
            .add_key(
                vault_id,
                KeyDraft {
                    service: "openai".into(),
                    name: "ORG_KEY".into(),
                    value: "sk-org-456".into(),
                    notes: String::new(),
                    expires_at: None,
                    favourite: false,
                },
            )
            .unwrap();
        wallet
            .add_key(
                vault_id,
                KeyDraft {
                    service: "stripe".into(),
                    name: "SECRET_KEY".into(),
                    value: "sk_live_789".into(),
                    notes: String::new(),
                    expires_at: None,
                    favourite: false,
                },
            )
            .unwrap();
        wallet
    }

    #[test]
    fn counts_keys_and_services() {
        let wallet = wallet_with_keys();
        let meta = extract_metadata(&wallet);

        assert_eq!(meta.vault_count, 1);
        assert_eq!(meta.total_keys, 3);
        assert_eq!(meta.vaults.len(), 1);
        assert_eq!(meta.vaults[0].key_count, 3);
        assert_eq!(meta.vaults[0].services, vec!["openai", "stripe"]);

        let openai = meta.services.iter().find(|s| s.name == "openai").unwrap();
        assert_eq!(openai.key_count, 2);
        let stripe = meta.services.iter().find(|s| s.name == "stripe").unwrap();
        assert_eq!(stripe.key_count, 1);
    }

    #[test]
    fn key_names_stay_on_the_client() {
        let wallet = wallet_with_keys();
        let meta = extract_metadata(&wallet);

        for service in &meta.services {
            assert!(service.key_names.is_empty());
        }

        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("API_KEY"));
        assert!(!json.contains("SECRET_KEY"));
        assert!(!json.contains("sk-test-123"));
        assert!(!json.contains("sk_live_789"));
        // Service names are deliberately visible.
        assert!(json.contains("openai"));
    }

    #[test]
    fn empty_metadata_has_no_structure() {
        let meta = SyncMetadata::empty();
        assert_eq!(meta.vault_count, 0);
        assert_eq!(meta.total_keys, 0);
        assert!(meta.vaults.is_empty());
        assert!(meta.services.is_empty());
    }

    #[test]
    fn serialises_with_camel_case_fields() {
        let meta = extract_metadata(&wallet_with_keys());
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("vaultCount").is_some());
        assert!(json.get("totalKeys").is_some());
        assert!(json["vaults"][0].get("keyCount").is_some());
        assert!(json["services"][0].get("keyNames").is_some());
    }
}
