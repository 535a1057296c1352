//! Wallet reconciliation for two-way sync.
//!
//! Reconciliation is last-writer-wins over the whole wallet. Both sides carry
//! complete snapshots, so picking the newer one can never interleave half of
//! each and produce a wallet neither device ever held. Ties keep the local
//! copy, which makes merging a wallet with itself a no-op.

use crate::wallet::Wallet;

/// Pick the wallet with the newest edit anywhere inside it.
pub fn merge_wallets(local: Wallet, remote: Wallet) -> Wallet {
    if remote.latest_timestamp() > local.latest_timestamp() {
        remote
    } else {
        local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::KeyDraft;
    use chrono::Duration;

    fn draft(name: &str) -> KeyDraft {
        KeyDraft {
            service: "openai".into(),
            name: name.into(),
            value: "sk-test-123".into(),
            notes: String::new(),
            expires_at: None,
            favourite: false,
        }
    }

    #[test]
    fn newer_remote_replaces_local() {
        let local = Wallet::with_default_vault();
        let mut remote = local.clone();
        let vault_id = remote.vaults[0].id;
        remote.add_key(vault_id, draft("API_KEY")).unwrap();
        // add_key stamps updated_at with now(), strictly after the local copy.
        assert!(remote.latest_timestamp() > local.latest_timestamp());

        let merged = merge_wallets(local, remote);
        assert_eq!(merged.total_keys(), 1);
    }

    #[test]
    fn older_remote_is_discarded() {
        let mut local = Wallet::with_default_vault();
        let vault_id = local.vaults[0].id;
        let mut remote = local.clone();
        remote.vaults[0].updated_at -= Duration::hours(1);
        local.add_key(vault_id, draft("API_KEY")).unwrap();

        let merged = merge_wallets(local, remote);
        assert_eq!(merged.total_keys(), 1);
    }

    #[test]
    fn tie_keeps_local() {
        let mut local = Wallet::with_default_vault();
        local.vaults[0].name = "Local".into();
        let mut remote = local.clone();
        remote.vaults[0].name = "Remote".into();
        assert_eq!(local.latest_timestamp(), remote.latest_timestamp());

        let merged = merge_wallets(local, remote);
        assert_eq!(merged.vaults[0].name, "Local");
    }

    #[test]
    fn merging_a_wallet_with_itself_changes_nothing() {
        let mut wallet = Wallet::with_default_vault();
        let vault_id = wallet.vaults[0].id;
        wallet.add_key(vault_id, draft("API_KEY")).unwrap();

        let merged = merge_wallets(wallet.clone(), wallet.clone());
        assert_eq!(
            serde_json::to_value(&merged).unwrap(),
            serde_json::to_value(&wallet).unwrap()
        );
    }
}
