//! Command surface over the vault.
//!
//! One [`WalletService`] owns the unlocked state for its process and
//! dispatches [`WalletCommand`]s from whatever frontend is attached. Every
//! mutation re-encrypts and persists both records before returning, then
//! kicks off a background push; the local save never waits on the network.
//!
//! Saves are guarded against concurrent writers: the service remembers the
//! checksum of the record its in-memory wallet came from, re-reads before
//! writing, and on mismatch reloads and re-applies the change instead of
//! clobbering the other writer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::autolock::ActivitySignal;
use crate::codec;
use crate::config::{AccountInfo, WalletConfig, WalletStatus};
use crate::crypto::{self, SessionKey};
use crate::detect::{detect_service, parse_env_block};
use crate::error::{Result, VaultError};
use crate::session::SessionKeyCache;
use crate::store::{self, DurableStore, Tier};
use crate::sync::{merge_wallets, record_checksum, HttpSyncClient, SyncEngine, SyncState};
use crate::wallet::{ApiKey, AuditAction, AuditEntry, KeyDraft, KeyPatch, SecretString, Wallet};

const SAVE_RETRIES: usize = 3;
const CAPTURE_NOTES: &str = "Auto-captured from page";

// ── Commands and responses ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "data")]
pub enum WalletCommand {
    GetStatus,
    Create {
        password: String,
    },
    Unlock {
        password: String,
    },
    UnlockWithPhrase {
        phrase: String,
    },
    Lock,
    ListKeys,
    ListVaults,
    RevealKey {
        key_id: Uuid,
    },
    AddKey {
        vault_id: Uuid,
        draft: KeyDraft,
    },
    UpdateKey {
        key_id: Uuid,
        patch: KeyPatch,
    },
    DeleteKey {
        key_id: Uuid,
    },
    CaptureKey {
        service: String,
        name: String,
        value: String,
    },
    RecordAccess {
        key_id: Uuid,
        action: AuditAction,
        site: Option<String>,
    },
    AuditLog {
        key_id: Option<Uuid>,
    },
    AddVault {
        name: String,
        description: String,
        icon: String,
    },
    UpdateVault {
        vault_id: Uuid,
        name: Option<String>,
        description: Option<String>,
        icon: Option<String>,
    },
    DeleteVault {
        vault_id: Uuid,
    },
    ImportEnv {
        vault_id: Uuid,
        env: String,
    },
    ChangePassword {
        current: String,
        new: String,
    },
    SetupRecovery {
        phrase: String,
    },
    LinkAccount {
        email: Option<String>,
        token: String,
    },
    UpdateConfig {
        config: WalletConfig,
    },
    SyncNow,
    PullRemote,
    Activity,
    DeleteWallet,
}

/// Non-secret listing of one key. `preview` masks all but the edges of the
/// value; the full value only ever crosses in [`WalletResponse::Revealed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySummary {
    pub id: Uuid,
    pub vault_id: Uuid,
    pub vault_name: String,
    pub service: String,
    pub name: String,
    pub preview: String,
    pub favourite: bool,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultInfo {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub key_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealedKey {
    pub id: Uuid,
    pub service: String,
    pub name: String,
    pub value: SecretString,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "response", content = "data")]
pub enum WalletResponse {
    Status {
        status: WalletStatus,
        unlocked: bool,
        sync: SyncState,
        config: WalletConfig,
    },
    Created {
        recovery_phrase: String,
    },
    Unlocked {
        vault_count: usize,
        key_count: usize,
    },
    WalletLocked,
    Keys {
        keys: Vec<KeySummary>,
    },
    Vaults {
        vaults: Vec<VaultInfo>,
    },
    Revealed {
        key: RevealedKey,
    },
    KeyAdded {
        key_id: Uuid,
    },
    KeyUpdated,
    KeyDeleted,
    KeyCaptured {
        key_id: Uuid,
    },
    CaptureSkipped {
        reason: String,
    },
    AccessRecorded,
    Audit {
        entries: Vec<AuditEntry>,
    },
    VaultAdded {
        vault_id: Uuid,
    },
    VaultUpdated,
    VaultDeleted,
    EnvImported {
        imported: usize,
    },
    PasswordChanged,
    RecoveryConfigured,
    AccountLinked {
        name: String,
    },
    ConfigUpdated {
        config: WalletConfig,
    },
    SyncTriggered {
        state: SyncState,
    },
    Pulled {
        updated: bool,
    },
    ActivityNoted,
    WalletDeleted,
    Error {
        code: String,
        message: String,
    },
}

impl WalletResponse {
    /// Folds an error into the response union for callers on the far side
    /// of a serialised seam.
    pub fn from_error(err: &VaultError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ── Service ──────────────────────────────────────────────────────────────────

struct UnlockedState {
    wallet: Wallet,
    key: SessionKey,
    salt: Vec<u8>,
    /// Checksum of the primary record this state was loaded from; compared
    /// before every save to catch a concurrent writer.
    base_checksum: String,
    /// Phrase-derived sessions are read-only until a new password is set,
    /// because re-sealing the primary record needs the password key.
    via_recovery: bool,
}

pub struct WalletService {
    store: Arc<dyn DurableStore>,
    cache: SessionKeyCache,
    sync: Arc<SyncEngine>,
    activity: Arc<ActivitySignal>,
    state: Mutex<Option<UnlockedState>>,
}

impl WalletService {
    pub fn new(
        store: Arc<dyn DurableStore>,
        cache: SessionKeyCache,
        sync: Arc<SyncEngine>,
        activity: Arc<ActivitySignal>,
    ) -> Self {
        Self {
            store,
            cache,
            sync,
            activity,
            state: Mutex::new(None),
        }
    }

    /// Rebuild the sync transport from the stored account, e.g. at startup
    /// or after the endpoint or token changed.
    pub async fn restore_transport(&self) -> Result<()> {
        let config = store::load_config(self.store.as_ref()).await?;
        let account = store::load_account(self.store.as_ref()).await?;
        match account.and_then(|account| account.token) {
            Some(token) => {
                let client = HttpSyncClient::new(&config.endpoint_base_url, &token);
                self.sync.set_transport(Some(Arc::new(client)));
            }
            None => self.sync.set_transport(None),
        }
        Ok(())
    }

    pub async fn handle(&self, command: WalletCommand) -> Result<WalletResponse> {
        match command {
            WalletCommand::GetStatus => self.status().await,
            WalletCommand::Create { password } => self.create(&password).await,
            WalletCommand::Unlock { password } => self.unlock(&password).await,
            WalletCommand::UnlockWithPhrase { phrase } => self.unlock_with_phrase(&phrase).await,
            WalletCommand::Lock => self.lock().await,
            WalletCommand::ListKeys => self.list_keys().await,
            WalletCommand::ListVaults => self.list_vaults().await,
            WalletCommand::RevealKey { key_id } => self.reveal_key(key_id).await,
            WalletCommand::AddKey { vault_id, draft } => self.add_key(vault_id, draft).await,
            WalletCommand::UpdateKey { key_id, patch } => self.update_key(key_id, patch).await,
            WalletCommand::DeleteKey { key_id } => self.delete_key(key_id).await,
            WalletCommand::CaptureKey {
                service,
                name,
                value,
            } => self.capture_key(service, name, value).await,
            WalletCommand::RecordAccess {
                key_id,
                action,
                site,
            } => self.record_access(key_id, action, site).await,
            WalletCommand::AuditLog { key_id } => self.audit_log(key_id).await,
            WalletCommand::AddVault {
                name,
                description,
                icon,
            } => self.add_vault(name, description, icon).await,
            WalletCommand::UpdateVault {
                vault_id,
                name,
                description,
                icon,
            } => self.update_vault(vault_id, name, description, icon).await,
            WalletCommand::DeleteVault { vault_id } => self.delete_vault(vault_id).await,
            WalletCommand::ImportEnv { vault_id, env } => self.import_env(vault_id, env).await,
            WalletCommand::ChangePassword { current, new } => {
                self.change_password(&current, &new).await
            }
            WalletCommand::SetupRecovery { phrase } => self.setup_recovery(&phrase).await,
            WalletCommand::LinkAccount { email, token } => self.link_account(email, token).await,
            WalletCommand::UpdateConfig { config } => self.update_config(config).await,
            WalletCommand::SyncNow => self.sync_now().await,
            WalletCommand::PullRemote => self.pull_remote().await,
            WalletCommand::Activity => {
                self.activity.touch();
                Ok(WalletResponse::ActivityNoted)
            }
            WalletCommand::DeleteWallet => self.delete_wallet().await,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    async fn status(&self) -> Result<WalletResponse> {
        let status = store::load_status(self.store.as_ref()).await?;
        let unlocked = self.cache.is_cached().await?;
        let config = store::load_config(self.store.as_ref()).await?;
        Ok(WalletResponse::Status {
            status,
            unlocked,
            sync: self.sync.state(),
            config,
        })
    }

    async fn create(&self, password: &str) -> Result<WalletResponse> {
        if store::load_record(self.store.as_ref(), store::KEY_VAULT)
            .await?
            .is_some()
        {
            return Err(VaultError::WalletExists);
        }

        let created = codec::create_wallet(password)?;
        store::save_record(self.store.as_ref(), store::KEY_VAULT, &created.primary).await?;
        store::save_record(
            self.store.as_ref(),
            store::KEY_RECOVERY_VAULT,
            &created.recovery,
        )
        .await?;
        store::save_config(self.store.as_ref(), &WalletConfig::default()).await?;
        store::save_account(self.store.as_ref(), &AccountInfo::local("My Wallet")).await?;
        store::save_status(self.store.as_ref(), WalletStatus::Unlocked).await?;
        self.cache.set(&created.session_key).await?;

        *self.state.lock().await = Some(UnlockedState {
            salt: created.primary.salt_bytes()?,
            base_checksum: record_checksum(&created.primary)?,
            wallet: created.wallet,
            key: created.session_key,
            via_recovery: false,
        });
        self.activity.touch();
        info!("wallet created");

        Ok(WalletResponse::Created {
            recovery_phrase: created.recovery_phrase.to_string(),
        })
    }

    async fn unlock(&self, password: &str) -> Result<WalletResponse> {
        let record = store::load_record(self.store.as_ref(), store::KEY_VAULT)
            .await?
            .ok_or(VaultError::NoVaultFound)?;
        let (wallet, key) = codec::unlock(password, &record)?;

        self.cache.set(&key).await?;
        store::save_status(self.store.as_ref(), WalletStatus::Unlocked).await?;

        let vault_count = wallet.vaults.len();
        let key_count = wallet.total_keys();
        let snapshot = wallet.clone();
        *self.state.lock().await = Some(UnlockedState {
            salt: record.salt_bytes()?,
            base_checksum: record_checksum(&record)?,
            wallet,
            key,
            via_recovery: false,
        });
        self.activity.touch();
        // An unlock is also the retry trigger for any earlier failed push.
        self.fire_push(Some(snapshot));

        Ok(WalletResponse::Unlocked {
            vault_count,
            key_count,
        })
    }

    async fn unlock_with_phrase(&self, phrase: &str) -> Result<WalletResponse> {
        let record = store::load_record(self.store.as_ref(), store::KEY_RECOVERY_VAULT)
            .await?
            .ok_or(VaultError::NoVaultFound)?;
        let (wallet, key) = codec::unlock_with_phrase(phrase, &record)?;

        self.cache.set(&key).await?;
        store::save_status(self.store.as_ref(), WalletStatus::Unlocked).await?;

        let vault_count = wallet.vaults.len();
        let key_count = wallet.total_keys();
        // base_checksum still tracks the primary record: it is what a later
        // password reset will replace.
        let base_checksum =
            match store::load_record(self.store.as_ref(), store::KEY_VAULT).await? {
                Some(primary) => record_checksum(&primary)?,
                None => String::new(),
            };
        *self.state.lock().await = Some(UnlockedState {
            salt: record.salt_bytes()?,
            base_checksum,
            wallet,
            key,
            via_recovery: true,
        });
        self.activity.touch();
        info!("wallet opened with recovery phrase");

        Ok(WalletResponse::Unlocked {
            vault_count,
            key_count,
        })
    }

    async fn lock(&self) -> Result<WalletResponse> {
        self.cache.clear().await?;
        store::save_status(self.store.as_ref(), WalletStatus::Locked).await?;
        *self.state.lock().await = None;
        Ok(WalletResponse::WalletLocked)
    }

    async fn delete_wallet(&self) -> Result<WalletResponse> {
        // Possession of the password or the phrase authorises deletion.
        {
            let mut guard = self.state.lock().await;
            self.ensure_unlocked(&mut guard).await?;
        }
        if let Err(err) = self.sync.reset_remote().await {
            warn!(error = %err, "remote reset failed; deleting local wallet anyway");
        }
        for key in [
            store::KEY_VAULT,
            store::KEY_RECOVERY_VAULT,
            store::KEY_CONFIG,
            store::KEY_ACCOUNT,
            store::KEY_STATUS,
        ] {
            self.store.remove(Tier::Durable, key).await?;
        }
        self.cache.clear().await?;
        *self.state.lock().await = None;
        self.sync.set_transport(None);
        info!("wallet deleted");
        Ok(WalletResponse::WalletDeleted)
    }

    // ── Key operations ───────────────────────────────────────────────────────

    async fn list_keys(&self) -> Result<WalletResponse> {
        self.read(|state| {
            let mut keys = Vec::with_capacity(state.wallet.total_keys());
            for vault in &state.wallet.vaults {
                for key in &vault.keys {
                    keys.push(KeySummary {
                        id: key.id,
                        vault_id: vault.id,
                        vault_name: vault.name.clone(),
                        service: key.service.clone(),
                        name: key.name.clone(),
                        preview: key.value.preview(),
                        favourite: key.favourite,
                        notes: key.notes.clone(),
                    });
                }
            }
            Ok(WalletResponse::Keys { keys })
        })
        .await
    }

    async fn list_vaults(&self) -> Result<WalletResponse> {
        self.read(|state| {
            let vaults = state
                .wallet
                .vaults
                .iter()
                .map(|vault| VaultInfo {
                    id: vault.id,
                    name: vault.name.clone(),
                    description: vault.description.clone(),
                    icon: vault.icon.clone(),
                    key_count: vault.keys.len(),
                })
                .collect();
            Ok(WalletResponse::Vaults { vaults })
        })
        .await
    }

    async fn reveal_key(&self, key_id: Uuid) -> Result<WalletResponse> {
        if self.in_recovery_session().await? {
            // Read-only session: hand the value back without the audit write,
            // which would need the password key to persist.
            return self
                .read(|state| {
                    let key = state
                        .wallet
                        .key(key_id)
                        .ok_or(VaultError::KeyNotFound(key_id))?;
                    Ok(WalletResponse::Revealed {
                        key: revealed_from(key),
                    })
                })
                .await;
        }
        let key = self
            .mutate(|wallet| {
                wallet.record_access(key_id, AuditAction::Accessed, None)?;
                let key = wallet.key(key_id).ok_or(VaultError::KeyNotFound(key_id))?;
                Ok(revealed_from(key))
            })
            .await?;
        Ok(WalletResponse::Revealed { key })
    }

    async fn add_key(&self, vault_id: Uuid, draft: KeyDraft) -> Result<WalletResponse> {
        let key_id = self
            .mutate(|wallet| wallet.add_key(vault_id, draft.clone()))
            .await?;
        Ok(WalletResponse::KeyAdded { key_id })
    }

    async fn update_key(&self, key_id: Uuid, patch: KeyPatch) -> Result<WalletResponse> {
        self.mutate(|wallet| wallet.update_key(key_id, patch.clone()))
            .await?;
        Ok(WalletResponse::KeyUpdated)
    }

    async fn delete_key(&self, key_id: Uuid) -> Result<WalletResponse> {
        self.mutate(|wallet| wallet.delete_key(key_id)).await?;
        Ok(WalletResponse::KeyDeleted)
    }

    /// Background capture from a page. Never errors on a locked wallet:
    /// captures race the user's session and a miss is normal.
    async fn capture_key(
        &self,
        service: String,
        name: String,
        value: String,
    ) -> Result<WalletResponse> {
        let config = store::load_config(self.store.as_ref()).await?;
        if !config.key_capture_enabled {
            return Ok(WalletResponse::CaptureSkipped {
                reason: "disabled".into(),
            });
        }

        let detected = detect_service(&value);
        let service = if service.is_empty() {
            detected.map(|(service, _)| service).unwrap_or("unknown").to_string()
        } else {
            service
        };
        let name = if name.is_empty() {
            detected
                .map(|(_, key_name)| key_name)
                .unwrap_or("Captured Key")
                .to_string()
        } else {
            name
        };

        let result = self
            .mutate(|wallet| {
                let vault_id = wallet
                    .vaults
                    .first()
                    .map(|vault| vault.id)
                    .ok_or_else(|| VaultError::CorruptRecord("wallet has no vaults".into()))?;
                wallet.add_key(
                    vault_id,
                    KeyDraft {
                        service: service.clone(),
                        name: name.clone(),
                        value: value.as_str().into(),
                        notes: CAPTURE_NOTES.into(),
                        expires_at: None,
                        favourite: false,
                    },
                )
            })
            .await;

        match result {
            Ok(key_id) => Ok(WalletResponse::KeyCaptured { key_id }),
            Err(VaultError::Locked) | Err(VaultError::PasswordResetRequired) => {
                Ok(WalletResponse::CaptureSkipped {
                    reason: "locked".into(),
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn record_access(
        &self,
        key_id: Uuid,
        action: AuditAction,
        site: Option<String>,
    ) -> Result<WalletResponse> {
        self.mutate(|wallet| wallet.record_access(key_id, action, site.clone()))
            .await?;
        Ok(WalletResponse::AccessRecorded)
    }

    async fn audit_log(&self, key_id: Option<Uuid>) -> Result<WalletResponse> {
        self.read(|state| {
            let entries = state
                .wallet
                .audit_log
                .iter()
                .filter(|entry| key_id.map_or(true, |id| entry.key_id == id))
                .cloned()
                .collect();
            Ok(WalletResponse::Audit { entries })
        })
        .await
    }

    // ── Vault operations ─────────────────────────────────────────────────────

    async fn add_vault(
        &self,
        name: String,
        description: String,
        icon: String,
    ) -> Result<WalletResponse> {
        let vault_id = self
            .mutate(|wallet| Ok(wallet.add_vault(&name, &description, &icon)))
            .await?;
        Ok(WalletResponse::VaultAdded { vault_id })
    }

    async fn update_vault(
        &self,
        vault_id: Uuid,
        name: Option<String>,
        description: Option<String>,
        icon: Option<String>,
    ) -> Result<WalletResponse> {
        self.mutate(|wallet| {
            wallet.rename_vault(vault_id, name.clone(), description.clone(), icon.clone())
        })
        .await?;
        Ok(WalletResponse::VaultUpdated)
    }

    async fn delete_vault(&self, vault_id: Uuid) -> Result<WalletResponse> {
        self.mutate(|wallet| wallet.delete_vault(vault_id)).await?;
        Ok(WalletResponse::VaultDeleted)
    }

    async fn import_env(&self, vault_id: Uuid, env: String) -> Result<WalletResponse> {
        let imported = self
            .mutate(|wallet| {
                let mut imported = 0;
                for (name, value) in parse_env_block(&env) {
                    let service = detect_service(&value)
                        .map(|(service, _)| service)
                        .unwrap_or("unknown");
                    wallet.add_key(
                        vault_id,
                        KeyDraft {
                            service: service.to_string(),
                            name,
                            value: value.into(),
                            notes: String::new(),
                            expires_at: None,
                            favourite: false,
                        },
                    )?;
                    imported += 1;
                }
                Ok(imported)
            })
            .await?;
        Ok(WalletResponse::EnvImported { imported })
    }

    // ── Credentials ──────────────────────────────────────────────────────────

    async fn change_password(&self, current: &str, new: &str) -> Result<WalletResponse> {
        let mut guard = self.state.lock().await;
        if guard.as_ref().map(|state| state.via_recovery) == Some(true) {
            return self.reset_password_from_recovery(&mut guard, new).await;
        }
        drop(guard);

        let record = store::load_record(self.store.as_ref(), store::KEY_VAULT)
            .await?
            .ok_or(VaultError::NoVaultFound)?;
        let (wallet, primary, key) = codec::change_password(current, new, &record)?;
        store::save_record(self.store.as_ref(), store::KEY_VAULT, &primary).await?;
        self.cache.set(&key).await?;
        store::save_status(self.store.as_ref(), WalletStatus::Unlocked).await?;

        let snapshot = wallet.clone();
        *self.state.lock().await = Some(UnlockedState {
            salt: primary.salt_bytes()?,
            base_checksum: record_checksum(&primary)?,
            wallet,
            key,
            via_recovery: false,
        });
        self.activity.touch();
        info!("password changed");
        self.fire_push(Some(snapshot));
        Ok(WalletResponse::PasswordChanged)
    }

    /// Completes a recovery: possession of the phrase stands in for the old
    /// password, and a fresh password key re-seals both records.
    async fn reset_password_from_recovery(
        &self,
        guard: &mut Option<UnlockedState>,
        new: &str,
    ) -> Result<WalletResponse> {
        if new.is_empty() {
            return Err(VaultError::InvalidCredential);
        }
        let state = guard.as_mut().ok_or(VaultError::Locked)?;

        let salt = crypto::generate_salt();
        let key = crypto::derive_key(new, &salt);
        let (primary, recovery) = codec::save_both(&state.wallet, &key, &salt)?;
        store::save_record(self.store.as_ref(), store::KEY_VAULT, &primary).await?;
        if let Some(recovery) = &recovery {
            store::save_record(self.store.as_ref(), store::KEY_RECOVERY_VAULT, recovery).await?;
        }
        self.cache.set(&key).await?;

        state.key = key;
        state.salt = salt.to_vec();
        state.base_checksum = record_checksum(&primary)?;
        state.via_recovery = false;
        self.activity.touch();
        info!("password reset from recovery phrase");

        let snapshot = state.wallet.clone();
        self.fire_push(Some(snapshot));
        Ok(WalletResponse::PasswordChanged)
    }

    async fn setup_recovery(&self, phrase: &str) -> Result<WalletResponse> {
        let phrase = phrase.to_string();
        self.mutate(|wallet| codec::setup_recovery(&phrase, wallet))
            .await?;
        Ok(WalletResponse::RecoveryConfigured)
    }

    // ── Account and sync ─────────────────────────────────────────────────────

    async fn link_account(
        &self,
        email: Option<String>,
        token: String,
    ) -> Result<WalletResponse> {
        let mut account = store::load_account(self.store.as_ref())
            .await?
            .unwrap_or_else(|| AccountInfo::local("My Wallet"));
        account.email = email;
        account.token = Some(token);
        store::save_account(self.store.as_ref(), &account).await?;
        self.restore_transport().await?;

        // First push right away so the dashboard shows the wallet.
        let wallet = self.unlocked_snapshot().await;
        self.fire_push(wallet);
        info!(name = %account.name, "dashboard account linked");
        Ok(WalletResponse::AccountLinked { name: account.name })
    }

    async fn update_config(&self, config: WalletConfig) -> Result<WalletResponse> {
        store::save_config(self.store.as_ref(), &config).await?;
        // The endpoint may have changed; rebuild the transport against it.
        self.restore_transport().await?;
        Ok(WalletResponse::ConfigUpdated { config })
    }

    async fn sync_now(&self) -> Result<WalletResponse> {
        let wallet = self.unlocked_snapshot().await;
        self.sync.push_current(wallet.as_ref()).await;
        Ok(WalletResponse::SyncTriggered {
            state: self.sync.state(),
        })
    }

    async fn pull_remote(&self) -> Result<WalletResponse> {
        let Some(remote) = self.sync.pull_remote().await? else {
            return Ok(WalletResponse::Pulled { updated: false });
        };

        let mut guard = self.state.lock().await;
        if guard.is_some() && !self.cache.is_cached().await? {
            *guard = None;
        }
        let Some(state) = guard.as_mut() else {
            // Locked: adopt the remote record; the next unlock decrypts it.
            store::save_record(self.store.as_ref(), store::KEY_VAULT, &remote).await?;
            return Ok(WalletResponse::Pulled { updated: true });
        };
        if state.via_recovery {
            return Err(VaultError::PasswordResetRequired);
        }

        let remote_wallet = codec::unlock_with_key(&state.key, &remote)?;
        let before = state.wallet.latest_timestamp();
        let merged = merge_wallets(state.wallet.clone(), remote_wallet);
        let updated = merged.latest_timestamp() > before;
        if updated {
            state.wallet = merged;
            let (primary, recovery) = codec::save_both(&state.wallet, &state.key, &state.salt)?;
            store::save_record(self.store.as_ref(), store::KEY_VAULT, &primary).await?;
            if let Some(recovery) = &recovery {
                store::save_record(self.store.as_ref(), store::KEY_RECOVERY_VAULT, recovery)
                    .await?;
            }
            state.base_checksum = record_checksum(&primary)?;
        }
        Ok(WalletResponse::Pulled { updated })
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Hydrate the unlocked state from the cached key if another context (or
    /// an earlier run) left one behind, and drop it if auto-lock cleared the
    /// cache underneath us.
    async fn ensure_unlocked(&self, guard: &mut Option<UnlockedState>) -> Result<()> {
        if guard.is_some() && !self.cache.is_cached().await? {
            *guard = None;
        }
        if guard.is_some() {
            return Ok(());
        }
        let Some(key) = self.cache.get().await? else {
            return Err(VaultError::Locked);
        };
        let Some(primary) = store::load_record(self.store.as_ref(), store::KEY_VAULT).await? else {
            return Err(VaultError::NoVaultFound);
        };
        match codec::unlock_with_key(&key, &primary) {
            Ok(wallet) => {
                *guard = Some(UnlockedState {
                    salt: primary.salt_bytes()?,
                    base_checksum: record_checksum(&primary)?,
                    wallet,
                    key,
                    via_recovery: false,
                });
                Ok(())
            }
            Err(VaultError::InvalidCredential) => {
                // The cached key may be phrase-derived; try the recovery
                // record before declaring the session dead.
                if let Some(recovery) =
                    store::load_record(self.store.as_ref(), store::KEY_RECOVERY_VAULT).await?
                {
                    if let Ok(wallet) = codec::unlock_with_key(&key, &recovery) {
                        *guard = Some(UnlockedState {
                            salt: recovery.salt_bytes()?,
                            base_checksum: record_checksum(&primary)?,
                            wallet,
                            key,
                            via_recovery: true,
                        });
                        return Ok(());
                    }
                }
                self.cache.clear().await?;
                store::save_status(self.store.as_ref(), WalletStatus::Locked).await?;
                Err(VaultError::Locked)
            }
            Err(err) => Err(err),
        }
    }

    async fn in_recovery_session(&self) -> Result<bool> {
        let mut guard = self.state.lock().await;
        self.ensure_unlocked(&mut guard).await?;
        Ok(guard.as_ref().map(|state| state.via_recovery) == Some(true))
    }

    async fn read<T>(&self, f: impl FnOnce(&UnlockedState) -> Result<T>) -> Result<T> {
        let mut guard = self.state.lock().await;
        self.ensure_unlocked(&mut guard).await?;
        let state = guard.as_ref().ok_or(VaultError::Locked)?;
        self.activity.touch();
        f(state)
    }

    /// Apply `op` to the wallet and persist both records, retrying against a
    /// fresh copy when another writer got there first.
    async fn mutate<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(&mut Wallet) -> Result<T>,
    {
        let mut guard = self.state.lock().await;
        self.ensure_unlocked(&mut guard).await?;
        let state = guard.as_mut().ok_or(VaultError::Locked)?;
        if state.via_recovery {
            return Err(VaultError::PasswordResetRequired);
        }

        for _ in 0..SAVE_RETRIES {
            let mut candidate = state.wallet.clone();
            let value = op(&mut candidate)?;
            let (primary, recovery) = codec::save_both(&candidate, &state.key, &state.salt)?;

            let current = store::load_record(self.store.as_ref(), store::KEY_VAULT)
                .await?
                .ok_or(VaultError::NoVaultFound)?;
            if record_checksum(&current)? != state.base_checksum {
                // Another writer replaced the record since this state was
                // loaded. Take their version and re-apply the change.
                let wallet = codec::unlock_with_key(&state.key, &current)?;
                state.wallet = wallet;
                state.salt = current.salt_bytes()?;
                state.base_checksum = record_checksum(&current)?;
                continue;
            }

            store::save_record(self.store.as_ref(), store::KEY_VAULT, &primary).await?;
            if let Some(recovery) = &recovery {
                store::save_record(self.store.as_ref(), store::KEY_RECOVERY_VAULT, recovery)
                    .await?;
            }
            state.wallet = candidate;
            state.base_checksum = record_checksum(&primary)?;
            self.activity.touch();

            let snapshot = state.wallet.clone();
            drop(guard);
            self.fire_push(Some(snapshot));
            return Ok(value);
        }
        Err(VaultError::Conflict)
    }

    async fn unlocked_snapshot(&self) -> Option<Wallet> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|state| state.wallet.clone())
    }

    /// Background push; the mutation that triggered it has already returned.
    fn fire_push(&self, wallet: Option<Wallet>) {
        let sync = self.sync.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let auto = store::load_config(store.as_ref())
                .await
                .map(|config| config.auto_sync_enabled)
                .unwrap_or(true);
            if auto {
                sync.push_current(wallet.as_ref()).await;
            }
        });
    }
}

fn revealed_from(key: &ApiKey) -> RevealedKey {
    RevealedKey {
        id: key.id,
        service: key.service.clone(),
        name: key.name.clone(),
        value: key.value.clone(),
        notes: key.notes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::sync::MemoryTransport;

    const PASSWORD: &str = "correct horse battery staple";

    fn build_service(store: Arc<MemoryStore>) -> (WalletService, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let sync = Arc::new(SyncEngine::with_transport(
            store.clone(),
            transport.clone(),
        ));
        let cache = SessionKeyCache::new(store.clone());
        let service = WalletService::new(store, cache, sync, Arc::new(ActivitySignal::new()));
        (service, transport)
    }

    async fn created_service() -> (WalletService, Arc<MemoryTransport>, String) {
        let store = Arc::new(MemoryStore::new());
        let (service, transport) = build_service(store);
        let phrase = match service
            .handle(WalletCommand::Create {
                password: PASSWORD.into(),
            })
            .await
            .unwrap()
        {
            WalletResponse::Created { recovery_phrase } => recovery_phrase,
            other => panic!("unexpected response: {other:?}"),
        };
        (service, transport, phrase)
    }

    fn draft(service: &str, name: &str, value: &str) -> KeyDraft {
        KeyDraft {
            service: service.into(),
            name: name.into(),
            value: value.into(),
            notes: String::new(),
            expires_at: None,
            favourite: false,
        }
    }

    async fn default_vault_id(service: &WalletService) -> Uuid {
        match service.handle(WalletCommand::ListVaults).await.unwrap() {
            WalletResponse::Vaults { vaults } => vaults[0].id,
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_then_status_reports_unlocked() {
        let (service, _, phrase) = created_service().await;
        assert_eq!(phrase.split_whitespace().count(), 12);

        match service.handle(WalletCommand::GetStatus).await.unwrap() {
            WalletResponse::Status {
                status, unlocked, ..
            } => {
                assert_eq!(status, WalletStatus::Unlocked);
                assert!(unlocked);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn double_create_is_rejected() {
        let (service, _, _) = created_service().await;
        let err = service
            .handle(WalletCommand::Create {
                password: "other".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::WalletExists));
    }

    #[tokio::test]
    async fn locked_wallet_rejects_reads_and_writes() {
        let (service, _, _) = created_service().await;
        service.handle(WalletCommand::Lock).await.unwrap();

        assert!(matches!(
            service.handle(WalletCommand::ListKeys).await,
            Err(VaultError::Locked)
        ));
        let vault_id = Uuid::new_v4();
        assert!(matches!(
            service
                .handle(WalletCommand::AddKey {
                    vault_id,
                    draft: draft("openai", "API_KEY", "sk-test-123"),
                })
                .await,
            Err(VaultError::Locked)
        ));
    }

    #[tokio::test]
    async fn unlock_after_lock_restores_the_wallet() {
        let (service, _, _) = created_service().await;
        let vault_id = default_vault_id(&service).await;
        service
            .handle(WalletCommand::AddKey {
                vault_id,
                draft: draft("openai", "API_KEY", "sk-test-123"),
            })
            .await
            .unwrap();
        service.handle(WalletCommand::Lock).await.unwrap();

        match service
            .handle(WalletCommand::Unlock {
                password: PASSWORD.into(),
            })
            .await
            .unwrap()
        {
            WalletResponse::Unlocked {
                vault_count,
                key_count,
            } => {
                assert_eq!(vault_count, 1);
                assert_eq!(key_count, 1);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reveal_records_an_access_audit() {
        let (service, _, _) = created_service().await;
        let vault_id = default_vault_id(&service).await;
        let key_id = match service
            .handle(WalletCommand::AddKey {
                vault_id,
                draft: draft("openai", "API_KEY", "sk-test-123"),
            })
            .await
            .unwrap()
        {
            WalletResponse::KeyAdded { key_id } => key_id,
            other => panic!("unexpected response: {other:?}"),
        };

        match service
            .handle(WalletCommand::RevealKey { key_id })
            .await
            .unwrap()
        {
            WalletResponse::Revealed { key } => assert_eq!(&*key.value, "sk-test-123"),
            other => panic!("unexpected response: {other:?}"),
        }

        match service
            .handle(WalletCommand::AuditLog {
                key_id: Some(key_id),
            })
            .await
            .unwrap()
        {
            WalletResponse::Audit { entries } => {
                assert_eq!(entries[0].action, AuditAction::Accessed);
                assert!(entries
                    .iter()
                    .any(|entry| entry.action == AuditAction::Created));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_keys_masks_values() {
        let (service, _, _) = created_service().await;
        let vault_id = default_vault_id(&service).await;
        service
            .handle(WalletCommand::AddKey {
                vault_id,
                draft: draft("openai", "API_KEY", "sk-test-123456789"),
            })
            .await
            .unwrap();

        match service.handle(WalletCommand::ListKeys).await.unwrap() {
            WalletResponse::Keys { keys } => {
                assert_eq!(keys.len(), 1);
                assert!(!keys[0].preview.contains("test-123456789"));
                assert!(keys[0].preview.contains("••••"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_writer_is_not_clobbered() {
        let (service, _, _) = created_service().await;
        let vault_id = default_vault_id(&service).await;

        // Another context writes a key directly to the store, bypassing this
        // service instance, exactly like a second process would.
        {
            let state = service.state.lock().await;
            let state = state.as_ref().unwrap();
            let mut other = state.wallet.clone();
            other
                .add_key(vault_id, draft("stripe", "SECRET_KEY", "sk_live_123"))
                .unwrap();
            let (record, _) = codec::save_both(&other, &state.key, &state.salt).unwrap();
            store::save_record(service.store.as_ref(), store::KEY_VAULT, &record)
                .await
                .unwrap();
        }

        service
            .handle(WalletCommand::AddKey {
                vault_id,
                draft: draft("openai", "API_KEY", "sk-test-123"),
            })
            .await
            .unwrap();

        // Both writes must survive the race.
        match service.handle(WalletCommand::ListKeys).await.unwrap() {
            WalletResponse::Keys { keys } => {
                let names: Vec<&str> = keys.iter().map(|key| key.name.as_str()).collect();
                assert!(names.contains(&"SECRET_KEY"));
                assert!(names.contains(&"API_KEY"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn capture_respects_the_config_gate() {
        let (service, _, _) = created_service().await;
        let mut config = store::load_config(service.store.as_ref()).await.unwrap();
        config.key_capture_enabled = false;
        store::save_config(service.store.as_ref(), &config)
            .await
            .unwrap();

        match service
            .handle(WalletCommand::CaptureKey {
                service: String::new(),
                name: String::new(),
                value: "sk-test-123".into(),
            })
            .await
            .unwrap()
        {
            WalletResponse::CaptureSkipped { reason } => assert_eq!(reason, "disabled"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn capture_while_locked_is_skipped_not_fatal() {
        let (service, _, _) = created_service().await;
        service.handle(WalletCommand::Lock).await.unwrap();

        match service
            .handle(WalletCommand::CaptureKey {
                service: String::new(),
                name: String::new(),
                value: "sk-test-123".into(),
            })
            .await
            .unwrap()
        {
            WalletResponse::CaptureSkipped { reason } => assert_eq!(reason, "locked"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn capture_detects_the_provider() {
        let (service, _, _) = created_service().await;
        let key_id = match service
            .handle(WalletCommand::CaptureKey {
                service: String::new(),
                name: String::new(),
                value: "sk-ant-api03-xyz".into(),
            })
            .await
            .unwrap()
        {
            WalletResponse::KeyCaptured { key_id } => key_id,
            other => panic!("unexpected response: {other:?}"),
        };

        let state = service.state.lock().await;
        let key = state.as_ref().unwrap().wallet.key(key_id).unwrap().clone();
        assert_eq!(key.service, "anthropic");
        assert_eq!(key.notes, CAPTURE_NOTES);
    }

    #[tokio::test]
    async fn recovery_session_reveals_but_never_writes() {
        let (service, _, phrase) = created_service().await;
        let vault_id = default_vault_id(&service).await;
        let key_id = match service
            .handle(WalletCommand::AddKey {
                vault_id,
                draft: draft("openai", "API_KEY", "sk-test-123"),
            })
            .await
            .unwrap()
        {
            WalletResponse::KeyAdded { key_id } => key_id,
            other => panic!("unexpected response: {other:?}"),
        };
        service.handle(WalletCommand::Lock).await.unwrap();

        service
            .handle(WalletCommand::UnlockWithPhrase { phrase })
            .await
            .unwrap();

        match service
            .handle(WalletCommand::RevealKey { key_id })
            .await
            .unwrap()
        {
            WalletResponse::Revealed { key } => assert_eq!(&*key.value, "sk-test-123"),
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(matches!(
            service
                .handle(WalletCommand::AddKey {
                    vault_id,
                    draft: draft("stripe", "SECRET_KEY", "sk_live_1"),
                })
                .await,
            Err(VaultError::PasswordResetRequired)
        ));
    }

    #[tokio::test]
    async fn password_reset_from_recovery_reopens_with_the_new_password() {
        let (service, _, phrase) = created_service().await;
        service.handle(WalletCommand::Lock).await.unwrap();
        service
            .handle(WalletCommand::UnlockWithPhrase { phrase })
            .await
            .unwrap();

        service
            .handle(WalletCommand::ChangePassword {
                current: String::new(),
                new: "a new passphrase".into(),
            })
            .await
            .unwrap();

        // Writes work again, and the new password opens the wallet.
        let vault_id = default_vault_id(&service).await;
        service
            .handle(WalletCommand::AddKey {
                vault_id,
                draft: draft("openai", "API_KEY", "sk-test-123"),
            })
            .await
            .unwrap();
        service.handle(WalletCommand::Lock).await.unwrap();
        assert!(matches!(
            service
                .handle(WalletCommand::Unlock {
                    password: PASSWORD.into()
                })
                .await,
            Err(VaultError::InvalidCredential)
        ));
        service
            .handle(WalletCommand::Unlock {
                password: "a new passphrase".into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn import_env_detects_services() {
        let (service, _, _) = created_service().await;
        let vault_id = default_vault_id(&service).await;

        match service
            .handle(WalletCommand::ImportEnv {
                vault_id,
                env: "OPENAI_API_KEY=sk-test-123\nSTRIPE_KEY=sk_live_42\n# comment\n".into(),
            })
            .await
            .unwrap()
        {
            WalletResponse::EnvImported { imported } => assert_eq!(imported, 2),
            other => panic!("unexpected response: {other:?}"),
        }

        match service.handle(WalletCommand::ListKeys).await.unwrap() {
            WalletResponse::Keys { keys } => {
                let services: Vec<&str> = keys.iter().map(|key| key.service.as_str()).collect();
                assert!(services.contains(&"openai"));
                assert!(services.contains(&"stripe"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_wallet_resets_remote_and_clears_storage() {
        let (service, transport, _) = created_service().await;
        service.handle(WalletCommand::DeleteWallet).await.unwrap();

        assert_eq!(transport.reset_count(), 1);
        assert!(store::load_record(service.store.as_ref(), store::KEY_VAULT)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store::load_status(service.store.as_ref()).await.unwrap(),
            WalletStatus::Uninitialized
        );
        assert!(matches!(
            service.handle(WalletCommand::ListKeys).await,
            Err(VaultError::NoVaultFound)
        ));
    }

    #[test]
    fn errors_fold_into_the_response_union() {
        match WalletResponse::from_error(&VaultError::Locked) {
            WalletResponse::Error { code, message } => {
                assert_eq!(code, "locked");
                assert_eq!(message, "wallet is locked");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn commands_round_trip_as_tagged_json() {
        let command = WalletCommand::AddKey {
            vault_id: Uuid::nil(),
            draft: draft("openai", "API_KEY", "sk-test-123"),
        };
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["command"], "AddKey");
        assert!(json["data"]["draft"].get("service").is_some());

        let back: WalletCommand = serde_json::from_value(json).unwrap();
        assert!(matches!(back, WalletCommand::AddKey { .. }));

        let response = WalletResponse::KeyAdded { key_id: Uuid::nil() };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["response"], "KeyAdded");
    }
}
