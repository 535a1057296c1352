//! Storage seam. The engine only ever speaks `DurableStore`; embedders pick
//! the backing. Two tiers: `Durable` survives restarts, `Session` is
//! guaranteed gone when the hosting session ends.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::config::{AccountInfo, WalletConfig, WalletStatus};
use crate::error::{Result, VaultError};
use crate::record::EncryptedRecord;

pub const KEY_VAULT: &str = "lockbox_vault";
pub const KEY_RECOVERY_VAULT: &str = "lockbox_recovery_vault";
pub const KEY_CONFIG: &str = "lockbox_config";
pub const KEY_STATUS: &str = "lockbox_status";
pub const KEY_ACCOUNT: &str = "lockbox_account";
pub const KEY_SESSION_KEY: &str = "lockbox_derived_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Durable,
    Session,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, tier: Tier, key: &str) -> Result<Option<String>>;
    async fn set(&self, tier: Tier, key: &str, value: String) -> Result<()>;
    async fn remove(&self, tier: Tier, key: &str) -> Result<()>;
}

// ── In-memory store ──────────────────────────────────────────────────────────

/// Both tiers in memory. Used by tests and by embedders that bring their
/// own persistence.
#[derive(Default)]
pub struct MemoryStore {
    durable: RwLock<HashMap<String, String>>,
    session: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, tier: Tier) -> &RwLock<HashMap<String, String>> {
        match tier {
            Tier::Durable => &self.durable,
            Tier::Session => &self.session,
        }
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, tier: Tier, key: &str) -> Result<Option<String>> {
        Ok(self.map(tier).read().get(key).cloned())
    }

    async fn set(&self, tier: Tier, key: &str, value: String) -> Result<()> {
        self.map(tier).write().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, tier: Tier, key: &str) -> Result<()> {
        self.map(tier).write().remove(key);
        Ok(())
    }
}

// ── File-backed store ────────────────────────────────────────────────────────

/// Durable tier as one JSON file per key under a 0700 directory; writes go
/// through a staging file and rename. The session tier stays in process
/// memory, so it dies with the process.
pub struct FileStore {
    root: PathBuf,
    session: RwLock<HashMap<String, String>>,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        restrict_dir_permissions(&root);
        cleanup_staging(&root);
        Ok(Self {
            root,
            session: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<()> {
        let staging = self.root.join(format!("{}.staging", Uuid::new_v4()));
        {
            let mut file = File::create(&staging)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&staging, dest)?;
        fsync_dir(&self.root)?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, tier: Tier, key: &str) -> Result<Option<String>> {
        match tier {
            Tier::Session => Ok(self.session.read().get(key).cloned()),
            Tier::Durable => {
                let path = self.value_path(key);
                if !path.exists() {
                    return Ok(None);
                }
                Ok(Some(fs::read_to_string(path)?))
            }
        }
    }

    async fn set(&self, tier: Tier, key: &str, value: String) -> Result<()> {
        match tier {
            Tier::Session => {
                self.session.write().insert(key.to_string(), value);
                Ok(())
            }
            Tier::Durable => self.write_atomic(&self.value_path(key), value.as_bytes()),
        }
    }

    async fn remove(&self, tier: Tier, key: &str) -> Result<()> {
        match tier {
            Tier::Session => {
                self.session.write().remove(key);
                Ok(())
            }
            Tier::Durable => match fs::remove_file(self.value_path(key)) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
}

/// Remove leftover staging files from a previous crash.
fn cleanup_staging(root: &Path) {
    if let Ok(entries) = fs::read_dir(root) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().ends_with(".staging") {
                warn!(path = %entry.path().display(), "removing orphaned staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

fn fsync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

// ── Typed accessors ──────────────────────────────────────────────────────────

pub async fn load_json<T: DeserializeOwned>(
    store: &dyn DurableStore,
    tier: Tier,
    key: &str,
) -> Result<Option<T>> {
    match store.get(tier, key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn save_json<T: Serialize>(
    store: &dyn DurableStore,
    tier: Tier,
    key: &str,
    value: &T,
) -> Result<()> {
    store.set(tier, key, serde_json::to_string(value)?).await
}

/// Records get their own loader so a half-written or hand-edited blob reads
/// as `CorruptRecord` rather than a generic parse error.
pub async fn load_record(store: &dyn DurableStore, key: &str) -> Result<Option<EncryptedRecord>> {
    match store.get(Tier::Durable, key).await? {
        Some(raw) => {
            let record: EncryptedRecord = serde_json::from_str(&raw)
                .map_err(|e| VaultError::CorruptRecord(format!("{key}: {e}")))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

pub async fn save_record(
    store: &dyn DurableStore,
    key: &str,
    record: &EncryptedRecord,
) -> Result<()> {
    save_json(store, Tier::Durable, key, record).await
}

pub async fn load_status(store: &dyn DurableStore) -> Result<WalletStatus> {
    Ok(load_json(store, Tier::Durable, KEY_STATUS)
        .await?
        .unwrap_or(WalletStatus::Uninitialized))
}

pub async fn save_status(store: &dyn DurableStore, status: WalletStatus) -> Result<()> {
    save_json(store, Tier::Durable, KEY_STATUS, &status).await
}

pub async fn load_config(store: &dyn DurableStore) -> Result<WalletConfig> {
    Ok(load_json(store, Tier::Durable, KEY_CONFIG)
        .await?
        .unwrap_or_default())
}

pub async fn save_config(store: &dyn DurableStore, config: &WalletConfig) -> Result<()> {
    save_json(store, Tier::Durable, KEY_CONFIG, config).await
}

pub async fn load_account(store: &dyn DurableStore) -> Result<Option<AccountInfo>> {
    load_json(store, Tier::Durable, KEY_ACCOUNT).await
}

pub async fn save_account(store: &dyn DurableStore, account: &AccountInfo) -> Result<()> {
    save_json(store, Tier::Durable, KEY_ACCOUNT, account).await
}
