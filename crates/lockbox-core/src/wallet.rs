//! Decrypted wallet model: vaults of API keys plus the audit trail.
//!
//! Every mutation stamps `updated_at` on the touched vault and key and
//! appends a capped audit entry, so the sync layer can order whole-wallet
//! snapshots by their newest timestamp.

use std::fmt;
use std::ops::Deref;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

pub const AUDIT_LOG_CAP: usize = 500;

pub const DEFAULT_VAULT_NAME: &str = "Default Vault";
pub const DEFAULT_VAULT_ICON: &str = "lock";

// ── Secret values ────────────────────────────────────────────────────────────

/// Sensitive string that zeroizes its memory on drop and masks itself in
/// debug output. Serializes as a plain string so it survives the encrypted
/// payload round-trip.
#[derive(Clone)]
pub struct SecretString(Zeroizing<String>);

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl Eq for SecretString {}

impl SecretString {
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }

    /// Display-safe preview: first and last four characters of long values,
    /// full bullets otherwise.
    pub fn preview(&self) -> String {
        let value: &str = &self.0;
        if value.chars().count() <= 8 {
            "••••••••".to_string()
        } else {
            let head: String = value.chars().take(4).collect();
            let tail: String = value.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
            format!("{head}••••{tail}")
        }
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value.to_owned())
    }
}

impl Deref for SecretString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(••••)")
    }
}

impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

// ── Model ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Created,
    Accessed,
    Updated,
    Deleted,
    Copied,
    Autofilled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: AuditAction,
    pub key_id: Uuid,
    pub key_name: String,
    pub service: String,
    pub vault_id: Uuid,
    pub vault_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: Uuid,
    pub vault_id: Uuid,
    pub service: String,
    pub name: String,
    pub value: SecretString,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub favourite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    pub fn expires_soon(&self, now: DateTime<Utc>, days: i64) -> bool {
        matches!(self.expires_at, Some(at) if at > now && at <= now + Duration::days(days))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vault {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub keys: Vec<ApiKey>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Vault {
    pub fn new(name: &str, description: &str, icon: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            icon: icon.to_string(),
            keys: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// The full decrypted payload. `recovery_key` holds the phrase-derived key
/// (base64) so every save can regenerate the recovery record without the
/// phrase being present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub vaults: Vec<Vault>,
    #[serde(default)]
    pub audit_log: Vec<AuditEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_key: Option<String>,
}

// ── Drafts and patches ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDraft {
    pub service: String,
    pub name: String,
    pub value: SecretString,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub favourite: bool,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<SecretString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favourite: Option<bool>,
}

// ── Wallet operations ────────────────────────────────────────────────────────

impl Wallet {
    /// A fresh wallet always starts with one vault; the model never holds
    /// zero vaults.
    pub fn with_default_vault() -> Self {
        Self {
            vaults: vec![Vault::new(DEFAULT_VAULT_NAME, "", DEFAULT_VAULT_ICON)],
            audit_log: Vec::new(),
            recovery_key: None,
        }
    }

    pub fn vault(&self, vault_id: Uuid) -> Option<&Vault> {
        self.vaults.iter().find(|v| v.id == vault_id)
    }

    fn vault_mut(&mut self, vault_id: Uuid) -> Result<&mut Vault> {
        self.vaults
            .iter_mut()
            .find(|v| v.id == vault_id)
            .ok_or(VaultError::VaultNotFound(vault_id))
    }

    pub fn key(&self, key_id: Uuid) -> Option<&ApiKey> {
        self.vaults
            .iter()
            .flat_map(|v| v.keys.iter())
            .find(|k| k.id == key_id)
    }

    pub fn total_keys(&self) -> usize {
        self.vaults.iter().map(|v| v.keys.len()).sum()
    }

    pub fn add_key(&mut self, vault_id: Uuid, draft: KeyDraft) -> Result<Uuid> {
        let now = Utc::now();
        let key = ApiKey {
            id: Uuid::new_v4(),
            vault_id,
            service: draft.service,
            name: draft.name,
            value: draft.value,
            notes: draft.notes,
            expires_at: draft.expires_at,
            favourite: draft.favourite,
            last_accessed_at: None,
            created_at: now,
            updated_at: now,
        };
        let audit = self.audit_for(&key, AuditAction::Created, None)?;
        let vault = self.vault_mut(vault_id)?;
        vault.keys.push(key.clone());
        vault.updated_at = now;
        self.push_audit(audit);
        Ok(key.id)
    }

    pub fn update_key(&mut self, key_id: Uuid, patch: KeyPatch) -> Result<()> {
        let now = Utc::now();
        let vault_id = self.vault_id_of(key_id)?;
        let vault = self.vault_mut(vault_id)?;
        let key = vault
            .keys
            .iter_mut()
            .find(|k| k.id == key_id)
            .ok_or(VaultError::KeyNotFound(key_id))?;
        if let Some(service) = patch.service {
            key.service = service;
        }
        if let Some(name) = patch.name {
            key.name = name;
        }
        if let Some(value) = patch.value {
            key.value = value;
        }
        if let Some(notes) = patch.notes {
            key.notes = notes;
        }
        if let Some(expires_at) = patch.expires_at {
            key.expires_at = Some(expires_at);
        }
        if let Some(favourite) = patch.favourite {
            key.favourite = favourite;
        }
        key.updated_at = now;
        let key = key.clone();
        vault.updated_at = now;
        let audit = self.audit_for(&key, AuditAction::Updated, None)?;
        self.push_audit(audit);
        Ok(())
    }

    pub fn delete_key(&mut self, key_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let vault_id = self.vault_id_of(key_id)?;
        let removed = {
            let vault = self.vault_mut(vault_id)?;
            let position = vault
                .keys
                .iter()
                .position(|k| k.id == key_id)
                .ok_or(VaultError::KeyNotFound(key_id))?;
            let removed = vault.keys.remove(position);
            vault.updated_at = now;
            removed
        };
        let audit = self.audit_for(&removed, AuditAction::Deleted, None)?;
        self.push_audit(audit);
        Ok(())
    }

    /// Marks a key as touched (revealed, copied, autofilled) without
    /// changing its content.
    pub fn record_access(
        &mut self,
        key_id: Uuid,
        action: AuditAction,
        site: Option<String>,
    ) -> Result<()> {
        let now = Utc::now();
        let vault_id = self.vault_id_of(key_id)?;
        let snapshot = {
            let vault = self.vault_mut(vault_id)?;
            let key = vault
                .keys
                .iter_mut()
                .find(|k| k.id == key_id)
                .ok_or(VaultError::KeyNotFound(key_id))?;
            key.last_accessed_at = Some(now);
            key.clone()
        };
        let audit = self.audit_for(&snapshot, action, site)?;
        self.push_audit(audit);
        Ok(())
    }

    pub fn add_vault(&mut self, name: &str, description: &str, icon: &str) -> Uuid {
        let vault = Vault::new(name, description, icon);
        let id = vault.id;
        self.vaults.push(vault);
        id
    }

    pub fn rename_vault(
        &mut self,
        vault_id: Uuid,
        name: Option<String>,
        description: Option<String>,
        icon: Option<String>,
    ) -> Result<()> {
        let vault = self.vault_mut(vault_id)?;
        if let Some(name) = name {
            vault.name = name;
        }
        if let Some(description) = description {
            vault.description = description;
        }
        if let Some(icon) = icon {
            vault.icon = icon;
        }
        vault.updated_at = Utc::now();
        Ok(())
    }

    /// Rejected outright when it would leave the wallet empty; the wallet is
    /// untouched on any error.
    pub fn delete_vault(&mut self, vault_id: Uuid) -> Result<()> {
        let position = self
            .vaults
            .iter()
            .position(|v| v.id == vault_id)
            .ok_or(VaultError::VaultNotFound(vault_id))?;
        if self.vaults.len() == 1 {
            return Err(VaultError::LastVaultViolation);
        }
        self.vaults.remove(position);
        Ok(())
    }

    /// Newest `updated_at` across all vaults and keys; the ordering basis
    /// for whole-wallet merges.
    pub fn latest_timestamp(&self) -> DateTime<Utc> {
        let mut latest = DateTime::<Utc>::MIN_UTC;
        for vault in &self.vaults {
            latest = latest.max(vault.updated_at);
            for key in &vault.keys {
                latest = latest.max(key.updated_at);
            }
        }
        latest
    }

    fn vault_id_of(&self, key_id: Uuid) -> Result<Uuid> {
        self.key(key_id)
            .map(|k| k.vault_id)
            .ok_or(VaultError::KeyNotFound(key_id))
    }

    fn audit_for(&self, key: &ApiKey, action: AuditAction, site: Option<String>) -> Result<AuditEntry> {
        let vault = self
            .vault(key.vault_id)
            .ok_or(VaultError::VaultNotFound(key.vault_id))?;
        Ok(AuditEntry {
            id: Uuid::new_v4(),
            action,
            key_id: key.id,
            key_name: key.name.clone(),
            service: key.service.clone(),
            vault_id: vault.id,
            vault_name: vault.name.clone(),
            site,
            timestamp: Utc::now(),
        })
    }

    fn push_audit(&mut self, entry: AuditEntry) {
        self.audit_log.insert(0, entry);
        self.audit_log.truncate(AUDIT_LOG_CAP);
    }
}
