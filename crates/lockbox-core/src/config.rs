use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_ENDPOINT: &str = "https://dashboard.yourlockbox.dev/api";

/// Coarse wallet lifecycle, persisted in the durable tier so any context
/// can show the right surface without holding key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletStatus {
    Uninitialized,
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletConfig {
    /// Idle minutes before the auto-lock controller clears the session key.
    /// Zero disables auto-lock entirely.
    pub auto_lock_minutes: u32,
    pub clipboard_clear_seconds: u32,
    pub auto_sync_enabled: bool,
    pub key_capture_enabled: bool,
    pub endpoint_base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<DateTime<Utc>>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            auto_lock_minutes: 15,
            clipboard_clear_seconds: 30,
            auto_sync_enabled: true,
            key_capture_enabled: true,
            endpoint_base_url: DEFAULT_ENDPOINT.to_string(),
            last_synced: None,
        }
    }
}

/// Dashboard linkage. `token` is the bearer credential for the sync API;
/// without it the engine stays offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub name: String,
    pub wallet_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl AccountInfo {
    /// A wallet that has never been linked to the dashboard.
    pub fn local(name: &str) -> Self {
        Self {
            email: None,
            name: name.to_string(),
            wallet_id: Uuid::new_v4(),
            created_at: Utc::now(),
            token: None,
        }
    }
}
