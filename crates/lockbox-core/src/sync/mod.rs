//! Push/pull synchronisation with the dashboard.
//!
//! Sync never sits on the critical path. A push runs after a mutation has
//! already been persisted locally, and any failure is parked in the
//! observable [`SyncStatusCell`] instead of propagating to the caller. The
//! retry mechanism is simply the next trigger: another mutation, an unlock,
//! or an explicit pull.

mod client;
mod merge;
mod metadata;

pub use client::{
    HttpSyncClient, MemoryTransport, PlanTier, PullResponse, PushAck, RemoteStatus,
    SyncPushPayload, SyncTransport,
};
pub use merge::merge_wallets;
pub use metadata::{extract_metadata, record_checksum, ServiceSummary, SyncMetadata, VaultSummary};

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Result, VaultError};
use crate::record::EncryptedRecord;
use crate::store::{self, DurableStore};
use crate::wallet::Wallet;

// ── Observable status ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Synced,
    Syncing,
    Offline,
    Error,
}

/// Current sync state plus subscriptions, owned by the engine. Subscribers
/// hold a [`watch::Receiver`] and drop it to unsubscribe.
#[derive(Debug)]
pub struct SyncStatusCell {
    tx: watch::Sender<SyncState>,
}

impl SyncStatusCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncState::Offline);
        Self { tx }
    }

    pub fn get(&self) -> SyncState {
        *self.tx.borrow()
    }

    pub fn set(&self, state: SyncState) {
        self.tx.send_replace(state);
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.tx.subscribe()
    }
}

impl Default for SyncStatusCell {
    fn default() -> Self {
        Self::new()
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct SyncEngine {
    store: Arc<dyn DurableStore>,
    transport: RwLock<Option<Arc<dyn SyncTransport>>>,
    status: SyncStatusCell,
}

impl SyncEngine {
    /// An engine with no transport reports `offline` and skips every push.
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            transport: RwLock::new(None),
            status: SyncStatusCell::new(),
        }
    }

    pub fn with_transport(store: Arc<dyn DurableStore>, transport: Arc<dyn SyncTransport>) -> Self {
        let engine = Self::new(store);
        engine.set_transport(Some(transport));
        engine
    }

    /// Installs or removes the transport, e.g. when a dashboard account is
    /// linked or the wallet is deleted.
    pub fn set_transport(&self, transport: Option<Arc<dyn SyncTransport>>) {
        let offline = transport.is_none();
        *self.transport.write() = transport;
        if offline {
            self.status.set(SyncState::Offline);
        }
    }

    pub fn status(&self) -> &SyncStatusCell {
        &self.status
    }

    pub fn state(&self) -> SyncState {
        self.status.get()
    }

    fn transport(&self) -> Option<Arc<dyn SyncTransport>> {
        self.transport.read().clone()
    }

    /// Push the persisted primary record plus metadata extracted from
    /// `wallet` (when unlocked). Fire-and-forget: failures are logged and
    /// reflected in the status cell, never returned.
    pub async fn push_current(&self, wallet: Option<&Wallet>) {
        let Some(transport) = self.transport() else {
            self.status.set(SyncState::Offline);
            return;
        };
        self.status.set(SyncState::Syncing);
        match self.try_push(transport.as_ref(), wallet).await {
            Ok(()) => self.status.set(SyncState::Synced),
            Err(err) => {
                warn!(error = %err, "sync push failed");
                self.status.set(SyncState::Error);
            }
        }
    }

    async fn try_push(&self, transport: &dyn SyncTransport, wallet: Option<&Wallet>) -> Result<()> {
        let Some(record) = store::load_record(self.store.as_ref(), store::KEY_VAULT).await? else {
            // Nothing persisted yet, so there is nothing to protect remotely.
            return Ok(());
        };
        let payload = SyncPushPayload {
            encrypted_vault: record.canonical_json()?,
            checksum: record_checksum(&record)?,
            metadata: wallet.map(extract_metadata).unwrap_or_else(SyncMetadata::empty),
        };
        let ack = transport.push(&payload).await?;
        debug!(version = ack.version, "accepted by dashboard");

        let mut config = store::load_config(self.store.as_ref()).await?;
        config.last_synced = Some(ack.synced_at);
        store::save_config(self.store.as_ref(), &config).await
    }

    /// Fetch the remote encrypted record, if the account has one. Unlike
    /// push, a user asked for this directly, so failures propagate.
    pub async fn pull_remote(&self) -> Result<Option<EncryptedRecord>> {
        let Some(transport) = self.transport() else {
            self.status.set(SyncState::Offline);
            return Ok(None);
        };
        self.status.set(SyncState::Syncing);
        match self.try_pull(transport.as_ref()).await {
            Ok(record) => {
                self.status.set(SyncState::Synced);
                Ok(record)
            }
            Err(err) => {
                warn!(error = %err, "sync pull failed");
                self.status.set(SyncState::Error);
                Err(err)
            }
        }
    }

    async fn try_pull(&self, transport: &dyn SyncTransport) -> Result<Option<EncryptedRecord>> {
        let Some(response) = transport.pull().await? else {
            return Ok(None);
        };
        let record: EncryptedRecord = serde_json::from_str(&response.encrypted_vault)
            .map_err(|err| VaultError::CorruptRecord(format!("remote vault: {err}")))?;

        let mut config = store::load_config(self.store.as_ref()).await?;
        config.last_synced = Some(Utc::now());
        store::save_config(self.store.as_ref(), &config).await?;
        Ok(Some(record))
    }

    /// Whether the remote copy changed since our last push. Errors read as
    /// "no changes" so a flaky connection cannot spam the caller.
    pub async fn check_remote(&self) -> bool {
        let Some(transport) = self.transport() else {
            return false;
        };
        match transport.status().await {
            Ok(status) => status.has_changes,
            Err(err) => {
                debug!(error = %err, "sync status check failed");
                false
            }
        }
    }

    /// Ask the dashboard to drop its copy. Called before local wallet
    /// deletion; the caller decides whether failure blocks anything.
    pub async fn reset_remote(&self) -> Result<()> {
        let Some(transport) = self.transport() else {
            return Ok(());
        };
        transport.reset().await
    }
}
