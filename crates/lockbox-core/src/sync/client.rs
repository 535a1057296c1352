//! Dashboard API transport.
//!
//! [`SyncTransport`] is the seam between the engine and the wire so tests can
//! run against [`MemoryTransport`] instead of a live dashboard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, VaultError};
use crate::sync::metadata::SyncMetadata;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPushPayload {
    /// The serialised [`EncryptedRecord`](crate::record::EncryptedRecord),
    /// opaque to the server.
    pub encrypted_vault: String,
    pub metadata: SyncMetadata,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Pro,
    Team,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAck {
    pub success: bool,
    pub synced_at: DateTime<Utc>,
    pub version: u64,
    pub tier: PlanTier,
    #[serde(default)]
    pub licence_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    #[serde(default)]
    pub encrypted_vault: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    pub last_modified: DateTime<Utc>,
    pub has_changes: bool,
}

// ── Transport trait ──────────────────────────────────────────────────────────

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, payload: &SyncPushPayload) -> Result<PushAck>;
    /// `None` means the server holds no vault for this account yet.
    async fn pull(&self) -> Result<Option<PullResponse>>;
    async fn status(&self) -> Result<RemoteStatus>;
    /// Clears the remote copy (vault, metadata, audit trail).
    async fn reset(&self) -> Result<()>;
}

// ── HTTP client ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HttpSyncClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpSyncClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("lockbox-sync/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn status_error(status: StatusCode) -> VaultError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        VaultError::Unauthenticated
    } else {
        VaultError::Network(format!("server returned {status}"))
    }
}

fn request_error(err: reqwest::Error) -> VaultError {
    VaultError::Network(err.to_string())
}

#[async_trait]
impl SyncTransport for HttpSyncClient {
    async fn push(&self, payload: &SyncPushPayload) -> Result<PushAck> {
        let res = self
            .client
            .post(self.url("/sync/push"))
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await
            .map_err(request_error)?;
        if !res.status().is_success() {
            return Err(status_error(res.status()));
        }
        res.json().await.map_err(request_error)
    }

    async fn pull(&self) -> Result<Option<PullResponse>> {
        let res = self
            .client
            .get(self.url("/sync/pull"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(request_error)?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(status_error(res.status()));
        }
        let body: PullResponse = res.json().await.map_err(request_error)?;
        if body.encrypted_vault.is_empty() {
            return Ok(None);
        }
        Ok(Some(body))
    }

    async fn status(&self) -> Result<RemoteStatus> {
        let res = self
            .client
            .get(self.url("/sync/status"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(request_error)?;
        if !res.status().is_success() {
            return Err(status_error(res.status()));
        }
        res.json().await.map_err(request_error)
    }

    async fn reset(&self) -> Result<()> {
        let res = self
            .client
            .post(self.url("/sync/reset"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(request_error)?;
        if !res.status().is_success() {
            return Err(status_error(res.status()));
        }
        Ok(())
    }
}

// ── In-memory transport ──────────────────────────────────────────────────────

/// In-memory transport that records pushed payloads and replays a staged
/// remote vault. Also usable as a local-only backend.
#[derive(Default)]
pub struct MemoryTransport {
    pushed: Mutex<Vec<SyncPushPayload>>,
    remote: Mutex<Option<PullResponse>>,
    has_changes: Mutex<bool>,
    fail_with: Mutex<Option<String>>,
    reject_auth: Mutex<bool>,
    resets: Mutex<usize>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a remote vault that the next `pull` will return.
    pub fn set_remote(&self, encrypted_vault: String, last_modified: DateTime<Utc>) {
        *self.remote.lock() = Some(PullResponse {
            encrypted_vault,
            last_modified,
        });
        *self.has_changes.lock() = true;
    }

    /// Every subsequent call fails with a network error until cleared.
    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock() = Some(message.to_string());
    }

    pub fn clear_failure(&self) {
        *self.fail_with.lock() = None;
    }

    /// Every subsequent call fails as if the bearer token were rejected.
    pub fn reject_auth(&self) {
        *self.reject_auth.lock() = true;
    }

    pub fn pushed(&self) -> Vec<SyncPushPayload> {
        self.pushed.lock().clone()
    }

    pub fn push_count(&self) -> usize {
        self.pushed.lock().len()
    }

    pub fn reset_count(&self) -> usize {
        *self.resets.lock()
    }

    fn gate(&self) -> Result<()> {
        if *self.reject_auth.lock() {
            return Err(VaultError::Unauthenticated);
        }
        if let Some(message) = self.fail_with.lock().as_ref() {
            return Err(VaultError::Network(message.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncTransport for MemoryTransport {
    async fn push(&self, payload: &SyncPushPayload) -> Result<PushAck> {
        self.gate()?;
        let mut pushed = self.pushed.lock();
        pushed.push(payload.clone());
        Ok(PushAck {
            success: true,
            synced_at: Utc::now(),
            version: pushed.len() as u64,
            tier: PlanTier::Free,
            licence_key: None,
        })
    }

    async fn pull(&self) -> Result<Option<PullResponse>> {
        self.gate()?;
        Ok(self.remote.lock().clone())
    }

    async fn status(&self) -> Result<RemoteStatus> {
        self.gate()?;
        let last_modified = self
            .remote
            .lock()
            .as_ref()
            .map(|r| r.last_modified)
            .unwrap_or_else(Utc::now);
        Ok(RemoteStatus {
            last_modified,
            has_changes: *self.has_changes.lock(),
        })
    }

    async fn reset(&self) -> Result<()> {
        self.gate()?;
        *self.remote.lock() = None;
        *self.has_changes.lock() = false;
        *self.resets.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> SyncPushPayload {
        SyncPushPayload {
            encrypted_vault: "{\"version\":1}".into(),
            metadata: SyncMetadata::empty(),
            checksum: "ab".repeat(32),
        }
    }

    #[tokio::test]
    async fn records_pushes_and_bumps_version() {
        let transport = MemoryTransport::new();
        let first = transport.push(&payload()).await.unwrap();
        let second = transport.push(&payload()).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(transport.push_count(), 2);
        assert_eq!(transport.pushed()[0].checksum, "ab".repeat(32));
    }

    #[tokio::test]
    async fn replays_staged_remote() {
        let transport = MemoryTransport::new();
        assert!(transport.pull().await.unwrap().is_none());

        transport.set_remote("{\"version\":1}".into(), Utc::now());
        let pulled = transport.pull().await.unwrap().unwrap();
        assert_eq!(pulled.encrypted_vault, "{\"version\":1}");
        assert!(transport.status().await.unwrap().has_changes);

        transport.reset().await.unwrap();
        assert!(transport.pull().await.unwrap().is_none());
        assert_eq!(transport.reset_count(), 1);
    }

    #[tokio::test]
    async fn staged_failures_surface_as_errors() {
        let transport = MemoryTransport::new();
        transport.fail_with("connection refused");
        assert!(matches!(
            transport.push(&payload()).await,
            Err(VaultError::Network(_))
        ));

        transport.clear_failure();
        transport.reject_auth();
        assert!(matches!(
            transport.pull().await,
            Err(VaultError::Unauthenticated)
        ));
    }

    #[test]
    fn push_ack_parses_dashboard_response() {
        let ack: PushAck = serde_json::from_str(
            r#"{"success":true,"syncedAt":"2024-05-04T12:00:00Z","version":7,"tier":"pro","licenceKey":null}"#,
        )
        .unwrap();
        assert!(ack.success);
        assert_eq!(ack.version, 7);
        assert_eq!(ack.tier, PlanTier::Pro);
        assert!(ack.licence_key.is_none());
    }

    #[test]
    fn http_status_mapping_distinguishes_auth_failures() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED),
            VaultError::Unauthenticated
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN),
            VaultError::Unauthenticated
        ));
        assert!(matches!(
            status_error(StatusCode::INTERNAL_SERVER_ERROR),
            VaultError::Network(_)
        ));
    }
}
