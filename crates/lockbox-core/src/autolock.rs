//! Idle auto-lock.
//!
//! A background task wakes on a fixed period, compares the configured idle
//! timeout against the last activity signal, and clears the session key once
//! the wallet has sat untouched for long enough. This is the only caller
//! allowed to clear the cache without an explicit lock request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::WalletStatus;
use crate::error::Result;
use crate::session::SessionKeyCache;
use crate::store::{self, DurableStore};

pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

/// Last-activity timestamp, bumped by callers on every wallet interaction.
#[derive(Debug)]
pub struct ActivitySignal {
    last: Mutex<Instant>,
}

impl ActivitySignal {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

impl Default for ActivitySignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned to the caller so it can shut the loop down.
pub struct AutoLockHandle {
    /// Send `true` to shut down.
    pub shutdown_tx: watch::Sender<bool>,
}

/// Spawn the auto-lock loop as a tokio task.
///
/// The idle timeout is read from config on every tick, so settings changes
/// take effect without restarting the loop.
pub fn spawn_auto_lock(
    store: Arc<dyn DurableStore>,
    cache: SessionKeyCache,
    signal: Arc<ActivitySignal>,
    tick: Duration,
) -> (tokio::task::JoinHandle<()>, AutoLockHandle) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        info!(tick_secs = tick.as_secs(), "auto-lock loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("auto-lock loop shutting down");
                        return;
                    }
                }
            }

            // Check shutdown again after wakeup.
            if *shutdown_rx.borrow() {
                return;
            }

            match check_idle(store.as_ref(), &cache, &signal).await {
                Ok(true) => info!("wallet locked after idle timeout"),
                Ok(false) => {}
                Err(err) => warn!(error = %err, "auto-lock check failed"),
            }
        }
    });

    (handle, AutoLockHandle { shutdown_tx })
}

/// One auto-lock evaluation. Returns whether the wallet was locked.
pub async fn check_idle(
    store: &dyn DurableStore,
    cache: &SessionKeyCache,
    signal: &ActivitySignal,
) -> Result<bool> {
    let config = store::load_config(store).await?;
    if config.auto_lock_minutes == 0 {
        return Ok(false);
    }
    let timeout = Duration::from_secs(u64::from(config.auto_lock_minutes) * 60);
    if signal.idle() < timeout {
        return Ok(false);
    }
    if !cache.is_cached().await? {
        return Ok(false);
    }
    cache.clear().await?;
    store::save_status(store, WalletStatus::Locked).await?;
    Ok(true)
}
