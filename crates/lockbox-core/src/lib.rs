//! lockbox-core — encrypted vault engine for Lockbox
//!
//! # Design principles
//! - No custom crypto; all primitives come from the RustCrypto crates.
//! - Key material lives in zeroizing wrappers or the session tier of the
//!   store; it never touches the durable tier.
//! - Decryption never runs before the record's integrity seal verifies.
//! - The wallet is persisted as two records sealed under different keys
//!   (password and recovery phrase) that always carry the same payload.
//!
//! # Module layout
//! - `crypto`   — PBKDF2 derivation, AES-GCM sealing, HMAC record seals
//! - `record`   — versioned encrypted record format and canonical JSON
//! - `recovery` — 12-word recovery phrases
//! - `codec`    — wallet to record pipeline: create, unlock, save, reseal
//! - `wallet`   — decrypted model: vaults, API keys, audit trail
//! - `store`    — durable/session key-value tiers, in memory or on disk
//! - `session`  — cached derived key in the session tier
//! - `autolock` — idle controller that clears the cached key
//! - `detect`   — API-key shape detection for capture and import
//! - `sync`     — dashboard push/pull, metadata, whole-wallet merge
//! - `config`   — persisted settings, wallet status, account linkage
//! - `service`  — command surface tying the layers together
//! - `error`    — unified error type

pub mod autolock;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod detect;
pub mod error;
pub mod record;
pub mod recovery;
pub mod service;
pub mod session;
pub mod store;
pub mod sync;
pub mod wallet;

pub use error::{Result, VaultError};
pub use service::{WalletCommand, WalletResponse, WalletService};
pub use wallet::Wallet;
