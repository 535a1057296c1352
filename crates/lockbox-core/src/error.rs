use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    /// Wrong password, wrong recovery phrase, or a record whose integrity
    /// check failed. Deliberately carries no detail about which layer
    /// rejected the attempt.
    #[error("invalid credentials or corrupted data")]
    InvalidCredential,

    #[error("encrypted record is corrupt: {0}")]
    CorruptRecord(String),

    #[error("no wallet record found")]
    NoVaultFound,

    #[error("a wallet already exists")]
    WalletExists,

    /// A recovery-phrase session is read-only; the caller must set a new
    /// password before anything can be persisted.
    #[error("set a new password before making changes")]
    PasswordResetRequired,

    #[error("a wallet keeps at least one vault")]
    LastVaultViolation,

    #[error("stored record changed since it was read")]
    Conflict,

    #[error("vault not found: {0}")]
    VaultNotFound(Uuid),

    #[error("key not found: {0}")]
    KeyNotFound(Uuid),

    #[error("wallet is locked")]
    Locked,

    #[error("cipher failure: {0}")]
    Cipher(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("remote rejected credentials")]
    Unauthenticated,

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl VaultError {
    /// Stable machine-readable code for the command seam; the display
    /// string is free to change, this is not.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredential => "invalid_credential",
            Self::CorruptRecord(_) => "corrupt_record",
            Self::NoVaultFound => "no_vault_found",
            Self::WalletExists => "wallet_exists",
            Self::PasswordResetRequired => "password_reset_required",
            Self::LastVaultViolation => "last_vault_violation",
            Self::Conflict => "conflict",
            Self::VaultNotFound(_) => "vault_not_found",
            Self::KeyNotFound(_) => "key_not_found",
            Self::Locked => "locked",
            Self::Cipher(_) => "cipher",
            Self::Network(_) => "network",
            Self::Unauthenticated => "unauthenticated",
            Self::Storage(_) => "storage",
            Self::Serialisation(_) => "serialisation",
        }
    }
}
