//! Volatile cache for the derived key, backed by the store's session tier.
//! Nothing here ever writes to the durable tier; losing the session loses
//! the key and nothing else.

use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};

use crate::crypto::SessionKey;
use crate::error::{Result, VaultError};
use crate::store::{DurableStore, Tier, KEY_SESSION_KEY};

#[derive(Clone)]
pub struct SessionKeyCache {
    store: Arc<dyn DurableStore>,
}

impl SessionKeyCache {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub async fn set(&self, key: &SessionKey) -> Result<()> {
        let encoded = general_purpose::STANDARD.encode(key.as_bytes());
        self.store.set(Tier::Session, KEY_SESSION_KEY, encoded).await
    }

    pub async fn get(&self) -> Result<Option<SessionKey>> {
        match self.store.get(Tier::Session, KEY_SESSION_KEY).await? {
            Some(encoded) => {
                let bytes = general_purpose::STANDARD
                    .decode(encoded.as_str())
                    .map_err(|e| VaultError::Cipher(format!("cached key: {e}")))?;
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| VaultError::Cipher("cached key: wrong length".to_string()))?;
                Ok(Some(SessionKey::from_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    pub async fn is_cached(&self) -> Result<bool> {
        Ok(self
            .store
            .get(Tier::Session, KEY_SESSION_KEY)
            .await?
            .is_some())
    }

    /// Idempotent; clearing an empty cache is a no-op.
    pub async fn clear(&self) -> Result<()> {
        self.store.remove(Tier::Session, KEY_SESSION_KEY).await
    }
}
