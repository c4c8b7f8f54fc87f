// src/userop/keystore.rs
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use tracing::info;

use crate::error::DelegateError;
use crate::types::KeyRole;

/// Secure key storage. `Ok(None)` means the key is simply not there.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn load_private_key(&self, role: KeyRole) -> Result<Option<LocalWallet>, DelegateError>;
}

/// Process-local key storage, filled from configuration at start-up.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<KeyRole, LocalWallet>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_hex(role: KeyRole, private_key: &str) -> Result<Self, DelegateError> {
        let wallet = private_key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| DelegateError::Signing(format!("invalid {role} key: {e}")))?;
        let store = Self::new();
        store.insert(role, wallet);
        Ok(store)
    }

    pub fn insert(&self, role: KeyRole, wallet: LocalWallet) {
        info!("Loaded {} key for {:?}", role, wallet.address());
        self.keys
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(role, wallet);
    }

    pub fn address(&self, role: KeyRole) -> Option<ethers::types::Address> {
        self.keys
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&role)
            .map(|w| w.address())
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load_private_key(&self, role: KeyRole) -> Result<Option<LocalWallet>, DelegateError> {
        Ok(self
            .keys
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&role)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[tokio::test]
    async fn loads_only_the_stored_role() {
        let store = MemoryKeyStore::from_hex(KeyRole::Root, KEY).unwrap();
        assert!(store.load_private_key(KeyRole::Root).await.unwrap().is_some());
        assert!(store.load_private_key(KeyRole::Delegated).await.unwrap().is_none());
        assert_eq!(
            store.address(KeyRole::Root).unwrap(),
            "0x2c7536E3605D9C16a7a3D7b1898e529396a65c23".parse().unwrap()
        );
    }

    #[test]
    fn garbage_key_is_rejected() {
        assert!(MemoryKeyStore::from_hex(KeyRole::Root, "0x1234").is_err());
    }
}
