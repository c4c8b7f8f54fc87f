// src/client/watch.rs
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use ethers::core::rand::thread_rng;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::DelegateError;
use crate::types::{KeyType, TokenLimit};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairRequest {
    pub device_id: String,
    pub device_name: String,
    pub key_type: KeyType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedKey {
    pub address: Address,
}

/// Permission details the device needs to sign as the delegated key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionSync {
    pub device_id: String,
    pub kernel_address: Address,
    pub key_type: KeyType,
    pub permission_id: Bytes,
    pub validator_id: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<Vec<Address>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_limits: Option<Vec<TokenLimit>>,
}

/// Companion device that holds delegated key material.
#[async_trait]
pub trait WatchBridge: Send + Sync {
    async fn ping_watch(&self) -> bool;

    async fn generate_key_pair(&self, request: &KeyPairRequest) -> Result<GeneratedKey, DelegateError>;

    async fn sync_permission_data(&self, data: &PermissionSync) -> Result<bool, DelegateError>;
}

/// Keeps delegated keys in process memory, for hosts without a paired device.
#[derive(Default)]
pub struct SoftwareWatch {
    keys: Mutex<HashMap<String, LocalWallet>>,
    permissions: Mutex<HashMap<String, PermissionSync>>,
}

impl SoftwareWatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(&self, device_id: &str) -> Option<LocalWallet> {
        self.keys
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(device_id)
            .cloned()
    }

    pub fn permission(&self, device_id: &str) -> Option<PermissionSync> {
        self.permissions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(device_id)
            .cloned()
    }
}

#[async_trait]
impl WatchBridge for SoftwareWatch {
    async fn ping_watch(&self) -> bool {
        true
    }

    async fn generate_key_pair(&self, request: &KeyPairRequest) -> Result<GeneratedKey, DelegateError> {
        let wallet = LocalWallet::new(&mut thread_rng());
        let address = wallet.address();
        info!(
            "Generated {} key {:?} for device {}",
            request.key_type, address, request.device_name
        );
        self.keys
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(request.device_id.clone(), wallet);
        Ok(GeneratedKey { address })
    }

    async fn sync_permission_data(&self, data: &PermissionSync) -> Result<bool, DelegateError> {
        let known = self.key(&data.device_id).is_some();
        self.permissions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(data.device_id.clone(), data.clone());
        Ok(known)
    }
}
