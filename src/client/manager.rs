// src/client/manager.rs
use std::sync::{Arc, Mutex};

use chrono::Utc;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::channel::{ChannelConfig, ChannelEvent, ProgressChannel};
use crate::client::installation::{InstallStatus, InstallationState};
use crate::client::relay::RelayApi;
use crate::client::review::{InstallationReview, ReviewContext, ReviewSlot, RevocationReview};
use crate::client::store::Store;
use crate::client::watch::{KeyPairRequest, PermissionSync, WatchBridge};
use crate::error::DelegateError;
use crate::protocol::{
    ExecuteDepositRequest, ExecuteInstallRequest, ExecuteInstallResponse, ExecuteRevokeRequest,
    InstallPayload, PolicyState, PolicyStateRequest, PrepareDepositRequest, PrepareInstallRequest,
    PrepareRevokeRequest, StatusUpdate, TxResponse,
};
use crate::types::{DelegatedKeyData, KeyType, SignedBlock, TokenLimit, UnsignedBlock};
use crate::userop::UserOpSigner;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest {
    pub device_id: String,
    pub device_name: String,
    pub key_type: KeyType,
    #[serde(default)]
    pub whitelist: Option<Vec<Address>>,
    #[serde(default)]
    pub token_limits: Option<Vec<TokenLimit>>,
}

impl CreateKeyRequest {
    fn validate(&self) -> Result<(), DelegateError> {
        if self.device_id.trim().is_empty() || self.device_name.trim().is_empty() {
            return Err(DelegateError::InvalidRequest(
                "device id and name are required".to_string(),
            ));
        }
        let restricted = self.key_type.requires_restrictions();
        let restrictions = self.whitelist.is_some() && self.token_limits.is_some();
        if restricted && !restrictions {
            return Err(DelegateError::InvalidRequest(
                "restricted keys need a recipient whitelist and token limits".to_string(),
            ));
        }
        if !restricted && (self.whitelist.is_some() || self.token_limits.is_some()) {
            return Err(DelegateError::InvalidRequest(
                "sudo keys take no restrictions".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RevocationState {
    #[default]
    Idle,
    Reviewing {
        key_id: String,
    },
    Revoking {
        key_id: String,
    },
    Revoked {
        key_id: String,
        tx_hash: H256,
    },
    Failed {
        key_id: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum ReviewOutcome {
    Installation(ExecuteInstallResponse),
    Revocation(TxResponse),
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub kernel_address: Address,
    pub owner: Address,
    /// Progress channel settings; without them progress must be fed through `apply_progress`.
    pub channel: Option<ChannelConfig>,
}

/// Drives delegated keys through install and revoke, owning the shared client state.
pub struct DelegatedKeyManager {
    config: ManagerConfig,
    relay: Arc<dyn RelayApi>,
    signer: UserOpSigner,
    watch: Arc<dyn WatchBridge>,
    installation: Arc<Store<InstallationState>>,
    revocation: Arc<Store<RevocationState>>,
    review: Arc<ReviewSlot>,
    keys: Arc<Store<Vec<DelegatedKeyData>>>,
    pending_key: Mutex<Option<DelegatedKeyData>>,
    channel: Mutex<Option<ProgressChannel>>,
}

impl DelegatedKeyManager {
    pub fn new(
        config: ManagerConfig,
        relay: Arc<dyn RelayApi>,
        signer: UserOpSigner,
        watch: Arc<dyn WatchBridge>,
    ) -> Self {
        Self {
            config,
            relay,
            signer,
            watch,
            installation: Arc::new(Store::default()),
            revocation: Arc::new(Store::default()),
            review: Arc::new(ReviewSlot::new()),
            keys: Arc::new(Store::default()),
            pending_key: Mutex::new(None),
            channel: Mutex::new(None),
        }
    }

    pub fn installation(&self) -> Arc<Store<InstallationState>> {
        self.installation.clone()
    }

    pub fn revocation(&self) -> Arc<Store<RevocationState>> {
        self.revocation.clone()
    }

    pub fn review(&self) -> Arc<ReviewSlot> {
        self.review.clone()
    }

    pub fn keys(&self) -> Arc<Store<Vec<DelegatedKeyData>>> {
        self.keys.clone()
    }

    /// Generates the key on the device and asks the relay for the unsigned installation bundle.
    /// The bundle lands in the review slot; nothing is signed yet.
    pub async fn create_delegated_key(
        &self,
        request: CreateKeyRequest,
    ) -> Result<InstallationReview, DelegateError> {
        request.validate()?;
        let began = self.installation.modify(|state| {
            if state.is_active() {
                return false;
            }
            *state = InstallationState::begin(&request.device_name, request.key_type);
            true
        });
        if !began {
            return Err(DelegateError::InstallationInProgress);
        }

        match self.prepare_installation(&request).await {
            Ok(review) => {
                self.set_review(ReviewContext::Installation(review.clone()));
                Ok(review)
            }
            Err(e) => {
                self.fail_installation(&e);
                Err(e)
            }
        }
    }

    async fn prepare_installation(
        &self,
        request: &CreateKeyRequest,
    ) -> Result<InstallationReview, DelegateError> {
        if !self.watch.ping_watch().await {
            return Err(DelegateError::Watch(format!(
                "device {} is not reachable",
                request.device_name
            )));
        }
        let generated = self
            .watch
            .generate_key_pair(&KeyPairRequest {
                device_id: request.device_id.clone(),
                device_name: request.device_name.clone(),
                key_type: request.key_type,
            })
            .await?;

        self.set_step("Preparing installation");
        let payload = self
            .relay
            .prepare_install(&PrepareInstallRequest {
                kernel_address: self.config.kernel_address,
                owner: self.config.owner,
                delegated_address: generated.address,
                key_type: request.key_type,
                device_id: request.device_id.clone(),
                device_name: request.device_name.clone(),
                whitelist: request.whitelist.clone(),
                token_limits: request.token_limits.clone(),
            })
            .await?;
        payload.check_complete(request.key_type)?;

        self.set_step("Waiting for confirmation");
        Ok(InstallationReview {
            installation_id: Uuid::new_v4().to_string(),
            device_id: request.device_id.clone(),
            device_name: request.device_name.clone(),
            key_type: request.key_type,
            kernel_address: self.config.kernel_address,
            delegated_address: generated.address,
            whitelist: request.whitelist.clone(),
            token_limits: request.token_limits.clone(),
            payload,
        })
    }

    /// Signs and submits exactly what is in the review slot.
    pub async fn confirm_review(self: &Arc<Self>) -> Result<ReviewOutcome, DelegateError> {
        match self.review.take()? {
            ReviewContext::Installation(review) => self
                .confirm_installation(review)
                .await
                .map(ReviewOutcome::Installation),
            ReviewContext::Revocation(review) => self
                .confirm_revocation(review)
                .await
                .map(ReviewOutcome::Revocation),
        }
    }

    /// Drops the pending review. Nothing was broadcast, so the owning flow goes back to idle.
    pub fn cancel_review(&self) -> bool {
        let Some(context) = self.review.get() else {
            return false;
        };
        self.review.clear();
        match context {
            ReviewContext::Installation(_) => {
                self.installation.set(InstallationState::default());
            }
            ReviewContext::Revocation(_) => self.revocation.set(RevocationState::Idle),
        }
        info!("Review cancelled");
        true
    }

    async fn confirm_installation(
        self: &Arc<Self>,
        review: InstallationReview,
    ) -> Result<ExecuteInstallResponse, DelegateError> {
        let result = self.submit_installation(&review).await;
        match result {
            Ok(response) => {
                info!(
                    "Installation {} submitted: {}",
                    response.installation_id, response.message
                );
                self.sync_watch(&review).await;
                Ok(response)
            }
            Err(e) => {
                self.fail_installation(&e);
                Err(e)
            }
        }
    }

    async fn submit_installation(
        self: &Arc<Self>,
        review: &InstallationReview,
    ) -> Result<ExecuteInstallResponse, DelegateError> {
        self.set_step("Signing operations");
        let request = self.sign_install_bundle(review).await?;

        self.start_channel(&review.installation_id);
        self.set_pending(Some(DelegatedKeyData {
            id: review.device_id.clone(),
            name: review.device_name.clone(),
            address: review.delegated_address,
            key_type: review.key_type,
            validator_id: review.payload.validator_id.clone(),
            permission_id: review.payload.permission_id.clone(),
            created_at: Utc::now(),
            whitelist: review.whitelist.clone(),
            token_limits: review.token_limits.clone(),
            installation_progress: None,
        }));

        self.set_step("Submitting to relay");
        self.relay.execute_install(&request).await
    }

    /// Signs every block or none: a refusal on any block aborts before execute.
    async fn sign_install_bundle(
        &self,
        review: &InstallationReview,
    ) -> Result<ExecuteInstallRequest, DelegateError> {
        let payload: &InstallPayload = &review.payload;
        payload.check_complete(review.key_type)?;

        let policy = self.sign_block(&payload.policy, "policy").await?;
        let grant_access = self.sign_block(&payload.grant_access, "grantAccess").await?;
        let recipients = match &payload.recipients {
            Some(block) => Some(self.sign_block(block, "recipients").await?),
            None => None,
        };
        let tokens = match &payload.tokens {
            Some(block) => Some(self.sign_block(block, "tokens").await?),
            None => None,
        };

        Ok(ExecuteInstallRequest {
            client_id: review.installation_id.clone(),
            kernel_address: review.kernel_address,
            device_id: review.device_id.clone(),
            key_type: review.key_type,
            permission_id: payload.permission_id.clone(),
            validator_id: payload.validator_id.clone(),
            policy,
            grant_access,
            recipients,
            tokens,
        })
    }

    async fn sign_block(&self, block: &UnsignedBlock, name: &str) -> Result<SignedBlock, DelegateError> {
        match self.signer.process_unsigned_block(block, name).await? {
            Some(result) => Ok(SignedBlock::new(block, result)),
            None => Err(DelegateError::HashMismatch(name.to_string())),
        }
    }

    async fn sync_watch(&self, review: &InstallationReview) {
        let sync = PermissionSync {
            device_id: review.device_id.clone(),
            kernel_address: review.kernel_address,
            key_type: review.key_type,
            permission_id: review.payload.permission_id.clone(),
            validator_id: review.payload.validator_id.clone(),
            whitelist: review.whitelist.clone(),
            token_limits: review.token_limits.clone(),
        };
        match self.watch.sync_permission_data(&sync).await {
            Ok(true) => debug!("Permission data synced to {}", review.device_name),
            Ok(false) => warn!("Device {} did not accept permission data", review.device_name),
            Err(e) => warn!("Permission sync to {} failed: {}", review.device_name, e),
        }
    }

    pub async fn prepare_revocation(&self, key_id: &str) -> Result<RevocationReview, DelegateError> {
        let key = self.find_key(key_id)?;

        let payload = self
            .relay
            .prepare_revoke(&PrepareRevokeRequest {
                kernel_address: self.config.kernel_address,
                owner: self.config.owner,
                key_id: key.id.clone(),
                validator_id: key.validator_id.clone(),
                permission_id: key.permission_id.clone(),
            })
            .await
            .map_err(|e| {
                self.revocation.set(RevocationState::Failed {
                    key_id: key_id.to_string(),
                    message: e.to_string(),
                });
                e
            })?;

        let review = RevocationReview {
            revocation_id: Uuid::new_v4().to_string(),
            kernel_address: self.config.kernel_address,
            key,
            payload,
        };
        self.revocation.set(RevocationState::Reviewing {
            key_id: key_id.to_string(),
        });
        self.set_review(ReviewContext::Revocation(review.clone()));
        Ok(review)
    }

    async fn confirm_revocation(&self, review: RevocationReview) -> Result<TxResponse, DelegateError> {
        let key_id = review.key.id.clone();
        self.revocation.set(RevocationState::Revoking {
            key_id: key_id.clone(),
        });

        let result = async {
            let revoke = self.sign_block(&review.payload.revoke, "revoke").await?;
            self.relay
                .execute_revoke(&ExecuteRevokeRequest {
                    client_id: Some(review.revocation_id.clone()),
                    kernel_address: review.kernel_address,
                    key_id: key_id.clone(),
                    revoke,
                })
                .await
        }
        .await;

        match result {
            Ok(response) => {
                self.keys.modify(|keys| {
                    let before = keys.len();
                    keys.retain(|key| key.id != key_id);
                    keys.len() != before
                });
                info!("Revoked delegated key {} in {:?}", key_id, response.tx_hash);
                self.revocation.set(RevocationState::Revoked {
                    key_id,
                    tx_hash: response.tx_hash,
                });
                Ok(response)
            }
            Err(e) => {
                error!("Revocation of {} failed: {}", key_id, e);
                self.revocation.set(RevocationState::Failed {
                    key_id,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Prefunds the account's EntryPoint deposit.
    pub async fn deposit(&self, amount: U256) -> Result<TxResponse, DelegateError> {
        let payload = self
            .relay
            .prepare_deposit(&PrepareDepositRequest {
                kernel_address: self.config.kernel_address,
                amount,
            })
            .await?;
        let deposit = self.sign_block(&payload.deposit, "deposit").await?;
        let response = self
            .relay
            .execute_deposit(&ExecuteDepositRequest {
                kernel_address: self.config.kernel_address,
                deposit,
            })
            .await?;
        info!("Deposited {} wei to EntryPoint in {:?}", amount, response.tx_hash);
        Ok(response)
    }

    pub async fn relay_health(&self) -> Result<bool, DelegateError> {
        self.relay.health().await
    }

    /// Reads back what the chain holds for one of this wallet's keys.
    pub async fn key_policy(&self, key_id: &str) -> Result<PolicyState, DelegateError> {
        let key = self.find_key(key_id)?;
        self.relay
            .policy_state(&PolicyStateRequest {
                kernel_address: self.config.kernel_address,
                permission_id: key.permission_id,
            })
            .await
    }

    fn find_key(&self, key_id: &str) -> Result<DelegatedKeyData, DelegateError> {
        self.keys
            .get()
            .into_iter()
            .find(|key| key.id == key_id)
            .ok_or_else(|| DelegateError::InvalidRequest(format!("unknown delegated key {key_id}")))
    }

    /// Folds a relay status update into the installation state. A key enters the list only when
    /// its installation reaches `completed`.
    pub fn apply_progress(&self, update: &StatusUpdate) {
        if !self.installation.modify(|state| state.apply(update)) {
            return;
        }
        let state = self.installation.get();
        match &state.status {
            InstallStatus::Completed { .. } => {
                if let Some(mut key) = self.set_pending(None) {
                    key.installation_progress = Some(state.snapshot());
                    info!("Delegated key {} is active", key.id);
                    self.keys.modify(|keys| {
                        keys.retain(|existing| existing.id != key.id);
                        keys.push(key);
                        true
                    });
                }
                self.stop_channel();
            }
            InstallStatus::Failed { message, .. } => {
                warn!("Installation failed: {}", message);
                self.set_pending(None);
                self.stop_channel();
            }
            _ => {}
        }
    }

    pub fn on_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Status(update) => self.apply_progress(&update),
            ChannelEvent::Connected { client_id } => debug!("Relay assigned client id {}", client_id),
            ChannelEvent::ConnectionChanged {
                connected: false,
                permanent: true,
            } => {
                if self.installation.get().is_active() {
                    self.fail_installation(&DelegateError::Transport(
                        "lost connection to the relay".to_string(),
                    ));
                }
            }
            ChannelEvent::ConnectionChanged { connected, .. } => {
                debug!("Progress channel connected: {}", connected)
            }
        }
    }

    fn start_channel(self: &Arc<Self>, client_id: &str) {
        let Some(config) = &self.config.channel else {
            return;
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = ProgressChannel::connect(config.for_client(client_id), tx);
        let previous = self
            .channel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(channel);
        if let Some(previous) = previous {
            previous.disconnect();
        }

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match manager.upgrade() {
                    Some(manager) => manager.on_channel_event(event),
                    None => break,
                }
            }
        });
    }

    fn stop_channel(&self) {
        let channel = self
            .channel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(channel) = channel {
            channel.disconnect();
        }
    }

    fn fail_installation(&self, error: &DelegateError) {
        let (message, detail) = match error {
            DelegateError::HashMismatch(_) => {
                ("Could not verify transaction".to_string(), error.to_string())
            }
            _ => (error.to_string(), error.to_string()),
        };
        if error.is_retryable() {
            warn!("Installation failed on transport: {}", detail);
        } else {
            error!("Installation failed: {}", detail);
        }
        self.installation
            .modify(|state| state.fail(message, Some(detail)));
        self.set_pending(None);
        self.stop_channel();
    }

    /// Puts a new review in the slot. The flow whose review it displaces goes back to idle, since
    /// nothing of it was signed.
    fn set_review(&self, next: ReviewContext) {
        match (self.review.get(), &next) {
            (Some(ReviewContext::Installation(_)), ReviewContext::Revocation(_)) => {
                info!("Pending installation review replaced by a revocation");
                self.installation.set(InstallationState::default());
            }
            (Some(ReviewContext::Revocation(_)), ReviewContext::Installation(_)) => {
                info!("Pending revocation review replaced by an installation");
                self.revocation.set(RevocationState::Idle);
            }
            _ => {}
        }
        self.review.set(next);
    }

    fn set_step(&self, step: &str) {
        self.installation.modify(|state| {
            if !state.is_active() {
                return false;
            }
            state.current_step = step.to_string();
            true
        });
    }

    fn set_pending(&self, key: Option<DelegatedKeyData>) -> Option<DelegatedKeyData> {
        let mut pending = self
            .pending_key
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *pending, key)
    }
}
