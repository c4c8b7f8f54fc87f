//! Wire shapes shared by the relay and the client: HTTP bodies and progress-channel messages.

use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

use crate::error::DelegateError;
use crate::types::{numeric, KeyType, SignedBlock, TokenLimit, UnpackedUserOperation, UnsignedBlock};

pub const PREPARE_INSTALL: &str = "/wallet/delegated/install/prepare-data";
pub const EXECUTE_INSTALL: &str = "/wallet/delegated/install/execute";
pub const PREPARE_REVOKE: &str = "/wallet/delegated/revoke/prepare-data";
pub const EXECUTE_REVOKE: &str = "/wallet/delegated/revoke/execute";
pub const PREPARE_DEPOSIT: &str = "/wallet/entrypoint/deposit/prepare-data";
pub const EXECUTE_DEPOSIT: &str = "/wallet/entrypoint/deposit/execute";
pub const SEND_USER_OP: &str = "/wallet/userOp/send-uop";
pub const HEALTH: &str = "/wallet/health";
pub const CALL_POLICY_STATE: &str = "/wallet/callpolicy/state";

/// Envelope around every relay response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> RelayResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            error: None,
            data: Some(data),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            error: None,
            data: None,
        }
    }

    pub fn into_result(self, endpoint: &str) -> Result<T, DelegateError> {
        if !self.success {
            let reason = self
                .error
                .or(self.message)
                .unwrap_or_else(|| format!("{endpoint} reported failure"));
            return Err(DelegateError::Execution(reason));
        }
        self.data
            .ok_or_else(|| DelegateError::MalformedPayload(format!("{endpoint}: missing data")))
    }
}

/// Restricted keys carry both restriction blocks; sudo keys carry neither.
pub fn check_bundle_shape<R, T>(
    key_type: KeyType,
    recipients: &Option<R>,
    tokens: &Option<T>,
) -> Result<(), DelegateError> {
    match (key_type, recipients.is_some(), tokens.is_some()) {
        (KeyType::Restricted, true, true) | (KeyType::Sudo, false, false) => Ok(()),
        (KeyType::Restricted, _, _) => Err(DelegateError::MalformedPayload(
            "restricted key bundle is missing recipient or token configuration".to_string(),
        )),
        (KeyType::Sudo, _, _) => Err(DelegateError::MalformedPayload(
            "sudo key bundle must not carry restriction blocks".to_string(),
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareInstallRequest {
    pub kernel_address: Address,
    pub owner: Address,
    pub delegated_address: Address,
    pub key_type: KeyType,
    pub device_id: String,
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<Vec<Address>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_limits: Option<Vec<TokenLimit>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InstallPayload {
    pub permission_id: Bytes,
    pub validator_id: Bytes,
    pub policy: UnsignedBlock,
    pub grant_access: UnsignedBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<UnsignedBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<UnsignedBlock>,
}

impl InstallPayload {
    pub fn check_complete(&self, key_type: KeyType) -> Result<(), DelegateError> {
        check_bundle_shape(key_type, &self.recipients, &self.tokens)
    }

    /// Blocks in submission order, with their display names.
    pub fn blocks(&self) -> Vec<(&'static str, &UnsignedBlock)> {
        let mut blocks = vec![("policy", &self.policy), ("grantAccess", &self.grant_access)];
        if let Some(recipients) = &self.recipients {
            blocks.push(("recipients", recipients));
        }
        if let Some(tokens) = &self.tokens {
            blocks.push(("tokens", tokens));
        }
        blocks
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteInstallRequest {
    pub client_id: String,
    pub kernel_address: Address,
    pub device_id: String,
    pub key_type: KeyType,
    pub permission_id: Bytes,
    pub validator_id: Bytes,
    pub policy: SignedBlock,
    pub grant_access: SignedBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<SignedBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<SignedBlock>,
}

impl ExecuteInstallRequest {
    pub fn check_complete(&self) -> Result<(), DelegateError> {
        check_bundle_shape(self.key_type, &self.recipients, &self.tokens)
    }

    pub fn blocks(&self) -> Vec<(&'static str, &SignedBlock)> {
        let mut blocks = vec![("policy", &self.policy), ("grantAccess", &self.grant_access)];
        if let Some(recipients) = &self.recipients {
            blocks.push(("recipients", recipients));
        }
        if let Some(tokens) = &self.tokens {
            blocks.push(("tokens", tokens));
        }
        blocks
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteInstallResponse {
    pub installation_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareRevokeRequest {
    pub kernel_address: Address,
    pub owner: Address,
    pub key_id: String,
    pub validator_id: Bytes,
    pub permission_id: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RevokePayload {
    pub revoke: UnsignedBlock,
    /// Worst-case cost in wei: total gas times max fee.
    #[serde(with = "numeric")]
    pub gas_estimate: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRevokeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub kernel_address: Address,
    pub key_id: String,
    pub revoke: SignedBlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxResponse {
    pub tx_hash: H256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareDepositRequest {
    pub kernel_address: Address,
    #[serde(with = "numeric")]
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DepositPayload {
    pub deposit: UnsignedBlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteDepositRequest {
    pub kernel_address: Address,
    pub deposit: SignedBlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendUserOpRequest {
    pub user_op: UnpackedUserOperation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendUserOpResponse {
    pub user_op_hash: H256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStateRequest {
    pub kernel_address: Address,
    pub permission_id: Bytes,
}

/// What the chain holds for one permission right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyState {
    pub permission_id: Bytes,
    pub validator_id: Bytes,
    pub installed: bool,
    pub nonce: u32,
    pub hook: Address,
    pub whitelist: Vec<Address>,
    pub token_limits: Vec<TokenLimit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Step names carried in `status_update.step`.
pub mod step {
    pub const INSTALLING: &str = "installing";
    pub const GRANTING: &str = "granting";
    pub const RECIPIENTS: &str = "recipients";
    pub const TOKENS: &str = "tokens";
    pub const REVOKING: &str = "revoking";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub step: String,
    pub message: String,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<H256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v_id: Option<String>,
}

impl StatusUpdate {
    pub fn new(step: &str, progress: u8, message: impl Into<String>) -> Self {
        Self {
            step: step.to_string(),
            message: message.into(),
            progress,
            tx_hash: None,
            error: None,
            permission_id: None,
            v_id: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(step::FAILED, 0, message)
        }
    }

    pub fn with_tx_hash(mut self, tx_hash: Option<H256>) -> Self {
        self.tx_hash = tx_hash;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.step == step::FAILED || self.error.is_some()
    }
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    StatusUpdate(StatusUpdate),
    Pong,
}

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
}
