// src/userop/entrypoint.rs
use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::id;
use tracing::debug;

use crate::error::DelegateError;
use crate::types::{PackedUserOperation, TokenLimit};

/// Canonical ERC-4337 v0.7 EntryPoint deployment.
pub const ENTRY_POINT_V07: &str = "0x0000000071727De22E5E9d8BAf0edAc6f37da032";

/// Kernel's "validator installed without a hook" marker.
pub const NO_HOOK_SENTINEL: Address = H160([
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
]);

/// `executeUserOp(PackedUserOperation,bytes32)` selector, required in front of call data when the
/// validating module carries a hook.
pub const EXECUTE_USER_OP_SELECTOR: [u8; 4] = [0x8d, 0xd7, 0x71, 0x2f];

const GET_USER_OP_HASH: &str =
    "getUserOpHash((address,uint256,bytes,bytes,bytes32,uint256,bytes32,bytes,bytes))";
const GET_NONCE: &str = "getNonce(address,uint192)";

abigen!(
    KernelContract,
    r#"[
        function rootValidator() external view returns (bytes21)
        function validationConfig(bytes21 vId) external view returns (uint32 nonce, address hook)
    ]"#
);

abigen!(
    CallPolicyContract,
    r#"[
        {"type":"function","name":"recipientAllowlist","stateMutability":"view",
         "inputs":[{"name":"id","type":"bytes32"},{"name":"wallet","type":"address"}],
         "outputs":[{"name":"","type":"address[]"}]},
        {"type":"function","name":"tokenLimits","stateMutability":"view",
         "inputs":[{"name":"id","type":"bytes32"},{"name":"wallet","type":"address"}],
         "outputs":[{"name":"","type":"tuple[]","components":[
             {"name":"","type":"address"},{"name":"","type":"uint256"},{"name":"","type":"uint256"}]}]}
    ]"#
);

/// Read-only EntryPoint access. Every call is a chain read and fails with `ChainRead`.
#[async_trait]
pub trait EntryPointReader: Send + Sync {
    fn address(&self) -> Address;

    async fn get_user_op_hash(&self, op: &PackedUserOperation) -> Result<H256, DelegateError>;

    async fn get_nonce(&self, sender: Address, key: U256) -> Result<U256, DelegateError>;
}

pub struct EntryPoint<M> {
    client: Arc<M>,
    address: Address,
}

impl<M: Middleware> EntryPoint<M> {
    pub fn new(client: Arc<M>, address: Address) -> Self {
        Self { client, address }
    }

    async fn read(&self, data: Vec<u8>, ret: ParamType) -> Result<Token, DelegateError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.address)
            .data(Bytes::from(data))
            .into();
        let out = self
            .client
            .call(&tx, None)
            .await
            .map_err(|e| DelegateError::ChainRead(e.to_string()))?;
        decode(&[ret], &out)
            .map_err(|e| DelegateError::ChainRead(format!("malformed response: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| DelegateError::ChainRead("empty response".to_string()))
    }
}

#[async_trait]
impl<M: Middleware + 'static> EntryPointReader for EntryPoint<M> {
    fn address(&self) -> Address {
        self.address
    }

    async fn get_user_op_hash(&self, op: &PackedUserOperation) -> Result<H256, DelegateError> {
        let mut data = id(GET_USER_OP_HASH).to_vec();
        data.extend(encode(&[packed_op_token(op)]));

        match self.read(data, ParamType::FixedBytes(32)).await? {
            Token::FixedBytes(bytes) if bytes.len() == 32 => {
                let hash = H256::from_slice(&bytes);
                debug!("EntryPoint hash for {} nonce {}: {:?}", op.sender, op.nonce, hash);
                Ok(hash)
            }
            other => Err(DelegateError::ChainRead(format!(
                "unexpected getUserOpHash return {other:?}"
            ))),
        }
    }

    async fn get_nonce(&self, sender: Address, key: U256) -> Result<U256, DelegateError> {
        let mut data = id(GET_NONCE).to_vec();
        data.extend(encode(&[Token::Address(sender), Token::Uint(key)]));

        match self.read(data, ParamType::Uint(256)).await? {
            Token::Uint(nonce) => Ok(nonce),
            other => Err(DelegateError::ChainRead(format!(
                "unexpected getNonce return {other:?}"
            ))),
        }
    }
}

/// ABI tuple for `PackedUserOperation`.
pub fn packed_op_token(op: &PackedUserOperation) -> Token {
    Token::Tuple(vec![
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::Bytes(op.init_code.to_vec()),
        Token::Bytes(op.call_data.to_vec()),
        Token::FixedBytes(op.account_gas_limits.as_bytes().to_vec()),
        Token::Uint(op.pre_verification_gas),
        Token::FixedBytes(op.gas_fees.as_bytes().to_vec()),
        Token::Bytes(op.paymaster_and_data.to_vec()),
        Token::Bytes(op.signature.to_vec()),
    ])
}

/// Kernel account state needed to shape call data.
#[async_trait]
pub trait KernelInspector: Send + Sync {
    /// Whether call data validated by `v_id` (root validator when `None`) must be wrapped in
    /// `executeUserOp`.
    async fn needs_execute_user_op_prefix(
        &self,
        kernel: Address,
        v_id: Option<[u8; 21]>,
    ) -> Result<bool, DelegateError>;

    /// Nonce and hook Kernel keeps for `v_id`. A zero hook means nothing is installed there.
    async fn validation_config(
        &self,
        kernel: Address,
        v_id: [u8; 21],
    ) -> Result<(u32, Address), DelegateError>;

    /// Recipient allowlist and token limits the call policy at `policy` stores for `kernel`
    /// under `key`.
    async fn call_policy(
        &self,
        policy: Address,
        kernel: Address,
        key: [u8; 32],
    ) -> Result<(Vec<Address>, Vec<TokenLimit>), DelegateError>;
}

pub struct KernelRpc<M> {
    client: Arc<M>,
}

impl<M: Middleware + 'static> KernelRpc<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<M: Middleware + 'static> KernelInspector for KernelRpc<M> {
    async fn needs_execute_user_op_prefix(
        &self,
        kernel: Address,
        v_id: Option<[u8; 21]>,
    ) -> Result<bool, DelegateError> {
        let contract = KernelContract::new(kernel, self.client.clone());
        let v_id = match v_id {
            Some(v_id) => v_id,
            None => contract
                .root_validator()
                .call()
                .await
                .map_err(|e| DelegateError::ChainRead(format!("rootValidator: {e}")))?,
        };
        let (_, hook) = self.validation_config(kernel, v_id).await?;
        Ok(hook_requires_prefix(hook))
    }

    async fn validation_config(
        &self,
        kernel: Address,
        v_id: [u8; 21],
    ) -> Result<(u32, Address), DelegateError> {
        KernelContract::new(kernel, self.client.clone())
            .validation_config(v_id)
            .call()
            .await
            .map_err(|e| DelegateError::ChainRead(format!("validationConfig: {e}")))
    }

    async fn call_policy(
        &self,
        policy: Address,
        kernel: Address,
        key: [u8; 32],
    ) -> Result<(Vec<Address>, Vec<TokenLimit>), DelegateError> {
        let contract = CallPolicyContract::new(policy, self.client.clone());
        let recipients = contract
            .recipient_allowlist(key, kernel)
            .call()
            .await
            .map_err(|e| DelegateError::ChainRead(format!("recipientAllowlist: {e}")))?;
        let limits = contract
            .token_limits(key, kernel)
            .call()
            .await
            .map_err(|e| DelegateError::ChainRead(format!("tokenLimits: {e}")))?;
        let limits = limits
            .into_iter()
            .map(|(token, max_per_transaction, max_per_day)| TokenLimit {
                token,
                max_per_transaction,
                max_per_day,
            })
            .collect();
        Ok((recipients, limits))
    }
}

pub fn hook_requires_prefix(hook: Address) -> bool {
    !hook.is_zero() && hook != NO_HOOK_SENTINEL
}

pub fn with_execute_user_op_prefix(call_data: &[u8]) -> Bytes {
    if call_data.starts_with(&EXECUTE_USER_OP_SELECTOR) {
        return Bytes::from(call_data.to_vec());
    }
    let mut out = EXECUTE_USER_OP_SELECTOR.to_vec();
    out.extend_from_slice(call_data);
    Bytes::from(out)
}
