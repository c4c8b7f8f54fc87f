// src/backend/bundler.rs
use std::time::Duration;

use async_trait::async_trait;
use ethers::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::DelegateError;
use crate::types::{numeric, UnpackedUserOperation};

/// 65-byte placeholder so estimation sees a realistic signature length.
pub fn dummy_signature() -> Bytes {
    let mut sig = vec![0xff; 65];
    sig[64] = 0x1c;
    Bytes::from(sig)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    #[serde(with = "numeric")]
    pub pre_verification_gas: U256,
    #[serde(with = "numeric")]
    pub verification_gas_limit: U256,
    #[serde(with = "numeric")]
    pub call_gas_limit: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasFees {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Paymaster fields returned by `pm_sponsorUserOperation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sponsorship {
    pub paymaster: Address,
    pub paymaster_data: Bytes,
    #[serde(with = "numeric")]
    pub paymaster_verification_gas_limit: U256,
    #[serde(with = "numeric")]
    pub paymaster_post_op_gas_limit: U256,
}

impl Sponsorship {
    pub fn apply(&self, op: &mut UnpackedUserOperation) {
        op.paymaster = Some(self.paymaster);
        op.paymaster_data = Some(self.paymaster_data.clone());
        op.paymaster_verification_gas_limit = Some(self.paymaster_verification_gas_limit);
        op.paymaster_post_op_gas_limit = Some(self.paymaster_post_op_gas_limit);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRef {
    pub transaction_hash: H256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOpReceipt {
    pub user_op_hash: H256,
    pub success: bool,
    #[serde(default)]
    pub reason: Option<String>,
    pub receipt: ReceiptRef,
}

/// ERC-4337 bundler and paymaster access used by the relay side.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn estimate_user_operation_gas(
        &self,
        op: &UnpackedUserOperation,
    ) -> Result<GasEstimate, DelegateError>;

    async fn gas_fees(&self) -> Result<GasFees, DelegateError>;

    /// `None` when no paymaster is configured.
    async fn sponsor_user_operation(
        &self,
        op: &UnpackedUserOperation,
    ) -> Result<Option<Sponsorship>, DelegateError>;

    async fn send_user_operation(&self, op: &UnpackedUserOperation) -> Result<H256, DelegateError>;

    async fn wait_for_receipt(&self, user_op_hash: H256) -> Result<UserOpReceipt, DelegateError>;
}

/// Bundler over any ethers JSON-RPC transport.
pub struct RpcBundler<P> {
    provider: Provider<P>,
    paymaster: Option<Provider<P>>,
    entry_point: Address,
    poll_interval: Duration,
    max_polls: usize,
}

impl<P: JsonRpcClient> RpcBundler<P> {
    pub fn new(provider: Provider<P>, entry_point: Address) -> Self {
        Self {
            provider,
            paymaster: None,
            entry_point,
            poll_interval: Duration::from_secs(2),
            max_polls: 60,
        }
    }

    pub fn with_paymaster(mut self, paymaster: Provider<P>) -> Self {
        self.paymaster = Some(paymaster);
        self
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: usize) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls;
        self
    }

    async fn request<T, R>(provider: &Provider<P>, method: &str, params: T) -> Result<R, DelegateError>
    where
        T: std::fmt::Debug + Serialize + Send + Sync,
        R: Serialize + DeserializeOwned + std::fmt::Debug + Send,
    {
        provider
            .request(method, params)
            .await
            .map_err(|e| DelegateError::Execution(format!("{method}: {e}")))
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> Bundler for RpcBundler<P> {
    async fn estimate_user_operation_gas(
        &self,
        op: &UnpackedUserOperation,
    ) -> Result<GasEstimate, DelegateError> {
        Self::request(
            &self.provider,
            "eth_estimateUserOperationGas",
            (op, self.entry_point),
        )
        .await
    }

    async fn gas_fees(&self) -> Result<GasFees, DelegateError> {
        let (max_fee_per_gas, max_priority_fee_per_gas) = self
            .provider
            .estimate_eip1559_fees(None)
            .await
            .map_err(|e| DelegateError::ChainRead(e.to_string()))?;
        Ok(GasFees {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }

    async fn sponsor_user_operation(
        &self,
        op: &UnpackedUserOperation,
    ) -> Result<Option<Sponsorship>, DelegateError> {
        let Some(paymaster) = &self.paymaster else {
            return Ok(None);
        };
        debug!("Requesting sponsorship for {}", op.sender);
        Self::request(paymaster, "pm_sponsorUserOperation", (op, self.entry_point))
            .await
            .map(Some)
    }

    async fn send_user_operation(&self, op: &UnpackedUserOperation) -> Result<H256, DelegateError> {
        let hash: H256 = Self::request(
            &self.provider,
            "eth_sendUserOperation",
            (op, self.entry_point),
        )
        .await?;
        info!("Bundler accepted user operation {:?}", hash);
        Ok(hash)
    }

    async fn wait_for_receipt(&self, user_op_hash: H256) -> Result<UserOpReceipt, DelegateError> {
        for _ in 0..self.max_polls {
            let receipt: Option<UserOpReceipt> = Self::request(
                &self.provider,
                "eth_getUserOperationReceipt",
                [user_op_hash],
            )
            .await?;
            if let Some(receipt) = receipt {
                return Ok(receipt);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(DelegateError::Execution(format!(
            "no receipt for {user_op_hash:?} after {} polls",
            self.max_polls
        )))
    }
}
