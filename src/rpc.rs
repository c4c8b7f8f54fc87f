// src/rpc.rs
use std::sync::Arc;

use ethers::types::U256;
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::error::{ErrorObject, ErrorObjectOwned, INVALID_PARAMS_CODE};
use tracing::{debug, error, info};

use crate::client::installation::InstallationState;
use crate::client::manager::{CreateKeyRequest, DelegatedKeyManager, ReviewOutcome, RevocationState};
use crate::client::review::{InstallationReview, ReviewContext, RevocationReview};
use crate::error::DelegateError;
use crate::protocol::{PolicyState, TxResponse};
use crate::types::DelegatedKeyData;

const WALLET_ERROR_CODE: i32 = -32000;

#[rpc(server, namespace = "wallet")]
pub trait WalletApi {
    /// Generates a key on the device and returns the installation bundle for review.
    #[method(name = "createDelegatedKey")]
    async fn create_delegated_key(&self, request: CreateKeyRequest) -> RpcResult<InstallationReview>;

    /// Signs and submits whatever is under review.
    #[method(name = "confirmReview")]
    async fn confirm_review(&self) -> RpcResult<ReviewOutcome>;

    #[method(name = "cancelReview")]
    async fn cancel_review(&self) -> RpcResult<bool>;

    #[method(name = "getReview")]
    async fn get_review(&self) -> RpcResult<Option<ReviewContext>>;

    #[method(name = "installationState")]
    async fn installation_state(&self) -> RpcResult<InstallationState>;

    #[method(name = "revocationState")]
    async fn revocation_state(&self) -> RpcResult<RevocationState>;

    #[method(name = "delegatedKeys")]
    async fn delegated_keys(&self) -> RpcResult<Vec<DelegatedKeyData>>;

    #[method(name = "prepareRevocation")]
    async fn prepare_revocation(&self, key_id: String) -> RpcResult<RevocationReview>;

    #[method(name = "deposit")]
    async fn deposit(&self, amount: U256) -> RpcResult<TxResponse>;

    #[method(name = "relayHealth")]
    async fn relay_health(&self) -> RpcResult<bool>;

    /// On-chain permission and call-policy state of one delegated key.
    #[method(name = "keyPolicy")]
    async fn key_policy(&self, key_id: String) -> RpcResult<PolicyState>;
}

pub struct WalletRpcImpl {
    manager: Arc<DelegatedKeyManager>,
}

impl WalletRpcImpl {
    pub fn new(manager: Arc<DelegatedKeyManager>) -> Self {
        Self { manager }
    }
}

fn rpc_error(e: DelegateError) -> ErrorObjectOwned {
    let code = match e {
        DelegateError::InvalidRequest(_) => INVALID_PARAMS_CODE,
        _ => WALLET_ERROR_CODE,
    };
    ErrorObject::owned(code, format!("Wallet error: {}", e), None::<()>)
}

#[async_trait]
impl WalletApiServer for WalletRpcImpl {
    async fn create_delegated_key(&self, request: CreateKeyRequest) -> RpcResult<InstallationReview> {
        debug!("Received key request for device: {}", request.device_name);

        match self.manager.create_delegated_key(request).await {
            Ok(review) => {
                info!("Installation {} ready for review", review.installation_id);
                Ok(review)
            }
            Err(e) => {
                error!("Failed to prepare delegated key: {}", e);
                Err(rpc_error(e))
            }
        }
    }

    async fn confirm_review(&self) -> RpcResult<ReviewOutcome> {
        self.manager.confirm_review().await.map_err(|e| {
            error!("Confirmation failed: {}", e);
            rpc_error(e)
        })
    }

    async fn cancel_review(&self) -> RpcResult<bool> {
        Ok(self.manager.cancel_review())
    }

    async fn get_review(&self) -> RpcResult<Option<ReviewContext>> {
        Ok(self.manager.review().get())
    }

    async fn installation_state(&self) -> RpcResult<InstallationState> {
        Ok(self.manager.installation().get())
    }

    async fn revocation_state(&self) -> RpcResult<RevocationState> {
        Ok(self.manager.revocation().get())
    }

    async fn delegated_keys(&self) -> RpcResult<Vec<DelegatedKeyData>> {
        Ok(self.manager.keys().get())
    }

    async fn prepare_revocation(&self, key_id: String) -> RpcResult<RevocationReview> {
        self.manager.prepare_revocation(&key_id).await.map_err(rpc_error)
    }

    async fn deposit(&self, amount: U256) -> RpcResult<TxResponse> {
        self.manager.deposit(amount).await.map_err(|e| {
            error!("Deposit of {} failed: {}", amount, e);
            rpc_error(e)
        })
    }

    async fn relay_health(&self) -> RpcResult<bool> {
        self.manager.relay_health().await.map_err(rpc_error)
    }

    async fn key_policy(&self, key_id: String) -> RpcResult<PolicyState> {
        self.manager.key_policy(&key_id).await.map_err(rpc_error)
    }
}
