// src/client/relay.rs
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::DelegateError;
use crate::protocol::*;
use crate::types::UnpackedUserOperation;

/// The relay's prepare/execute API as seen from the client.
#[async_trait]
pub trait RelayApi: Send + Sync {
    async fn prepare_install(&self, request: &PrepareInstallRequest) -> Result<InstallPayload, DelegateError>;

    async fn execute_install(
        &self,
        request: &ExecuteInstallRequest,
    ) -> Result<ExecuteInstallResponse, DelegateError>;

    async fn prepare_revoke(&self, request: &PrepareRevokeRequest) -> Result<RevokePayload, DelegateError>;

    async fn execute_revoke(&self, request: &ExecuteRevokeRequest) -> Result<TxResponse, DelegateError>;

    async fn prepare_deposit(&self, request: &PrepareDepositRequest) -> Result<DepositPayload, DelegateError>;

    async fn execute_deposit(&self, request: &ExecuteDepositRequest) -> Result<TxResponse, DelegateError>;

    async fn send_user_op(&self, op: &UnpackedUserOperation) -> Result<SendUserOpResponse, DelegateError>;

    async fn health(&self) -> Result<bool, DelegateError>;

    async fn policy_state(&self, request: &PolicyStateRequest) -> Result<PolicyState, DelegateError>;
}

pub struct HttpRelay {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRelay {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DelegateError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DelegateError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, DelegateError> {
        debug!("POST {}{}", self.base_url, path);
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| DelegateError::Transport(format!("{path}: {e}")))?;
        Self::parse(path, response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, DelegateError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| DelegateError::Transport(format!("{path}: {e}")))?;
        Self::parse(path, response).await
    }

    /// Strict envelope parse: a body that does not match the schema is never coerced.
    async fn parse<T: DeserializeOwned>(
        path: &str,
        response: reqwest::Response,
    ) -> Result<T, DelegateError> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| DelegateError::Transport(format!("{path}: {e}")))?;

        match serde_json::from_slice::<RelayResponse<T>>(&body) {
            Ok(envelope) => envelope.into_result(path),
            Err(_) if !status.is_success() => {
                error!("Relay {} answered {}", path, status);
                Err(DelegateError::Execution(format!("{path} returned HTTP {status}")))
            }
            Err(e) => Err(DelegateError::MalformedPayload(format!("{path}: {e}"))),
        }
    }
}

#[async_trait]
impl RelayApi for HttpRelay {
    async fn prepare_install(&self, request: &PrepareInstallRequest) -> Result<InstallPayload, DelegateError> {
        self.post(PREPARE_INSTALL, request).await
    }

    async fn execute_install(
        &self,
        request: &ExecuteInstallRequest,
    ) -> Result<ExecuteInstallResponse, DelegateError> {
        self.post(EXECUTE_INSTALL, request).await
    }

    async fn prepare_revoke(&self, request: &PrepareRevokeRequest) -> Result<RevokePayload, DelegateError> {
        self.post(PREPARE_REVOKE, request).await
    }

    async fn execute_revoke(&self, request: &ExecuteRevokeRequest) -> Result<TxResponse, DelegateError> {
        self.post(EXECUTE_REVOKE, request).await
    }

    async fn prepare_deposit(&self, request: &PrepareDepositRequest) -> Result<DepositPayload, DelegateError> {
        self.post(PREPARE_DEPOSIT, request).await
    }

    async fn execute_deposit(&self, request: &ExecuteDepositRequest) -> Result<TxResponse, DelegateError> {
        self.post(EXECUTE_DEPOSIT, request).await
    }

    async fn send_user_op(&self, op: &UnpackedUserOperation) -> Result<SendUserOpResponse, DelegateError> {
        self.post(SEND_USER_OP, &SendUserOpRequest { user_op: op.clone() })
            .await
    }

    async fn health(&self) -> Result<bool, DelegateError> {
        let health: HealthResponse = self.get(HEALTH).await?;
        Ok(health.status == "ok")
    }

    async fn policy_state(&self, request: &PolicyStateRequest) -> Result<PolicyState, DelegateError> {
        self.post(CALL_POLICY_STATE, request).await
    }
}
