// src/backend/handlers.rs
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::backend::orchestrator::Orchestrator;
use crate::client::relay::RelayApi;
use crate::error::DelegateError;
use crate::protocol::*;
use crate::types::UnpackedUserOperation;

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResponse {
    pub status: u16,
    pub body: Value,
}

impl HandlerResponse {
    pub fn ok<T: Serialize>(data: T) -> Self {
        match serde_json::to_value(RelayResponse::ok(data)) {
            Ok(body) => Self { status: 200, body },
            Err(e) => Self::error(&DelegateError::MalformedPayload(e.to_string())),
        }
    }

    pub fn error(error: &DelegateError) -> Self {
        let status = status_for(error);
        if status >= 500 {
            error!("Request failed: {}", error);
        }
        Self {
            status,
            body: json!({ "success": false, "error": error.to_string() }),
        }
    }

    fn not_found(path: &str) -> Self {
        Self {
            status: 404,
            body: json!({ "success": false, "error": format!("no route for {path}") }),
        }
    }
}

pub fn status_for(error: &DelegateError) -> u16 {
    match error {
        DelegateError::InvalidRequest(_)
        | DelegateError::InvalidUserOperation(_)
        | DelegateError::MalformedPayload(_)
        | DelegateError::HashMismatch(_) => 400,
        DelegateError::InstallationInProgress => 409,
        DelegateError::Execution(_) => 422,
        DelegateError::ChainRead(_) | DelegateError::Transport(_) => 502,
        _ => 500,
    }
}

fn parse<T: DeserializeOwned>(body: Value) -> Result<T, DelegateError> {
    serde_json::from_value(body).map_err(|e| DelegateError::InvalidRequest(e.to_string()))
}

fn respond<T: Serialize>(result: Result<T, DelegateError>) -> HandlerResponse {
    match result {
        Ok(data) => HandlerResponse::ok(data),
        Err(e) => HandlerResponse::error(&e),
    }
}

pub fn health() -> HandlerResponse {
    HandlerResponse::ok(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Dispatches one relay request to the orchestrator.
pub async fn route(
    orchestrator: &Arc<Orchestrator>,
    method: &str,
    path: &str,
    body: Value,
) -> HandlerResponse {
    debug!("{} {}", method, path);
    match (method, path) {
        ("GET", HEALTH) => health(),
        ("POST", PREPARE_INSTALL) => match parse::<PrepareInstallRequest>(body) {
            Ok(request) => respond(orchestrator.prepare_install(&request).await),
            Err(e) => HandlerResponse::error(&e),
        },
        ("POST", EXECUTE_INSTALL) => match parse::<ExecuteInstallRequest>(body) {
            Ok(request) => respond(orchestrator.execute_install(request).await),
            Err(e) => HandlerResponse::error(&e),
        },
        ("POST", PREPARE_REVOKE) => match parse::<PrepareRevokeRequest>(body) {
            Ok(request) => respond(orchestrator.prepare_revoke(&request).await),
            Err(e) => HandlerResponse::error(&e),
        },
        ("POST", EXECUTE_REVOKE) => match parse::<ExecuteRevokeRequest>(body) {
            Ok(request) => respond(orchestrator.execute_revoke(request).await),
            Err(e) => HandlerResponse::error(&e),
        },
        ("POST", PREPARE_DEPOSIT) => match parse::<PrepareDepositRequest>(body) {
            Ok(request) => respond(orchestrator.prepare_deposit(&request).await),
            Err(e) => HandlerResponse::error(&e),
        },
        ("POST", EXECUTE_DEPOSIT) => match parse::<ExecuteDepositRequest>(body) {
            Ok(request) => respond(orchestrator.execute_deposit(request).await),
            Err(e) => HandlerResponse::error(&e),
        },
        ("POST", SEND_USER_OP) => match parse::<SendUserOpRequest>(body) {
            Ok(request) => respond(orchestrator.send_user_op(&request.user_op).await),
            Err(e) => HandlerResponse::error(&e),
        },
        ("POST", CALL_POLICY_STATE) => match parse::<PolicyStateRequest>(body) {
            Ok(request) => respond(orchestrator.policy_state(&request).await),
            Err(e) => HandlerResponse::error(&e),
        },
        _ => HandlerResponse::not_found(path),
    }
}

/// Relay running in-process, reached through the same handlers and envelope as over HTTP.
pub struct LocalRelay {
    orchestrator: Arc<Orchestrator>,
}

impl LocalRelay {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn call<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        body: &B,
    ) -> Result<T, DelegateError> {
        let body = serde_json::to_value(body)
            .map_err(|e| DelegateError::InvalidRequest(format!("{path}: {e}")))?;
        let response = route(&self.orchestrator, method, path, body).await;
        match serde_json::from_value::<RelayResponse<T>>(response.body) {
            Ok(envelope) => envelope.into_result(path),
            Err(e) => Err(DelegateError::MalformedPayload(format!("{path}: {e}"))),
        }
    }
}

#[async_trait]
impl RelayApi for LocalRelay {
    async fn prepare_install(&self, request: &PrepareInstallRequest) -> Result<InstallPayload, DelegateError> {
        self.call("POST", PREPARE_INSTALL, request).await
    }

    async fn execute_install(
        &self,
        request: &ExecuteInstallRequest,
    ) -> Result<ExecuteInstallResponse, DelegateError> {
        self.call("POST", EXECUTE_INSTALL, request).await
    }

    async fn prepare_revoke(&self, request: &PrepareRevokeRequest) -> Result<RevokePayload, DelegateError> {
        self.call("POST", PREPARE_REVOKE, request).await
    }

    async fn execute_revoke(&self, request: &ExecuteRevokeRequest) -> Result<TxResponse, DelegateError> {
        self.call("POST", EXECUTE_REVOKE, request).await
    }

    async fn prepare_deposit(&self, request: &PrepareDepositRequest) -> Result<DepositPayload, DelegateError> {
        self.call("POST", PREPARE_DEPOSIT, request).await
    }

    async fn execute_deposit(&self, request: &ExecuteDepositRequest) -> Result<TxResponse, DelegateError> {
        self.call("POST", EXECUTE_DEPOSIT, request).await
    }

    async fn send_user_op(&self, op: &UnpackedUserOperation) -> Result<SendUserOpResponse, DelegateError> {
        self.call("POST", SEND_USER_OP, &SendUserOpRequest { user_op: op.clone() })
            .await
    }

    async fn health(&self) -> Result<bool, DelegateError> {
        let health: HealthResponse = self.call("GET", HEALTH, &Value::Null).await?;
        Ok(health.status == "ok")
    }

    async fn policy_state(&self, request: &PolicyStateRequest) -> Result<PolicyState, DelegateError> {
        self.call("POST", CALL_POLICY_STATE, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::installation::InstallStatus;
    use crate::client::manager::{CreateKeyRequest, DelegatedKeyManager, ManagerConfig};
    use crate::client::watch::SoftwareWatch;
    use crate::backend::kernel::{permission_validation_id, policy_key};
    use crate::testing::{
        orchestrator, orchestrator_with_kernel, root_keystore, LocalEntryPoint, MockBundler,
        MockKernel,
    };
    use crate::types::{KeyType, TokenLimit};
    use ethers::types::Bytes;
    use crate::userop::UserOpSigner;
    use ethers::types::{Address, U256};
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn error_statuses() {
        assert_eq!(status_for(&DelegateError::HashMismatch("policy".into())), 400);
        assert_eq!(status_for(&DelegateError::Execution("reverted".into())), 422);
        assert_eq!(status_for(&DelegateError::ChainRead("timeout".into())), 502);
        assert_eq!(status_for(&DelegateError::NothingToReview), 500);
    }

    #[tokio::test]
    async fn unknown_route_and_bad_body() {
        let orchestrator = Arc::new(orchestrator(
            Arc::new(LocalEntryPoint::default()),
            MockBundler::default(),
            false,
        ));
        assert_eq!(route(&orchestrator, "GET", "/nope", Value::Null).await.status, 404);

        let response = route(&orchestrator, "POST", PREPARE_INSTALL, json!({"keyType": "sudo"})).await;
        assert_eq!(response.status, 400);
        assert_eq!(response.body["success"], false);

        let health = route(&orchestrator, "GET", HEALTH, Value::Null).await;
        assert_eq!(health.body["data"]["status"], "ok");
        assert!(LocalRelay::new(orchestrator).health().await.unwrap());
    }

    #[tokio::test]
    async fn call_policy_state_route_reads_the_chain() {
        let permission_id = [0x0a, 0x0b, 0x0c, 0x0d];
        let limit = TokenLimit {
            token: Address::repeat_byte(0x66),
            max_per_transaction: U256::from(10),
            max_per_day: U256::from(100),
        };
        let mut kernel = MockKernel::default();
        kernel.validators.insert(
            permission_validation_id(permission_id),
            (3, Address::from_low_u64_be(1)),
        );
        kernel.policies.insert(
            policy_key(permission_id),
            (vec![Address::repeat_byte(0x55)], vec![limit.clone()]),
        );
        let orchestrator = Arc::new(orchestrator_with_kernel(
            Arc::new(LocalEntryPoint::default()),
            MockBundler::default(),
            kernel,
        ));

        let response = route(
            &orchestrator,
            "POST",
            CALL_POLICY_STATE,
            json!({
                "kernelAddress": Address::repeat_byte(0x11),
                "permissionId": "0x0a0b0c0d",
            }),
        )
        .await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["data"]["installed"], true);
        assert_eq!(response.body["data"]["nonce"], 3);

        let state = LocalRelay::new(orchestrator.clone())
            .policy_state(&PolicyStateRequest {
                kernel_address: Address::repeat_byte(0x11),
                permission_id: Bytes::from(permission_id.to_vec()),
            })
            .await
            .unwrap();
        assert_eq!(state.validator_id, Bytes::from(permission_validation_id(permission_id).to_vec()));
        assert_eq!(state.whitelist, vec![Address::repeat_byte(0x55)]);
        assert_eq!(state.token_limits, vec![limit]);

        let unknown = route(
            &orchestrator,
            "POST",
            CALL_POLICY_STATE,
            json!({
                "kernelAddress": Address::repeat_byte(0x11),
                "permissionId": "0x01020304",
            }),
        )
        .await;
        assert_eq!(unknown.body["data"]["installed"], false);
        assert_eq!(unknown.body["data"]["whitelist"], json!([]));

        let short = route(
            &orchestrator,
            "POST",
            CALL_POLICY_STATE,
            json!({
                "kernelAddress": Address::repeat_byte(0x11),
                "permissionId": "0x0a0b",
            }),
        )
        .await;
        assert_eq!(short.status, 400);
    }

    #[tokio::test]
    async fn client_and_relay_complete_a_restricted_install() {
        let entry_point = Arc::new(LocalEntryPoint::default());
        let bundler = MockBundler::default();
        let orchestrator = Arc::new(orchestrator(entry_point.clone(), bundler.clone(), false));
        let hub = orchestrator.hub();
        let manager = Arc::new(DelegatedKeyManager::new(
            ManagerConfig {
                kernel_address: Address::repeat_byte(0x11),
                owner: Address::repeat_byte(0x12),
                channel: None,
            },
            Arc::new(LocalRelay::new(orchestrator)),
            UserOpSigner::new(entry_point, root_keystore()),
            Arc::new(SoftwareWatch::new()),
        ));
        let review = manager
            .create_delegated_key(CreateKeyRequest {
                device_id: "watch-1".to_string(),
                device_name: "Wrist".to_string(),
                key_type: KeyType::Restricted,
                whitelist: Some(vec![Address::repeat_byte(0x55)]),
                token_limits: Some(vec![TokenLimit {
                    token: Address::repeat_byte(0x66),
                    max_per_transaction: U256::from(10),
                    max_per_day: U256::from(100),
                }]),
            })
            .await
            .unwrap();
        manager.confirm_review().await.unwrap();

        let (backlog, mut live) = hub.register(&review.installation_id);
        for update in backlog {
            manager.apply_progress(&update);
        }
        while manager.installation().get().is_active() {
            let update = timeout(Duration::from_secs(5), live.recv())
                .await
                .expect("timed out waiting for progress")
                .unwrap();
            manager.apply_progress(&update);
        }

        assert!(matches!(
            manager.installation().get().status,
            InstallStatus::Completed { .. }
        ));
        assert_eq!(manager.keys().get().len(), 1);
        assert_eq!(bundler.sent().len(), 4);
    }
}
