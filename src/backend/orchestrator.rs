// src/backend/orchestrator.rs
use std::sync::Arc;

use ethers::types::{Address, Bytes, H256, U256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::bundler::{dummy_signature, Bundler, GasEstimate, GasFees};
use crate::backend::kernel::{self, PermissionModules};
use crate::backend::progress::ProgressHub;
use crate::error::DelegateError;
use crate::protocol::*;
use crate::types::{KeyType, SignedBlock, UnpackedUserOperation, UnsignedBlock};
use crate::userop::codec::pack_user_operation;
use crate::userop::entrypoint::{with_execute_user_op_prefix, EntryPointReader, KernelInspector};

/// Used when the bundler cannot simulate an operation, which is expected for every block after
/// the first in a bundle: their nonces only become valid once the earlier blocks land.
pub const DEFAULT_GAS: GasEstimate = GasEstimate {
    pre_verification_gas: U256([100_000, 0, 0, 0]),
    verification_gas_limit: U256([500_000, 0, 0, 0]),
    call_gas_limit: U256([500_000, 0, 0, 0]),
};

struct Stage {
    name: &'static str,
    step: &'static str,
    progress: u8,
    message: &'static str,
    block: SignedBlock,
}

/// Relay-side counterpart of the client flows: prepares unsigned blocks and submits signed ones.
pub struct Orchestrator {
    entry_point: Arc<dyn EntryPointReader>,
    kernel: Arc<dyn KernelInspector>,
    bundler: Arc<dyn Bundler>,
    hub: Arc<ProgressHub>,
    modules: PermissionModules,
    default_gas: GasEstimate,
}

impl Orchestrator {
    pub fn new(
        entry_point: Arc<dyn EntryPointReader>,
        kernel: Arc<dyn KernelInspector>,
        bundler: Arc<dyn Bundler>,
        hub: Arc<ProgressHub>,
        modules: PermissionModules,
    ) -> Self {
        Self {
            entry_point,
            kernel,
            bundler,
            hub,
            modules,
            default_gas: DEFAULT_GAS,
        }
    }

    pub fn hub(&self) -> Arc<ProgressHub> {
        self.hub.clone()
    }

    pub async fn prepare_install(
        &self,
        request: &PrepareInstallRequest,
    ) -> Result<InstallPayload, DelegateError> {
        check_bundle_shape(request.key_type, &request.whitelist, &request.token_limits)
            .map_err(|_| {
                DelegateError::InvalidRequest(format!(
                    "{} keys need whitelist and token limits exactly when restricted",
                    request.key_type
                ))
            })?;

        let kernel_address = request.kernel_address;
        let permission_id = kernel::permission_id(kernel_address, request.delegated_address);
        let v_id = kernel::permission_validation_id(permission_id);
        let policy_key = kernel::policy_key(permission_id);

        let mut calls = vec![
            (
                Some(policy_type(request.key_type)),
                kernel::install_permission(
                    v_id,
                    &kernel::permission_enable_data(
                        &self.modules,
                        request.key_type,
                        request.delegated_address,
                    ),
                ),
            ),
            (None, kernel::grant_access(v_id, kernel::execute_selector(), true)),
        ];
        if let (Some(whitelist), Some(limits)) = (&request.whitelist, &request.token_limits) {
            calls.push((
                None,
                kernel::execute(
                    self.modules.call_policy,
                    U256::zero(),
                    &kernel::set_recipient_allowlist(policy_key, whitelist),
                ),
            ));
            calls.push((
                None,
                kernel::execute(
                    self.modules.call_policy,
                    U256::zero(),
                    &kernel::set_token_limits(policy_key, limits),
                ),
            ));
        }

        let mut blocks = self.prepare_blocks(kernel_address, calls).await?.into_iter();
        let mut next = || {
            blocks
                .next()
                .ok_or_else(|| DelegateError::Execution("bundle preparation came up short".to_string()))
        };
        let policy = next()?;
        let grant_access = next()?;
        let (recipients, tokens) = if request.key_type.requires_restrictions() {
            (Some(next()?), Some(next()?))
        } else {
            (None, None)
        };

        info!(
            "Prepared {} installation for {} on {:?}",
            request.key_type, request.device_name, kernel_address
        );
        Ok(InstallPayload {
            permission_id: Bytes::from(permission_id.to_vec()),
            validator_id: Bytes::from(v_id.to_vec()),
            policy,
            grant_access,
            recipients,
            tokens,
        })
    }

    pub async fn prepare_revoke(
        &self,
        request: &PrepareRevokeRequest,
    ) -> Result<RevokePayload, DelegateError> {
        let v_id = <[u8; 21]>::try_from(&request.validator_id[..]).map_err(|_| {
            DelegateError::InvalidRequest(format!(
                "validator id must be 21 bytes, got {}",
                request.validator_id.len()
            ))
        })?;
        let mut blocks = self
            .prepare_blocks(
                request.kernel_address,
                vec![(None, kernel::uninstall_permission(v_id))],
            )
            .await?;
        let revoke = blocks
            .pop()
            .ok_or_else(|| DelegateError::Execution("revoke preparation came up short".to_string()))?;
        let gas_estimate = max_cost(&revoke.unpacked)?;
        info!("Prepared revocation of {} on {:?}", request.key_id, request.kernel_address);
        Ok(RevokePayload {
            revoke,
            gas_estimate,
        })
    }

    /// Kernel's validation config for the permission plus whatever the call policy still holds
    /// under its key. Sudo permissions read back empty lists.
    pub async fn policy_state(
        &self,
        request: &PolicyStateRequest,
    ) -> Result<PolicyState, DelegateError> {
        let permission_id = <[u8; 4]>::try_from(&request.permission_id[..]).map_err(|_| {
            DelegateError::InvalidRequest(format!(
                "permission id must be 4 bytes, got {}",
                request.permission_id.len()
            ))
        })?;
        let v_id = kernel::permission_validation_id(permission_id);
        let (nonce, hook) = self.kernel.validation_config(request.kernel_address, v_id).await?;
        let (whitelist, token_limits) = self
            .kernel
            .call_policy(
                self.modules.call_policy,
                request.kernel_address,
                kernel::policy_key(permission_id),
            )
            .await?;
        debug!(
            "Permission 0x{} on {:?}: hook {:?}, {} recipients, {} token limits",
            hex::encode(permission_id),
            request.kernel_address,
            hook,
            whitelist.len(),
            token_limits.len()
        );
        Ok(PolicyState {
            permission_id: request.permission_id.clone(),
            validator_id: Bytes::from(v_id.to_vec()),
            installed: !hook.is_zero(),
            nonce,
            hook,
            whitelist,
            token_limits,
        })
    }

    pub async fn prepare_deposit(
        &self,
        request: &PrepareDepositRequest,
    ) -> Result<DepositPayload, DelegateError> {
        if request.amount.is_zero() {
            return Err(DelegateError::InvalidRequest("deposit amount must be positive".to_string()));
        }
        let call = kernel::execute(
            self.entry_point.address(),
            request.amount,
            &kernel::deposit_to(request.kernel_address),
        );
        let mut blocks = self
            .prepare_blocks(request.kernel_address, vec![(None, call)])
            .await?;
        let deposit = blocks
            .pop()
            .ok_or_else(|| DelegateError::Execution("deposit preparation came up short".to_string()))?;
        Ok(DepositPayload { deposit })
    }

    /// One EntryPoint nonce read for the whole bundle; block `i` gets `nonce + i`.
    async fn prepare_blocks(
        &self,
        sender: Address,
        calls: Vec<(Option<String>, Bytes)>,
    ) -> Result<Vec<UnsignedBlock>, DelegateError> {
        let prefix = self
            .kernel
            .needs_execute_user_op_prefix(sender, None)
            .await?;
        let nonce = self.entry_point.get_nonce(sender, U256::zero()).await?;
        let fees = self.bundler.gas_fees().await?;

        let mut blocks = Vec::with_capacity(calls.len());
        for (offset, (policy_type, call_data)) in calls.into_iter().enumerate() {
            let call_data = if prefix {
                with_execute_user_op_prefix(&call_data)
            } else {
                call_data
            };
            let block = self
                .prepare_block(sender, nonce + offset, call_data, fees, policy_type)
                .await?;
            blocks.push(block);
        }
        Ok(blocks)
    }

    async fn prepare_block(
        &self,
        sender: Address,
        nonce: U256,
        call_data: Bytes,
        fees: GasFees,
        permission_policy_type: Option<String>,
    ) -> Result<UnsignedBlock, DelegateError> {
        let mut op = UnpackedUserOperation {
            sender,
            nonce,
            call_data,
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            signature: dummy_signature(),
            ..Default::default()
        };

        let gas = match self.bundler.estimate_user_operation_gas(&op).await {
            Ok(gas) => gas,
            Err(e) => {
                debug!("Estimation failed for nonce {}, using defaults: {}", nonce, e);
                self.default_gas
            }
        };
        op.pre_verification_gas = gas.pre_verification_gas;
        op.verification_gas_limit = gas.verification_gas_limit;
        op.call_gas_limit = gas.call_gas_limit;

        if let Some(sponsorship) = self.bundler.sponsor_user_operation(&op).await? {
            sponsorship.apply(&mut op);
        }
        op.signature = Bytes::new();

        let packed = pack_user_operation(&op)?;
        let user_op_hash = self.entry_point.get_user_op_hash(&packed).await?;
        Ok(UnsignedBlock {
            permission_policy_type,
            unpacked: op,
            packed,
            user_op_hash,
        })
    }

    /// Verifies the whole bundle up front, then submits it in the background. Progress goes out
    /// on the hub under the request's client id.
    pub async fn execute_install(
        self: &Arc<Self>,
        request: ExecuteInstallRequest,
    ) -> Result<ExecuteInstallResponse, DelegateError> {
        request.check_complete()?;
        for (name, block) in request.blocks() {
            self.verify(name, block).await?;
        }

        let restricted = request.key_type.requires_restrictions();
        let mut stages = vec![
            Stage {
                name: "policy",
                step: step::INSTALLING,
                progress: 10,
                message: "Installing permission validator",
                block: request.policy,
            },
            Stage {
                name: "grantAccess",
                step: step::GRANTING,
                progress: 50,
                message: "Granting execution rights",
                block: request.grant_access,
            },
        ];
        if let (Some(recipients), Some(tokens)) = (request.recipients, request.tokens) {
            stages.push(Stage {
                name: "recipients",
                step: step::RECIPIENTS,
                progress: 75,
                message: "Setting recipient whitelist",
                block: recipients,
            });
            stages.push(Stage {
                name: "tokens",
                step: step::TOKENS,
                progress: 85,
                message: "Setting token limits",
                block: tokens,
            });
        }

        let installation_id = Uuid::new_v4().to_string();
        info!(
            "Installation {} accepted for {} ({} key, {} blocks)",
            installation_id,
            request.device_id,
            request.key_type,
            stages.len()
        );

        let orchestrator = self.clone();
        let client_id = request.client_id;
        let permission_id = format!("0x{}", hex::encode(&request.permission_id));
        let v_id = format!("0x{}", hex::encode(&request.validator_id));
        tokio::spawn(async move {
            orchestrator
                .run_installation(&client_id, stages, permission_id, v_id)
                .await;
        });

        Ok(ExecuteInstallResponse {
            installation_id,
            message: format!(
                "Installing {} delegated key",
                if restricted { "restricted" } else { "sudo" }
            ),
        })
    }

    async fn run_installation(
        &self,
        client_id: &str,
        stages: Vec<Stage>,
        permission_id: String,
        v_id: String,
    ) {
        let mut last_tx = None;
        for stage in stages {
            self.hub.publish(
                client_id,
                StatusUpdate::new(stage.step, stage.progress, stage.message).with_tx_hash(last_tx),
            );
            match self.submit(&stage.block).await {
                Ok(tx_hash) => last_tx = Some(tx_hash),
                Err(e) => {
                    error!("Installation step {} failed for {}: {}", stage.name, client_id, e);
                    self.hub.publish(
                        client_id,
                        StatusUpdate::failed(format!("Failed at {}", stage.name), e.to_string())
                            .with_tx_hash(last_tx),
                    );
                    return;
                }
            }
        }

        let mut done = StatusUpdate::new(step::COMPLETED, 100, "Delegated key installed")
            .with_tx_hash(last_tx);
        done.permission_id = Some(permission_id);
        done.v_id = Some(v_id);
        info!("Installation for {} completed", client_id);
        self.hub.publish(client_id, done);
    }

    pub async fn execute_revoke(&self, request: ExecuteRevokeRequest) -> Result<TxResponse, DelegateError> {
        self.verify("revoke", &request.revoke).await?;
        if let Some(client_id) = &request.client_id {
            self.hub.publish(
                client_id,
                StatusUpdate::new(step::REVOKING, 50, "Revoking delegated key"),
            );
        }

        match self.submit(&request.revoke).await {
            Ok(tx_hash) => {
                if let Some(client_id) = &request.client_id {
                    self.hub.publish(
                        client_id,
                        StatusUpdate::new(step::COMPLETED, 100, "Delegated key revoked")
                            .with_tx_hash(Some(tx_hash)),
                    );
                }
                info!("Revoked {} in {:?}", request.key_id, tx_hash);
                Ok(TxResponse {
                    tx_hash,
                    message: Some("Delegated key revoked".to_string()),
                })
            }
            Err(e) => {
                if let Some(client_id) = &request.client_id {
                    self.hub
                        .publish(client_id, StatusUpdate::failed("Revocation failed", e.to_string()));
                }
                Err(e)
            }
        }
    }

    pub async fn execute_deposit(&self, request: ExecuteDepositRequest) -> Result<TxResponse, DelegateError> {
        self.verify("deposit", &request.deposit).await?;
        let tx_hash = self.submit(&request.deposit).await?;
        Ok(TxResponse {
            tx_hash,
            message: Some(format!("Deposited for {:?}", request.kernel_address)),
        })
    }

    /// Broadcasts an operation the caller signed elsewhere.
    pub async fn send_user_op(&self, op: &UnpackedUserOperation) -> Result<SendUserOpResponse, DelegateError> {
        if !op.is_signed() {
            return Err(DelegateError::InvalidUserOperation(
                "operation must be signed before broadcast".to_string(),
            ));
        }
        pack_user_operation(op)?;
        let user_op_hash = self.bundler.send_user_operation(op).await?;
        Ok(SendUserOpResponse { user_op_hash })
    }

    /// The relay's own trust gate: the signed operation must still hash to what was prepared.
    async fn verify(&self, name: &str, block: &SignedBlock) -> Result<(), DelegateError> {
        if block.signature.is_empty() || block.unpacked.signature != block.signature {
            return Err(DelegateError::MalformedPayload(format!("{name} block is not signed")));
        }
        let mut unsigned = block.unpacked.clone();
        unsigned.signature = Bytes::new();
        let packed = pack_user_operation(&unsigned)?;
        let computed = self.entry_point.get_user_op_hash(&packed).await?;
        if computed != block.user_op_hash {
            warn!(
                "Signed {} block hashes to {:?}, prepared as {:?}",
                name, computed, block.user_op_hash
            );
            return Err(DelegateError::HashMismatch(name.to_string()));
        }
        Ok(())
    }

    async fn submit(&self, block: &SignedBlock) -> Result<H256, DelegateError> {
        let user_op_hash = self.bundler.send_user_operation(&block.unpacked).await?;
        let receipt = self.bundler.wait_for_receipt(user_op_hash).await?;
        if !receipt.success {
            return Err(DelegateError::Execution(
                receipt
                    .reason
                    .unwrap_or_else(|| format!("user operation {user_op_hash:?} reverted")),
            ));
        }
        Ok(receipt.receipt.transaction_hash)
    }
}

fn policy_type(key_type: KeyType) -> String {
    match key_type {
        KeyType::Restricted => "call".to_string(),
        KeyType::Sudo => "sudo".to_string(),
    }
}

/// Worst case the account pays: every gas limit used in full at the max fee.
pub fn max_cost(op: &UnpackedUserOperation) -> Result<U256, DelegateError> {
    let total_gas = op
        .call_gas_limit
        .checked_add(op.verification_gas_limit)
        .and_then(|sum| sum.checked_add(op.pre_verification_gas))
        .and_then(|sum| sum.checked_add(op.paymaster_verification_gas_limit.unwrap_or_default()))
        .and_then(|sum| sum.checked_add(op.paymaster_post_op_gas_limit.unwrap_or_default()))
        .ok_or_else(|| DelegateError::InvalidUserOperation("Gas limit overflow".to_string()))?;
    total_gas
        .checked_mul(op.max_fee_per_gas)
        .ok_or_else(|| DelegateError::InvalidUserOperation("Max cost calculation overflow".to_string()))
}
