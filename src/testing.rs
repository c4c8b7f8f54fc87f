// src/testing.rs
//! Offline stand-ins for the chain, the relay and the bundler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};

use crate::backend::bundler::{Bundler, GasEstimate, GasFees, ReceiptRef, Sponsorship, UserOpReceipt};
use crate::backend::kernel::PermissionModules;
use crate::backend::orchestrator::Orchestrator;
use crate::backend::progress::ProgressHub;
use crate::client::relay::RelayApi;
use crate::error::DelegateError;
use crate::protocol::*;
use crate::types::{
    KeyRole, KeyType, PackedUserOperation, TokenLimit, UnpackedUserOperation, UnsignedBlock,
};
use crate::userop::codec::{hash_packed_user_operation, pack_user_operation};
use crate::userop::entrypoint::{EntryPointReader, KernelInspector, ENTRY_POINT_V07};
use crate::userop::keystore::MemoryKeyStore;

pub const ROOT_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

pub fn root_keystore() -> Arc<MemoryKeyStore> {
    Arc::new(MemoryKeyStore::from_hex(KeyRole::Root, ROOT_KEY).unwrap())
}

pub fn sample_unpacked(sender: Address) -> UnpackedUserOperation {
    UnpackedUserOperation {
        sender,
        nonce: U256::zero(),
        call_data: Bytes::from(vec![0xca, 0xfe]),
        call_gas_limit: U256::from(100_000),
        verification_gas_limit: U256::from(200_000),
        pre_verification_gas: U256::from(50_000),
        max_fee_per_gas: U256::from(2_000_000_000u64),
        max_priority_fee_per_gas: U256::from(1_000_000_000u64),
        ..Default::default()
    }
}

/// EntryPoint that hashes with the v0.7 formula instead of an `eth_call`.
pub struct LocalEntryPoint {
    pub address: Address,
    pub chain_id: u64,
    hash_calls: AtomicUsize,
    fail: AtomicBool,
    nonces: Mutex<HashMap<Address, U256>>,
}

impl Default for LocalEntryPoint {
    fn default() -> Self {
        Self {
            address: ENTRY_POINT_V07.parse().unwrap(),
            chain_id: 1,
            hash_calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            nonces: Mutex::new(HashMap::new()),
        }
    }
}

impl LocalEntryPoint {
    /// Uncounted, never fails.
    pub fn hash(&self, packed: &PackedUserOperation) -> H256 {
        hash_packed_user_operation(packed, self.address, self.chain_id)
    }

    pub fn hash_calls(&self) -> usize {
        self.hash_calls.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_nonce(&self, sender: Address, nonce: U256) {
        self.nonces.lock().unwrap().insert(sender, nonce);
    }

    fn check(&self) -> Result<(), DelegateError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DelegateError::ChainRead("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntryPointReader for LocalEntryPoint {
    fn address(&self) -> Address {
        self.address
    }

    async fn get_user_op_hash(&self, op: &PackedUserOperation) -> Result<H256, DelegateError> {
        self.hash_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.hash(op))
    }

    async fn get_nonce(&self, sender: Address, _key: U256) -> Result<U256, DelegateError> {
        self.check()?;
        Ok(self
            .nonces
            .lock()
            .unwrap()
            .get(&sender)
            .copied()
            .unwrap_or_default())
    }
}

pub fn unsigned_block(entry_point: &LocalEntryPoint, op: UnpackedUserOperation) -> UnsignedBlock {
    let packed = pack_user_operation(&op).unwrap();
    UnsignedBlock {
        permission_policy_type: None,
        user_op_hash: entry_point.hash(&packed),
        unpacked: op,
        packed,
    }
}

fn block_at(entry_point: &LocalEntryPoint, sender: Address, nonce: u64) -> UnsignedBlock {
    let mut op = sample_unpacked(sender);
    op.nonce = U256::from(nonce);
    op.call_data = Bytes::from(vec![0xca, 0xfe, nonce as u8]);
    unsigned_block(entry_point, op)
}

/// A well-formed bundle with sequential nonces, as a relay would prepare it.
pub fn install_payload(entry_point: &LocalEntryPoint, sender: Address, key_type: KeyType) -> InstallPayload {
    let mut policy = block_at(entry_point, sender, 0);
    policy.permission_policy_type = Some(
        match key_type {
            KeyType::Restricted => "call",
            KeyType::Sudo => "sudo",
        }
        .to_string(),
    );
    let restricted = key_type.requires_restrictions();
    InstallPayload {
        permission_id: Bytes::from(vec![0x01, 0x02, 0x03, 0x04]),
        validator_id: Bytes::from([&[0x02, 0x01, 0x02, 0x03, 0x04][..], &[0u8; 16][..]].concat()),
        policy,
        grant_access: block_at(entry_point, sender, 1),
        recipients: restricted.then(|| block_at(entry_point, sender, 2)),
        tokens: restricted.then(|| block_at(entry_point, sender, 3)),
    }
}

pub fn revoke_payload(entry_point: &LocalEntryPoint, sender: Address) -> RevokePayload {
    RevokePayload {
        revoke: block_at(entry_point, sender, 4),
        gas_estimate: U256::from(700_000_000_000_000u64),
    }
}

pub fn deposit_payload(entry_point: &LocalEntryPoint, sender: Address) -> DepositPayload {
    DepositPayload {
        deposit: block_at(entry_point, sender, 5),
    }
}

/// Relay that hands out canned payloads and records what it was asked to execute.
#[derive(Default)]
pub struct MockRelay {
    install: Mutex<Option<InstallPayload>>,
    revoke: Mutex<Option<RevokePayload>>,
    deposit: Mutex<Option<DepositPayload>>,
    policy: Mutex<Option<PolicyState>>,
    execute_error: Mutex<Option<String>>,
    installs: Mutex<Vec<ExecuteInstallRequest>>,
    revokes: Mutex<Vec<ExecuteRevokeRequest>>,
    deposits: Mutex<Vec<ExecuteDepositRequest>>,
}

impl MockRelay {
    pub const TX_HASH: H256 = H256([0x7a; 32]);

    pub fn set_install(&self, payload: InstallPayload) {
        *self.install.lock().unwrap() = Some(payload);
    }

    pub fn set_revoke(&self, payload: RevokePayload) {
        *self.revoke.lock().unwrap() = Some(payload);
    }

    pub fn set_deposit(&self, payload: DepositPayload) {
        *self.deposit.lock().unwrap() = Some(payload);
    }

    pub fn set_policy(&self, state: PolicyState) {
        *self.policy.lock().unwrap() = Some(state);
    }

    pub fn fail_executions(&self, message: &str) {
        *self.execute_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn executed_installs(&self) -> Vec<ExecuteInstallRequest> {
        self.installs.lock().unwrap().clone()
    }

    pub fn executed_revokes(&self) -> Vec<ExecuteRevokeRequest> {
        self.revokes.lock().unwrap().clone()
    }

    pub fn executed_deposits(&self) -> Vec<ExecuteDepositRequest> {
        self.deposits.lock().unwrap().clone()
    }

    fn prepared<T: Clone>(slot: &Mutex<Option<T>>) -> Result<T, DelegateError> {
        slot.lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DelegateError::Execution("nothing prepared".to_string()))
    }

    fn execution(&self) -> Result<(), DelegateError> {
        match self.execute_error.lock().unwrap().clone() {
            Some(message) => Err(DelegateError::Execution(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RelayApi for MockRelay {
    async fn prepare_install(&self, _request: &PrepareInstallRequest) -> Result<InstallPayload, DelegateError> {
        Self::prepared(&self.install)
    }

    async fn execute_install(
        &self,
        request: &ExecuteInstallRequest,
    ) -> Result<ExecuteInstallResponse, DelegateError> {
        self.execution()?;
        self.installs.lock().unwrap().push(request.clone());
        Ok(ExecuteInstallResponse {
            installation_id: request.client_id.clone(),
            message: "Installing".to_string(),
        })
    }

    async fn prepare_revoke(&self, _request: &PrepareRevokeRequest) -> Result<RevokePayload, DelegateError> {
        Self::prepared(&self.revoke)
    }

    async fn execute_revoke(&self, request: &ExecuteRevokeRequest) -> Result<TxResponse, DelegateError> {
        self.execution()?;
        self.revokes.lock().unwrap().push(request.clone());
        Ok(TxResponse {
            tx_hash: Self::TX_HASH,
            message: None,
        })
    }

    async fn prepare_deposit(&self, _request: &PrepareDepositRequest) -> Result<DepositPayload, DelegateError> {
        Self::prepared(&self.deposit)
    }

    async fn execute_deposit(&self, request: &ExecuteDepositRequest) -> Result<TxResponse, DelegateError> {
        self.execution()?;
        self.deposits.lock().unwrap().push(request.clone());
        Ok(TxResponse {
            tx_hash: Self::TX_HASH,
            message: None,
        })
    }

    async fn send_user_op(&self, _op: &UnpackedUserOperation) -> Result<SendUserOpResponse, DelegateError> {
        Ok(SendUserOpResponse {
            user_op_hash: Self::TX_HASH,
        })
    }

    async fn health(&self) -> Result<bool, DelegateError> {
        Ok(true)
    }

    async fn policy_state(&self, _request: &PolicyStateRequest) -> Result<PolicyState, DelegateError> {
        Self::prepared(&self.policy)
    }
}

#[derive(Default)]
struct BundlerState {
    sent: Vec<UnpackedUserOperation>,
    revert_from: Option<usize>,
}

/// Bundler that mines everything instantly, optionally reverting from the n-th operation on.
#[derive(Clone, Default)]
pub struct MockBundler {
    state: Arc<Mutex<BundlerState>>,
}

impl MockBundler {
    const HASH_BASE: u64 = 1_000;

    pub fn sent(&self) -> Vec<UnpackedUserOperation> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn revert_from(&self, index: usize) {
        self.state.lock().unwrap().revert_from = Some(index);
    }
}

#[async_trait]
impl Bundler for MockBundler {
    async fn estimate_user_operation_gas(
        &self,
        _op: &UnpackedUserOperation,
    ) -> Result<GasEstimate, DelegateError> {
        Ok(GasEstimate {
            pre_verification_gas: U256::from(60_000),
            verification_gas_limit: U256::from(150_000),
            call_gas_limit: U256::from(250_000),
        })
    }

    async fn gas_fees(&self) -> Result<GasFees, DelegateError> {
        Ok(GasFees {
            max_fee_per_gas: U256::from(3_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
        })
    }

    async fn sponsor_user_operation(
        &self,
        _op: &UnpackedUserOperation,
    ) -> Result<Option<Sponsorship>, DelegateError> {
        Ok(None)
    }

    async fn send_user_operation(&self, op: &UnpackedUserOperation) -> Result<H256, DelegateError> {
        let mut state = self.state.lock().unwrap();
        state.sent.push(op.clone());
        Ok(H256::from_low_u64_be(Self::HASH_BASE + state.sent.len() as u64 - 1))
    }

    async fn wait_for_receipt(&self, user_op_hash: H256) -> Result<UserOpReceipt, DelegateError> {
        let index = (user_op_hash.to_low_u64_be() - Self::HASH_BASE) as usize;
        let reverted = self
            .state
            .lock()
            .unwrap()
            .revert_from
            .is_some_and(|from| index >= from);
        Ok(UserOpReceipt {
            user_op_hash,
            success: !reverted,
            reason: reverted.then(|| "AA23 reverted".to_string()),
            receipt: ReceiptRef {
                transaction_hash: H256::from_low_u64_be(index as u64 + 1),
            },
        })
    }
}

/// Kernel with fixed hook behavior and a table of installed permissions.
#[derive(Default)]
pub struct MockKernel {
    pub hooked: bool,
    pub validators: HashMap<[u8; 21], (u32, Address)>,
    pub policies: HashMap<[u8; 32], (Vec<Address>, Vec<TokenLimit>)>,
}

#[async_trait]
impl KernelInspector for MockKernel {
    async fn needs_execute_user_op_prefix(
        &self,
        _kernel: Address,
        _v_id: Option<[u8; 21]>,
    ) -> Result<bool, DelegateError> {
        Ok(self.hooked)
    }

    async fn validation_config(
        &self,
        _kernel: Address,
        v_id: [u8; 21],
    ) -> Result<(u32, Address), DelegateError> {
        Ok(self.validators.get(&v_id).copied().unwrap_or_default())
    }

    async fn call_policy(
        &self,
        _policy: Address,
        _kernel: Address,
        key: [u8; 32],
    ) -> Result<(Vec<Address>, Vec<TokenLimit>), DelegateError> {
        Ok(self.policies.get(&key).cloned().unwrap_or_default())
    }
}

pub fn modules() -> PermissionModules {
    PermissionModules {
        ecdsa_signer: Address::repeat_byte(0xe1),
        sudo_policy: Address::repeat_byte(0x5d),
        call_policy: Address::repeat_byte(0xc0),
    }
}

pub fn orchestrator(entry_point: Arc<LocalEntryPoint>, bundler: MockBundler, hooked: bool) -> Orchestrator {
    orchestrator_with_kernel(
        entry_point,
        bundler,
        MockKernel {
            hooked,
            ..Default::default()
        },
    )
}

pub fn orchestrator_with_kernel(
    entry_point: Arc<LocalEntryPoint>,
    bundler: MockBundler,
    kernel: MockKernel,
) -> Orchestrator {
    Orchestrator::new(
        entry_point,
        Arc::new(kernel),
        Arc::new(bundler),
        Arc::new(ProgressHub::new()),
        modules(),
    )
}
