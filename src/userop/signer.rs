// src/userop/signer.rs
use std::sync::Arc;

use ethers::types::{Bytes, H256};
use tracing::{debug, info, warn};

use crate::error::DelegateError;
use crate::types::{KeyRole, PackedUserOperation, SignResult, UnpackedUserOperation, UnsignedBlock};
use crate::userop::codec::pack_user_operation;
use crate::userop::entrypoint::EntryPointReader;
use crate::userop::keystore::KeyStore;

/// Verifies relay-prepared operations against the EntryPoint and signs them.
///
/// The relay may propose a hash, but nothing is signed until the hash has been recomputed
/// independently from the packed operation.
#[derive(Clone)]
pub struct UserOpSigner {
    entry_point: Arc<dyn EntryPointReader>,
    keystore: Arc<dyn KeyStore>,
    role: KeyRole,
}

impl UserOpSigner {
    pub fn new(entry_point: Arc<dyn EntryPointReader>, keystore: Arc<dyn KeyStore>) -> Self {
        Self {
            entry_point,
            keystore,
            role: KeyRole::Root,
        }
    }

    pub fn with_role(mut self, role: KeyRole) -> Self {
        self.role = role;
        self
    }

    pub fn role(&self) -> KeyRole {
        self.role
    }

    pub async fn compute_user_op_hash(&self, packed: &PackedUserOperation) -> Result<H256, DelegateError> {
        self.entry_point.get_user_op_hash(packed).await
    }

    /// `Ok(false)` on any mismatch; chain read failures are surfaced, not folded into `false`.
    pub async fn validate_user_operation(
        &self,
        packed: &PackedUserOperation,
        claimed: H256,
    ) -> Result<bool, DelegateError> {
        let computed = self.compute_user_op_hash(packed).await?;
        if computed != claimed {
            warn!(
                "UserOp hash mismatch for {}: relay claimed {:?}, EntryPoint computed {:?}",
                packed.sender, claimed, computed
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Signs the raw digest (no EIP-191 prefix) and attaches the signature to both encodings.
    pub async fn sign_user_operation(
        &self,
        packed: &PackedUserOperation,
        unpacked: &UnpackedUserOperation,
        hash: H256,
    ) -> Result<SignResult, DelegateError> {
        if unpacked.is_signed() || !packed.signature.is_empty() {
            return Err(DelegateError::InvalidUserOperation(
                "operation already carries a signature".to_string(),
            ));
        }

        let wallet = self
            .keystore
            .load_private_key(self.role)
            .await?
            .ok_or(DelegateError::KeyNotFound(self.role))?;

        let signature = wallet
            .sign_hash(hash)
            .map_err(|e| DelegateError::Signing(e.to_string()))?;
        let signature = Bytes::from(signature.to_vec());

        debug!("Signed UserOp {:?} with {} key", hash, self.role);

        let mut unpacked = unpacked.clone();
        unpacked.signature = signature.clone();
        let mut packed = packed.clone();
        packed.signature = signature.clone();

        Ok(SignResult {
            unpacked,
            packed,
            signature,
        })
    }

    /// `Ok(None)` means the hash did not verify: the caller must abort, not retry.
    pub async fn validate_and_sign(
        &self,
        packed: &PackedUserOperation,
        unpacked: &UnpackedUserOperation,
        hash: H256,
    ) -> Result<Option<SignResult>, DelegateError> {
        if !self.validate_user_operation(packed, hash).await? {
            return Ok(None);
        }
        self.sign_user_operation(packed, unpacked, hash).await.map(Some)
    }

    /// Checks that the operation shown to the user is the one being hashed, then validates and
    /// signs it.
    pub async fn process_unsigned_block(
        &self,
        block: &UnsignedBlock,
        name: &str,
    ) -> Result<Option<SignResult>, DelegateError> {
        let repacked = pack_user_operation(&block.unpacked)
            .map_err(|e| DelegateError::MalformedPayload(format!("{name}: {e}")))?;
        if repacked != block.packed {
            return Err(DelegateError::MalformedPayload(format!(
                "{name}: packed operation does not match its unpacked form"
            )));
        }

        let result = self
            .validate_and_sign(&block.packed, &block.unpacked, block.user_op_hash)
            .await?;
        match &result {
            Some(_) => info!("Signed {} block {:?}", name, block.user_op_hash),
            None => warn!("Refusing to sign {} block: hash did not verify", name),
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{root_keystore, sample_unpacked, unsigned_block, LocalEntryPoint, ROOT_KEY};
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::{Address, Signature, U256};

    fn signer(entry_point: Arc<LocalEntryPoint>) -> UserOpSigner {
        UserOpSigner::new(entry_point, root_keystore())
    }

    #[tokio::test]
    async fn matching_hash_is_signed_by_the_root_key() {
        let entry_point = Arc::new(LocalEntryPoint::default());
        let block = unsigned_block(&entry_point, sample_unpacked(Address::repeat_byte(0x11)));

        let result = signer(entry_point)
            .validate_and_sign(&block.packed, &block.unpacked, block.user_op_hash)
            .await
            .unwrap()
            .expect("hash should verify");

        let signature = Signature::try_from(&result.signature[..]).unwrap();
        let root: LocalWallet = ROOT_KEY.parse().unwrap();
        assert_eq!(signature.recover(block.user_op_hash).unwrap(), root.address());
        assert_eq!(result.unpacked.signature, result.signature);
        assert_eq!(result.packed.signature, result.signature);
    }

    #[tokio::test]
    async fn tampered_hash_is_refused() {
        let entry_point = Arc::new(LocalEntryPoint::default());
        let mut block = unsigned_block(&entry_point, sample_unpacked(Address::repeat_byte(0x11)));
        block.user_op_hash = H256::repeat_byte(0xaa);

        let result = signer(entry_point.clone())
            .process_unsigned_block(&block, "policy")
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(entry_point.hash_calls(), 1);
    }

    #[tokio::test]
    async fn missing_key_is_reported() {
        let entry_point = Arc::new(LocalEntryPoint::default());
        let block = unsigned_block(&entry_point, sample_unpacked(Address::repeat_byte(0x11)));
        let signer = UserOpSigner::new(entry_point, root_keystore()).with_role(KeyRole::Delegated);

        let err = signer
            .validate_and_sign(&block.packed, &block.unpacked, block.user_op_hash)
            .await
            .unwrap_err();
        assert!(matches!(err, DelegateError::KeyNotFound(KeyRole::Delegated)));
    }

    #[tokio::test]
    async fn signed_operation_is_not_signed_again() {
        let entry_point = Arc::new(LocalEntryPoint::default());
        let mut block = unsigned_block(&entry_point, sample_unpacked(Address::repeat_byte(0x11)));
        block.unpacked.signature = Bytes::from(vec![1; 65]);

        let err = signer(entry_point)
            .sign_user_operation(&block.packed, &block.unpacked, block.user_op_hash)
            .await
            .unwrap_err();
        assert!(matches!(err, DelegateError::InvalidUserOperation(_)));
    }

    #[tokio::test]
    async fn displayed_operation_must_match_packed() {
        let entry_point = Arc::new(LocalEntryPoint::default());
        let mut block = unsigned_block(&entry_point, sample_unpacked(Address::repeat_byte(0x11)));
        block.unpacked.call_gas_limit += U256::from(1);

        let err = signer(entry_point.clone())
            .process_unsigned_block(&block, "grantAccess")
            .await
            .unwrap_err();
        assert!(matches!(err, DelegateError::MalformedPayload(msg) if msg.contains("grantAccess")));
        assert_eq!(entry_point.hash_calls(), 0);
    }

    #[tokio::test]
    async fn chain_read_failure_is_not_a_refusal() {
        let entry_point = Arc::new(LocalEntryPoint::default());
        let block = unsigned_block(&entry_point, sample_unpacked(Address::repeat_byte(0x11)));
        entry_point.fail_reads(true);

        let err = signer(entry_point)
            .validate_and_sign(&block.packed, &block.unpacked, block.user_op_hash)
            .await
            .unwrap_err();
        assert!(matches!(err, DelegateError::ChainRead(_)));
    }
}
