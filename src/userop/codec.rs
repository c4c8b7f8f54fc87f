// src/userop/codec.rs
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

use crate::error::DelegateError;
use crate::types::{PackedUserOperation, UnpackedUserOperation};

const HALF_WORD: usize = 16;
const ADDRESS_LEN: usize = 20;
const PAYMASTER_FIXED_LEN: usize = ADDRESS_LEN + 2 * HALF_WORD;

/// `verificationGasLimit | callGasLimit`, each left-padded to 16 bytes.
pub fn pack_gas_limits(
    verification_gas_limit: U256,
    call_gas_limit: U256,
) -> Result<H256, DelegateError> {
    concat_u128(verification_gas_limit, call_gas_limit, "accountGasLimits")
}

/// `maxPriorityFeePerGas | maxFeePerGas`, each left-padded to 16 bytes.
pub fn pack_gas_fees(
    max_priority_fee_per_gas: U256,
    max_fee_per_gas: U256,
) -> Result<H256, DelegateError> {
    concat_u128(max_priority_fee_per_gas, max_fee_per_gas, "gasFees")
}

/// Splits a packed word back into its (high, low) 128-bit halves.
pub fn unpack_u128_pair(word: H256) -> (U256, U256) {
    let bytes = word.as_bytes();
    (
        U256::from_big_endian(&bytes[..HALF_WORD]),
        U256::from_big_endian(&bytes[HALF_WORD..]),
    )
}

/// Single-call execution payload for the account's `execute`: target (20) | value (32) | data.
pub fn encode_single_call(target: Address, value: U256, data: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(ADDRESS_LEN + 32 + data.len());
    out.extend_from_slice(target.as_bytes());
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    out.extend_from_slice(&word);
    out.extend_from_slice(data);
    Bytes::from(out)
}

pub fn pack_user_operation(op: &UnpackedUserOperation) -> Result<PackedUserOperation, DelegateError> {
    let init_code = match op.factory {
        Some(factory) => {
            let mut code = factory.as_bytes().to_vec();
            if let Some(data) = &op.factory_data {
                code.extend_from_slice(data);
            }
            Bytes::from(code)
        }
        None => Bytes::new(),
    };

    let paymaster_and_data = match op.paymaster {
        Some(paymaster) => {
            let mut data = paymaster.as_bytes().to_vec();
            for (limit, name) in [
                (op.paymaster_verification_gas_limit, "paymasterVerificationGasLimit"),
                (op.paymaster_post_op_gas_limit, "paymasterPostOpGasLimit"),
            ] {
                data.extend_from_slice(&u128_bytes(limit.unwrap_or_default(), name)?);
            }
            if let Some(extra) = &op.paymaster_data {
                data.extend_from_slice(extra);
            }
            Bytes::from(data)
        }
        None => Bytes::new(),
    };

    Ok(PackedUserOperation {
        sender: op.sender,
        nonce: op.nonce,
        init_code,
        call_data: op.call_data.clone(),
        account_gas_limits: pack_gas_limits(op.verification_gas_limit, op.call_gas_limit)?,
        pre_verification_gas: op.pre_verification_gas,
        gas_fees: pack_gas_fees(op.max_priority_fee_per_gas, op.max_fee_per_gas)?,
        paymaster_and_data,
        signature: op.signature.clone(),
    })
}

/// Inverse of [`pack_user_operation`]. Empty factory or paymaster data and zero paymaster gas
/// limits pack the same as absent ones, so they come back as `None`.
pub fn unpack_user_operation(
    packed: &PackedUserOperation,
) -> Result<UnpackedUserOperation, DelegateError> {
    let (factory, factory_data) = match packed.init_code.len() {
        0 => (None, None),
        n if n < ADDRESS_LEN => {
            return Err(DelegateError::MalformedPayload(format!(
                "initCode of {n} bytes is shorter than a factory address"
            )))
        }
        _ => (
            Some(Address::from_slice(&packed.init_code[..ADDRESS_LEN])),
            non_empty(&packed.init_code[ADDRESS_LEN..]),
        ),
    };

    let pmd = &packed.paymaster_and_data;
    let (paymaster, pm_verification, pm_post_op, paymaster_data) = match pmd.len() {
        0 => (None, None, None, None),
        n if n < PAYMASTER_FIXED_LEN => {
            return Err(DelegateError::MalformedPayload(format!(
                "paymasterAndData of {n} bytes is shorter than {PAYMASTER_FIXED_LEN}"
            )))
        }
        _ => (
            Some(Address::from_slice(&pmd[..ADDRESS_LEN])),
            non_zero(&pmd[ADDRESS_LEN..ADDRESS_LEN + HALF_WORD]),
            non_zero(&pmd[ADDRESS_LEN + HALF_WORD..PAYMASTER_FIXED_LEN]),
            non_empty(&pmd[PAYMASTER_FIXED_LEN..]),
        ),
    };

    let (verification_gas_limit, call_gas_limit) = unpack_u128_pair(packed.account_gas_limits);
    let (max_priority_fee_per_gas, max_fee_per_gas) = unpack_u128_pair(packed.gas_fees);

    Ok(UnpackedUserOperation {
        sender: packed.sender,
        nonce: packed.nonce,
        factory,
        factory_data,
        call_data: packed.call_data.clone(),
        call_gas_limit,
        verification_gas_limit,
        pre_verification_gas: packed.pre_verification_gas,
        max_fee_per_gas,
        max_priority_fee_per_gas,
        paymaster,
        paymaster_verification_gas_limit: pm_verification,
        paymaster_post_op_gas_limit: pm_post_op,
        paymaster_data,
        signature: packed.signature.clone(),
    })
}

fn non_empty(data: &[u8]) -> Option<Bytes> {
    (!data.is_empty()).then(|| Bytes::from(data.to_vec()))
}

fn non_zero(word: &[u8]) -> Option<U256> {
    let value = U256::from_big_endian(word);
    (!value.is_zero()).then_some(value)
}

/// Offline equivalent of `EntryPoint.getUserOpHash` for v0.7.
///
/// The contract call stays authoritative; this mirrors `UserOperationLib.hash` so that the
/// two can be cross-checked and so tests run without a node.
pub fn hash_packed_user_operation(
    op: &PackedUserOperation,
    entry_point: Address,
    chain_id: u64,
) -> H256 {
    let encoded = encode(&[
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::FixedBytes(keccak256(&op.init_code).to_vec()),
        Token::FixedBytes(keccak256(&op.call_data).to_vec()),
        Token::FixedBytes(op.account_gas_limits.as_bytes().to_vec()),
        Token::Uint(op.pre_verification_gas),
        Token::FixedBytes(op.gas_fees.as_bytes().to_vec()),
        Token::FixedBytes(keccak256(&op.paymaster_and_data).to_vec()),
    ]);

    keccak256(encode(&[
        Token::FixedBytes(keccak256(encoded).to_vec()),
        Token::Address(entry_point),
        Token::Uint(U256::from(chain_id)),
    ]))
    .into()
}

fn concat_u128(high: U256, low: U256, field: &str) -> Result<H256, DelegateError> {
    let mut word = [0u8; 32];
    word[..HALF_WORD].copy_from_slice(&u128_bytes(high, field)?);
    word[HALF_WORD..].copy_from_slice(&u128_bytes(low, field)?);
    Ok(H256::from(word))
}

fn u128_bytes(value: U256, field: &str) -> Result<[u8; HALF_WORD], DelegateError> {
    if value.bits() > 128 {
        return Err(DelegateError::InvalidUserOperation(format!(
            "{field} component {value} does not fit in 128 bits"
        )));
    }
    Ok(value.low_u128().to_be_bytes())
}
