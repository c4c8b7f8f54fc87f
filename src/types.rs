// src/types.rs
use std::fmt;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// ERC-4337 v0.7 user operation as carried on the wire and shown to the user.
///
/// Gas, fee and nonce values are hex strings on the wire and accept decimal strings on input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpackedUserOperation {
    pub sender: Address,
    #[serde(with = "numeric")]
    pub nonce: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_data: Option<Bytes>,
    pub call_data: Bytes,
    #[serde(with = "numeric")]
    pub call_gas_limit: U256,
    #[serde(with = "numeric")]
    pub verification_gas_limit: U256,
    #[serde(with = "numeric")]
    pub pre_verification_gas: U256,
    #[serde(with = "numeric")]
    pub max_fee_per_gas: U256,
    #[serde(with = "numeric")]
    pub max_priority_fee_per_gas: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<Address>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "numeric::option"
    )]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "numeric::option"
    )]
    pub paymaster_post_op_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_data: Option<Bytes>,
    #[serde(default)]
    pub signature: Bytes,
}

impl UnpackedUserOperation {
    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}

/// EntryPoint-native encoding of a user operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackedUserOperation {
    pub sender: Address,
    #[serde(with = "numeric")]
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    /// verificationGasLimit (16 bytes) | callGasLimit (16 bytes)
    pub account_gas_limits: H256,
    #[serde(with = "numeric")]
    pub pre_verification_gas: U256,
    /// maxPriorityFeePerGas (16 bytes) | maxFeePerGas (16 bytes)
    pub gas_fees: H256,
    pub paymaster_and_data: Bytes,
    #[serde(default)]
    pub signature: Bytes,
}

/// A relay-prepared operation awaiting a client signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UnsignedBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_policy_type: Option<String>,
    pub unpacked: UnpackedUserOperation,
    pub packed: PackedUserOperation,
    pub user_op_hash: H256,
}

/// An operation after the client has verified its hash and signed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_policy_type: Option<String>,
    pub unpacked: UnpackedUserOperation,
    pub signature: Bytes,
    pub user_op_hash: H256,
}

impl SignedBlock {
    pub fn new(block: &UnsignedBlock, result: SignResult) -> Self {
        Self {
            permission_policy_type: block.permission_policy_type.clone(),
            unpacked: result.unpacked,
            signature: result.signature,
            user_op_hash: block.user_op_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignResult {
    pub unpacked: UnpackedUserOperation,
    pub packed: PackedUserOperation,
    pub signature: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Restricted,
    Sudo,
}

impl KeyType {
    pub fn requires_restrictions(self) -> bool {
        matches!(self, KeyType::Restricted)
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Restricted => f.write_str("restricted"),
            KeyType::Sudo => f.write_str("sudo"),
        }
    }
}

/// Which key in secure storage signs an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRole {
    Root,
    Delegated,
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyRole::Root => f.write_str("root"),
            KeyRole::Delegated => f.write_str("delegated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenLimit {
    pub token: Address,
    #[serde(with = "numeric")]
    pub max_per_transaction: U256,
    #[serde(with = "numeric")]
    pub max_per_day: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationProgress {
    pub step: String,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<H256>,
}

/// A delegated key that finished installing on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegatedKeyData {
    pub id: String,
    pub name: String,
    pub address: Address,
    pub key_type: KeyType,
    pub validator_id: Bytes,
    pub permission_id: Bytes,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<Vec<Address>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_limits: Option<Vec<TokenLimit>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_progress: Option<InstallationProgress>,
}

/// Serde helpers for big-integer quantities: hex out, hex or decimal (string or number) in.
pub mod numeric {
    use ethers::types::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{value:x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => parse_quantity(&s).map_err(de::Error::custom),
            Raw::Num(n) => Ok(U256::from(n)),
        }
    }

    pub fn parse_quantity(s: &str) -> Result<U256, String> {
        let s = s.trim();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some("") => Ok(U256::zero()),
            Some(digits) => U256::from_str_radix(digits, 16)
                .map_err(|e| format!("invalid hex quantity {s:?}: {e}")),
            None => U256::from_dec_str(s).map_err(|e| format!("invalid quantity {s:?}: {e}")),
        }
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<U256>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => super::serialize(v, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<U256>, D::Error> {
            match Option::<Raw>::deserialize(deserializer)? {
                Some(Raw::Str(s)) => parse_quantity(&s).map(Some).map_err(de::Error::custom),
                Some(Raw::Num(n)) => Ok(Some(U256::from(n))),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quantities_accept_decimal_and_hex_strings() {
        let op: UnpackedUserOperation = serde_json::from_value(json!({
            "sender": "0x1111111111111111111111111111111111111111",
            "nonce": "42",
            "callData": "0x",
            "callGasLimit": "0x5208",
            "verificationGasLimit": 100000,
            "preVerificationGas": "21000",
            "maxFeePerGas": "0x3b9aca00",
            "maxPriorityFeePerGas": "0x0",
        }))
        .unwrap();

        assert_eq!(op.nonce, U256::from(42));
        assert_eq!(op.call_gas_limit, U256::from(21_000));
        assert_eq!(op.verification_gas_limit, U256::from(100_000));
        assert_eq!(op.pre_verification_gas, U256::from(21_000));
        assert_eq!(op.max_fee_per_gas, U256::from(1_000_000_000u64));
        assert!(op.signature.is_empty());
        assert!(op.paymaster_verification_gas_limit.is_none());
    }

    #[test]
    fn quantities_serialize_as_hex() {
        let op = UnpackedUserOperation {
            nonce: U256::from(255),
            ..Default::default()
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["nonce"], "0xff");
        assert_eq!(value["callGasLimit"], "0x0");
        assert!(value.get("paymaster").is_none());
    }

    #[test]
    fn unsigned_block_rejects_unknown_shapes() {
        let nested = json!({
            "data": {
                "unpacked": {},
                "packed": {},
                "userOpHash": format!("{:?}", H256::zero()),
            }
        });
        assert!(serde_json::from_value::<UnsignedBlock>(nested).is_err());
    }

    #[test]
    fn bad_quantity_is_an_error() {
        assert!(numeric::parse_quantity("0xzz").is_err());
        assert!(numeric::parse_quantity("twelve").is_err());
        assert_eq!(numeric::parse_quantity("0x").unwrap(), U256::zero());
    }
}
