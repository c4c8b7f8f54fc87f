// src/backend/kernel.rs
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::{id, keccak256};

use crate::types::{KeyType, TokenLimit};
use crate::userop::codec::encode_single_call;
use crate::userop::entrypoint::NO_HOOK_SENTINEL;

/// Single call, revert on failure.
pub const EXEC_MODE_DEFAULT: [u8; 32] = [0; 32];
pub const VALIDATION_TYPE_PERMISSION: u8 = 0x02;
/// Validation nonce assigned to freshly installed permissions.
pub const INITIAL_VALIDATION_NONCE: u32 = 1;

const EXECUTE: &str = "execute(bytes32,bytes)";
const INSTALL_VALIDATIONS: &str = "installValidations(bytes21[],(uint32,address)[],bytes[],bytes[])";
const UNINSTALL_VALIDATION: &str = "uninstallValidation(bytes21,bytes,bytes)";
const GRANT_ACCESS: &str = "grantAccess(bytes21,bytes4,bool)";
const SET_RECIPIENT_ALLOWLIST: &str = "setRecipientAllowlist(bytes32,address[])";
const SET_TOKEN_LIMITS: &str = "setTokenLimits(bytes32,(address,uint256,uint256)[])";
const DEPOSIT_TO: &str = "depositTo(address)";

/// Module deployments the permission validator is assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionModules {
    pub ecdsa_signer: Address,
    pub sudo_policy: Address,
    pub call_policy: Address,
}

fn call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(encode(args));
    Bytes::from(data)
}

pub fn execute_selector() -> [u8; 4] {
    id(EXECUTE)
}

/// `execute(EXEC_MODE_DEFAULT, target ++ value ++ data)`
pub fn execute(target: Address, value: U256, data: &[u8]) -> Bytes {
    call(
        EXECUTE,
        &[
            Token::FixedBytes(EXEC_MODE_DEFAULT.to_vec()),
            Token::Bytes(encode_single_call(target, value, data).to_vec()),
        ],
    )
}

/// Deterministic per (account, key) so a retried installation reuses the same slot.
pub fn permission_id(kernel: Address, delegated: Address) -> [u8; 4] {
    let digest = keccak256([kernel.as_bytes(), delegated.as_bytes()].concat());
    [digest[0], digest[1], digest[2], digest[3]]
}

pub fn permission_validation_id(permission_id: [u8; 4]) -> [u8; 21] {
    let mut v_id = [0u8; 21];
    v_id[0] = VALIDATION_TYPE_PERMISSION;
    v_id[1..5].copy_from_slice(&permission_id);
    v_id
}

/// Storage key the call policy files this permission's limits under.
pub fn policy_key(permission_id: [u8; 4]) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..4].copy_from_slice(&permission_id);
    key
}

/// Policies first, signer last; each entry is `flag(2) ++ module(20) ++ data`.
pub fn permission_enable_data(
    modules: &PermissionModules,
    key_type: KeyType,
    delegated: Address,
) -> Vec<Bytes> {
    let policy = match key_type {
        KeyType::Restricted => modules.call_policy,
        KeyType::Sudo => modules.sudo_policy,
    };
    vec![
        module_entry(policy, &[]),
        module_entry(modules.ecdsa_signer, delegated.as_bytes()),
    ]
}

fn module_entry(module: Address, data: &[u8]) -> Bytes {
    let mut entry = Vec::with_capacity(22 + data.len());
    entry.extend_from_slice(&[0u8; 2]);
    entry.extend_from_slice(module.as_bytes());
    entry.extend_from_slice(data);
    Bytes::from(entry)
}

pub fn install_permission(v_id: [u8; 21], enable_data: &[Bytes]) -> Bytes {
    let validation_data = encode(&[Token::Array(
        enable_data.iter().map(|entry| Token::Bytes(entry.to_vec())).collect(),
    )]);
    call(
        INSTALL_VALIDATIONS,
        &[
            Token::Array(vec![Token::FixedBytes(v_id.to_vec())]),
            Token::Array(vec![Token::Tuple(vec![
                Token::Uint(U256::from(INITIAL_VALIDATION_NONCE)),
                Token::Address(NO_HOOK_SENTINEL),
            ])]),
            Token::Array(vec![Token::Bytes(validation_data)]),
            Token::Array(vec![Token::Bytes(Vec::new())]),
        ],
    )
}

pub fn grant_access(v_id: [u8; 21], selector: [u8; 4], allow: bool) -> Bytes {
    call(
        GRANT_ACCESS,
        &[
            Token::FixedBytes(v_id.to_vec()),
            Token::FixedBytes(selector.to_vec()),
            Token::Bool(allow),
        ],
    )
}

pub fn uninstall_permission(v_id: [u8; 21]) -> Bytes {
    call(
        UNINSTALL_VALIDATION,
        &[
            Token::FixedBytes(v_id.to_vec()),
            Token::Bytes(Vec::new()),
            Token::Bytes(Vec::new()),
        ],
    )
}

pub fn set_recipient_allowlist(key: [u8; 32], recipients: &[Address]) -> Bytes {
    call(
        SET_RECIPIENT_ALLOWLIST,
        &[
            Token::FixedBytes(key.to_vec()),
            Token::Array(recipients.iter().copied().map(Token::Address).collect()),
        ],
    )
}

pub fn set_token_limits(key: [u8; 32], limits: &[TokenLimit]) -> Bytes {
    call(
        SET_TOKEN_LIMITS,
        &[
            Token::FixedBytes(key.to_vec()),
            Token::Array(
                limits
                    .iter()
                    .map(|limit| {
                        Token::Tuple(vec![
                            Token::Address(limit.token),
                            Token::Uint(limit.max_per_transaction),
                            Token::Uint(limit.max_per_day),
                        ])
                    })
                    .collect(),
            ),
        ],
    )
}

pub fn deposit_to(account: Address) -> Bytes {
    call(DEPOSIT_TO, &[Token::Address(account)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::{decode, ParamType};

    #[test]
    fn execute_wraps_single_call() {
        let target = Address::repeat_byte(0x42);
        let data = execute(target, U256::from(7), &[0xca, 0xfe]);
        assert_eq!(&data[..4], &[0xe9, 0xae, 0x5c, 0x53]);

        let tokens = decode(&[ParamType::FixedBytes(32), ParamType::Bytes], &data[4..]).unwrap();
        assert_eq!(tokens[0], Token::FixedBytes(vec![0; 32]));
        let Token::Bytes(inner) = &tokens[1] else {
            panic!("expected bytes");
        };
        assert_eq!(&inner[..20], target.as_bytes());
        assert_eq!(U256::from_big_endian(&inner[20..52]), U256::from(7));
        assert_eq!(&inner[52..], &[0xca, 0xfe]);
    }

    #[test]
    fn validation_id_layout() {
        let pid = permission_id(Address::repeat_byte(1), Address::repeat_byte(2));
        assert_eq!(pid, permission_id(Address::repeat_byte(1), Address::repeat_byte(2)));
        assert_ne!(pid, permission_id(Address::repeat_byte(1), Address::repeat_byte(3)));

        let v_id = permission_validation_id(pid);
        assert_eq!(v_id[0], VALIDATION_TYPE_PERMISSION);
        assert_eq!(&v_id[1..5], &pid);
        assert!(v_id[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn enable_data_puts_signer_last() {
        let modules = PermissionModules {
            ecdsa_signer: Address::repeat_byte(0xe1),
            sudo_policy: Address::repeat_byte(0x5d),
            call_policy: Address::repeat_byte(0xc0),
        };
        let delegated = Address::repeat_byte(0x99);

        let restricted = permission_enable_data(&modules, KeyType::Restricted, delegated);
        assert_eq!(&restricted[0][2..22], modules.call_policy.as_bytes());
        assert_eq!(restricted[0].len(), 22);
        assert_eq!(&restricted[1][2..22], modules.ecdsa_signer.as_bytes());
        assert_eq!(&restricted[1][22..], delegated.as_bytes());

        let sudo = permission_enable_data(&modules, KeyType::Sudo, delegated);
        assert_eq!(&sudo[0][2..22], modules.sudo_policy.as_bytes());
    }

    #[test]
    fn token_limits_encode_as_tuple_array() {
        let limits = vec![TokenLimit {
            token: Address::repeat_byte(0x66),
            max_per_transaction: U256::from(5),
            max_per_day: U256::from(50),
        }];
        let data = set_token_limits(policy_key([1, 2, 3, 4]), &limits);
        let tokens = decode(
            &[
                ParamType::FixedBytes(32),
                ParamType::Array(Box::new(ParamType::Tuple(vec![
                    ParamType::Address,
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                ]))),
            ],
            &data[4..],
        )
        .unwrap();
        assert_eq!(
            tokens[1],
            Token::Array(vec![Token::Tuple(vec![
                Token::Address(Address::repeat_byte(0x66)),
                Token::Uint(U256::from(5)),
                Token::Uint(U256::from(50)),
            ])])
        );
    }

    #[test]
    fn grant_access_targets_execute() {
        let v_id = permission_validation_id([9, 9, 9, 9]);
        let data = grant_access(v_id, execute_selector(), true);
        let tokens = decode(
            &[ParamType::FixedBytes(21), ParamType::FixedBytes(4), ParamType::Bool],
            &data[4..],
        )
        .unwrap();
        assert_eq!(tokens[1], Token::FixedBytes(execute_selector().to_vec()));
        assert_eq!(tokens[2], Token::Bool(true));
    }
}
