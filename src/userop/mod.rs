//! ERC-4337 user operation codec, EntryPoint access and signing.

pub mod codec;
pub mod entrypoint;
pub mod keystore;
pub mod signer;

pub use codec::{
    encode_single_call, hash_packed_user_operation, pack_gas_fees, pack_gas_limits,
    pack_user_operation, unpack_user_operation,
};
pub use entrypoint::{EntryPoint, EntryPointReader, KernelInspector, KernelRpc, ENTRY_POINT_V07};
pub use keystore::{KeyStore, MemoryKeyStore};
pub use signer::UserOpSigner;
