//! Delegated session keys for Kernel v3 smart accounts on ERC-4337 v0.7.
//!
//! The `client` side generates a key on a companion device, shows the unsigned installation bundle
//! for review, signs it with the root key and tracks progress over a websocket. The `backend` side
//! builds those bundles, refuses anything whose hash does not match, and submits through a bundler.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod types;
pub mod userop;

#[cfg(test)]
pub(crate) mod testing;
