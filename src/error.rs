// src/error.rs
use thiserror::Error;

use crate::types::KeyRole;

#[derive(Error, Debug)]
pub enum DelegateError {
    #[error("Could not verify transaction: hash mismatch for {0} block")]
    HashMismatch(String),

    #[error("No {0} key found in secure storage")]
    KeyNotFound(KeyRole),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Chain read failed: {0}")]
    ChainRead(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Invalid UserOperation: {0}")]
    InvalidUserOperation(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Watch bridge error: {0}")]
    Watch(String),

    #[error("Another installation is already in progress")]
    InstallationInProgress,

    #[error("Nothing to review")]
    NothingToReview,

    #[error("Subscriber limit of {0} reached")]
    SubscriberLimit(usize),
}

impl DelegateError {
    /// Trust and shape failures are never worth retrying; transport ones usually are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DelegateError::Transport(_))
    }
}

pub type Result<T, E = DelegateError> = std::result::Result<T, E>;
