// src/client/installation.rs
use ethers::types::H256;
use serde::{Deserialize, Serialize};

use crate::protocol::{step, StatusUpdate};
use crate::types::{InstallationProgress, KeyType};

/// Where an installation stands, as shown to every observer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum InstallStatus {
    #[default]
    Idle,
    Installing {
        message: String,
    },
    Granting {
        message: String,
    },
    Completed {
        message: String,
        #[serde(default, rename = "txHash", skip_serializing_if = "Option::is_none")]
        tx_hash: Option<H256>,
        #[serde(default, rename = "permissionId", skip_serializing_if = "Option::is_none")]
        permission_id: Option<String>,
        #[serde(default, rename = "vId", skip_serializing_if = "Option::is_none")]
        v_id: Option<String>,
    },
    Failed {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, rename = "txHash", skip_serializing_if = "Option::is_none")]
        tx_hash: Option<H256>,
    },
}

/// Milestones of an installation. Each is done once progress reaches its threshold, whether or
/// not an event naming it was ever received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    Installing,
    Granting,
    Configuring,
    Completed,
}

impl InstallStep {
    pub fn threshold(self) -> u8 {
        match self {
            InstallStep::Installing => 50,
            InstallStep::Granting => 80,
            InstallStep::Configuring => 85,
            InstallStep::Completed => 100,
        }
    }

    pub fn for_key_type(key_type: KeyType) -> &'static [InstallStep] {
        match key_type {
            KeyType::Restricted => &[
                InstallStep::Installing,
                InstallStep::Granting,
                InstallStep::Configuring,
                InstallStep::Completed,
            ],
            KeyType::Sudo => &[
                InstallStep::Installing,
                InstallStep::Granting,
                InstallStep::Completed,
            ],
        }
    }
}

pub fn completed_steps(progress: u8, key_type: KeyType) -> usize {
    InstallStep::for_key_type(key_type)
        .iter()
        .filter(|step| progress >= step.threshold())
        .count()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationState {
    pub device_name: Option<String>,
    pub key_type: Option<KeyType>,
    pub current_step: String,
    /// Highest progress seen; never moves backwards within one attempt.
    pub progress: u8,
    pub status: InstallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tx_hash: Option<H256>,
}

impl InstallationState {
    pub fn begin(device_name: &str, key_type: KeyType) -> Self {
        Self {
            device_name: Some(device_name.to_string()),
            key_type: Some(key_type),
            current_step: "Generating key on device".to_string(),
            progress: 0,
            status: InstallStatus::Installing {
                message: "Generating key on device".to_string(),
            },
            last_tx_hash: None,
        }
    }

    /// Installing or granting: a flow owns the state.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            InstallStatus::Installing { .. } | InstallStatus::Granting { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            InstallStatus::Completed { .. } | InstallStatus::Failed { .. }
        )
    }

    pub fn completed_steps(&self) -> usize {
        self.key_type
            .map(|key_type| completed_steps(self.progress, key_type))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> InstallationProgress {
        InstallationProgress {
            step: self.current_step.clone(),
            progress: self.progress,
            tx_hash: self.last_tx_hash,
        }
    }

    /// Folds one progress event in. Returns whether anything changed.
    ///
    /// Terminal states absorb everything after them, so observers see the terminal
    /// transition exactly once.
    pub fn apply(&mut self, update: &StatusUpdate) -> bool {
        if self.is_terminal() || matches!(self.status, InstallStatus::Idle) {
            return false;
        }
        if update.tx_hash.is_some() {
            self.last_tx_hash = update.tx_hash;
        }

        if update.is_failure() {
            return self.fail(
                update.message.clone(),
                Some(update.error.clone().unwrap_or_else(|| update.message.clone())),
            );
        }

        if update.step == step::COMPLETED || update.progress >= 100 {
            self.progress = 100;
            self.current_step = update.message.clone();
            self.status = InstallStatus::Completed {
                message: update.message.clone(),
                tx_hash: self.last_tx_hash,
                permission_id: update.permission_id.clone(),
                v_id: update.v_id.clone(),
            };
            return true;
        }

        if update.progress < self.progress {
            return false;
        }
        let changed = update.progress > self.progress || update.message != self.current_step;
        self.progress = update.progress;
        self.current_step = update.message.clone();
        self.status = if self.progress < InstallStep::Installing.threshold() {
            InstallStatus::Installing {
                message: update.message.clone(),
            }
        } else {
            InstallStatus::Granting {
                message: update.message.clone(),
            }
        };
        changed
    }

    pub fn fail(&mut self, message: String, error: Option<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.current_step = message.clone();
        self.status = InstallStatus::Failed {
            message,
            error,
            tx_hash: self.last_tx_hash,
        };
        true
    }
}
