// src/client/review.rs
use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::client::store::{Store, SubscriptionId};
use crate::error::DelegateError;
use crate::protocol::{InstallPayload, RevokePayload};
use crate::types::{DelegatedKeyData, KeyType, TokenLimit};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationReview {
    pub installation_id: String,
    pub device_id: String,
    pub device_name: String,
    pub key_type: KeyType,
    pub kernel_address: Address,
    pub delegated_address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<Vec<Address>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_limits: Option<Vec<TokenLimit>>,
    pub payload: InstallPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationReview {
    pub revocation_id: String,
    pub kernel_address: Address,
    pub key: DelegatedKeyData,
    pub payload: RevokePayload,
}

/// Everything the user is about to sign, exactly as it will be signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ReviewContext {
    Installation(InstallationReview),
    Revocation(RevocationReview),
}

/// Single slot for the pending review. Last writer wins; an empty slot means nothing to sign.
#[derive(Default)]
pub struct ReviewSlot {
    store: Store<Option<ReviewContext>>,
}

impl ReviewSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, context: ReviewContext) {
        self.store.set(Some(context));
    }

    pub fn get(&self) -> Option<ReviewContext> {
        self.store.get()
    }

    pub fn require(&self) -> Result<ReviewContext, DelegateError> {
        self.get().ok_or(DelegateError::NothingToReview)
    }

    /// Removes the context for confirmation, so a second confirm finds nothing to sign.
    pub fn take(&self) -> Result<ReviewContext, DelegateError> {
        let mut taken = None;
        self.store.modify(|slot| {
            taken = slot.take();
            taken.is_some()
        });
        taken.ok_or(DelegateError::NothingToReview)
    }

    pub fn clear(&self) {
        self.store.modify(|slot| slot.take().is_some());
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&Option<ReviewContext>) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, DelegateError> {
        self.store.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{install_payload, LocalEntryPoint};
    use std::sync::{Arc, Mutex};

    fn review(name: &str) -> ReviewContext {
        let entry_point = LocalEntryPoint::default();
        ReviewContext::Installation(InstallationReview {
            installation_id: format!("{name}-id"),
            device_id: name.to_string(),
            device_name: name.to_string(),
            key_type: KeyType::Sudo,
            kernel_address: Address::repeat_byte(0x11),
            delegated_address: Address::repeat_byte(0x22),
            whitelist: None,
            token_limits: None,
            payload: install_payload(&entry_point, Address::repeat_byte(0x11), KeyType::Sudo),
        })
    }

    #[test]
    fn last_writer_wins_and_clear_empties() {
        let slot = ReviewSlot::new();
        assert!(slot.get().is_none());

        slot.set(review("a"));
        slot.set(review("b"));
        assert_eq!(slot.get(), Some(review("b")));

        slot.clear();
        assert!(slot.get().is_none());
        assert!(matches!(slot.require(), Err(DelegateError::NothingToReview)));
    }

    #[test]
    fn clearing_an_empty_slot_notifies_nobody() {
        let slot = ReviewSlot::new();
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        slot.subscribe(move |_| *counter.lock().unwrap() += 1).unwrap();

        slot.clear();
        slot.set(review("a"));
        slot.clear();
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[test]
    fn take_empties_the_slot_once() {
        let slot = ReviewSlot::new();
        slot.set(review("a"));
        assert_eq!(slot.take().unwrap(), review("a"));
        assert!(slot.get().is_none());
        assert!(matches!(slot.take(), Err(DelegateError::NothingToReview)));
    }

    #[test]
    fn context_serializes_with_kind_tag() {
        let value = serde_json::to_value(review("a")).unwrap();
        assert_eq!(value["kind"], "installation");
        assert_eq!(value["payload"]["deviceName"], "a");
    }
}
