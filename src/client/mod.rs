//! Wallet side: key generation, review, signing and installation tracking.

pub mod channel;
pub mod installation;
pub mod manager;
pub mod relay;
pub mod review;
pub mod store;
pub mod watch;

pub use channel::{ChannelConfig, ChannelEvent, ProgressChannel, ReconnectPolicy};
pub use installation::{InstallStatus, InstallationState};
pub use manager::{CreateKeyRequest, DelegatedKeyManager, ManagerConfig, ReviewOutcome};
pub use relay::{HttpRelay, RelayApi};
pub use review::{ReviewContext, ReviewSlot};
pub use store::Store;
pub use watch::{SoftwareWatch, WatchBridge};
