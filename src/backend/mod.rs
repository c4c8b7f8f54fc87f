//! Relay side: prepares unsigned blocks, verifies and submits signed ones, reports progress.

pub mod bundler;
pub mod handlers;
pub mod kernel;
pub mod orchestrator;
pub mod progress;

pub use bundler::{Bundler, RpcBundler};
pub use handlers::LocalRelay;
pub use kernel::PermissionModules;
pub use orchestrator::Orchestrator;
pub use progress::ProgressHub;
