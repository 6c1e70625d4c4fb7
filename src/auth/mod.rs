// Authentication module
// Token lifecycle, idle tracking and the orchestrator that composes them

mod types;
pub mod activity;
pub mod manager;
pub mod orchestrator;

#[cfg(test)]
pub(crate) mod testing;

pub use activity::{ActivityTracker, ExpiryCallback};
pub use manager::TokenManager;
pub use orchestrator::AuthOrchestrator;
pub use types::{AppLifecycle, SessionSettings, TokenEvent, TrackerState};
