// Data models for session state and wire formats

pub mod backend;
pub mod session;

pub use backend::{ExportEnvelope, ProfileUpdate, RegisterRequest, UserEnvelope};
pub use session::{ActivityMarker, Credential, SessionUser};
