// Identity provider module
// Sign-in, sign-up, forced token refresh and auth-state notifications

mod firebase;
mod types;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;

pub use firebase::{FirebaseIdentityProvider, DEFAULT_IDENTITY_URL, DEFAULT_SECURE_TOKEN_URL};
pub use types::{IdentityUser, SocialCredential, SocialProvider, TokenGrant};

/// External identity SDK, treated as an opaque collaborator
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<TokenGrant>;

    async fn sign_up(&self, email: &str, password: &str) -> Result<TokenGrant>;

    /// Exchange a platform OAuth credential (Google, Apple) for a provider session
    async fn sign_in_with_idp(&self, credential: &SocialCredential) -> Result<TokenGrant>;

    /// Forced ID-token refresh
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;

    async fn send_password_reset(&self, email: &str) -> Result<()>;

    async fn delete_account(&self, id_token: &str) -> Result<()>;

    async fn sign_out(&self) -> Result<()>;

    /// Auth-state-changed notifications; `None` means signed out
    fn subscribe(&self) -> watch::Receiver<Option<IdentityUser>>;

    fn name(&self) -> &str {
        "unknown"
    }
}
