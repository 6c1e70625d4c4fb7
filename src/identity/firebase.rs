// Firebase Authentication over its REST endpoints

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;

use super::types::{
    DeleteAccountRequest, ErrorEnvelope, IdentityUser, IdpRequest, OobCodeRequest,
    PasswordRequest, RefreshResponse, SignInResponse, SocialCredential, TokenGrant,
};
use super::IdentityProvider;
use crate::error::{Result, SessionError};

pub const DEFAULT_IDENTITY_URL: &str = "https://identitytoolkit.googleapis.com/v1";
pub const DEFAULT_SECURE_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1";

/// Identity provider backed by Firebase Identity Toolkit and Secure Token APIs
pub struct FirebaseIdentityProvider {
    client: Client,
    api_key: String,
    identity_url: String,
    secure_token_url: String,
    state: watch::Sender<Option<IdentityUser>>,
}

impl FirebaseIdentityProvider {
    pub fn new(
        api_key: String,
        identity_url: String,
        secure_token_url: String,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        let (state, _) = watch::channel(None);

        Ok(Self {
            client,
            api_key,
            identity_url: identity_url.trim_end_matches('/').to_string(),
            secure_token_url: secure_token_url.trim_end_matches('/').to_string(),
            state,
        })
    }

    /// Get Identity Toolkit URL for an accounts method
    fn accounts_url(&self, method: &str) -> String {
        format!("{}/accounts:{}?key={}", self.identity_url, method, self.api_key)
    }

    /// Get Secure Token refresh URL
    fn token_url(&self) -> String {
        format!("{}/token?key={}", self.secure_token_url, self.api_key)
    }

    async fn post_accounts<B, R>(&self, method: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        tracing::debug!(method = method, "Identity Toolkit request");

        let response = self
            .client
            .post(self.accounts_url(method))
            .json(body)
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    fn publish(&self, user: Option<IdentityUser>) {
        self.state.send_replace(user);
    }
}

/// Turn a non-success Firebase response into a session error
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        tracing::warn!(status = status.as_u16(), body = %body, "Identity provider unavailable");
        return Err(SessionError::Network(format!(
            "Identity provider unavailable ({})",
            status
        )));
    }

    let code = serde_json::from_str::<ErrorEnvelope>(&body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.clone());

    tracing::warn!(status = status.as_u16(), code = %code, "Identity provider rejected request");
    Err(map_error_code(&code))
}

/// Map a Firebase error code to a user-facing error
///
/// Codes may carry a detail suffix, e.g. `WEAK_PASSWORD : Password should be ...`.
pub(crate) fn map_error_code(raw: &str) -> SessionError {
    let code = raw.split(" : ").next().unwrap_or(raw).trim();
    match code {
        "EMAIL_NOT_FOUND" | "INVALID_PASSWORD" | "INVALID_LOGIN_CREDENTIALS" => {
            SessionError::Authentication("Incorrect email or password".to_string())
        }
        "USER_DISABLED" => {
            SessionError::Authentication("This account has been disabled".to_string())
        }
        "TOO_MANY_ATTEMPTS_TRY_LATER" => SessionError::Authentication(
            "Too many attempts. Please try again later".to_string(),
        ),
        "TOKEN_EXPIRED" | "INVALID_REFRESH_TOKEN" | "INVALID_ID_TOKEN" | "USER_NOT_FOUND"
        | "CREDENTIAL_TOO_OLD_LOGIN_AGAIN" => SessionError::Authentication(
            "Your session has expired. Please sign in again".to_string(),
        ),
        "INVALID_IDP_RESPONSE" => {
            SessionError::Authentication("Social sign-in was rejected".to_string())
        }
        "OPERATION_NOT_ALLOWED" => {
            SessionError::Authentication("This sign-in method is not enabled".to_string())
        }
        "EMAIL_EXISTS" => {
            SessionError::Validation("An account with this email already exists".to_string())
        }
        "WEAK_PASSWORD" => {
            SessionError::Validation("Password should be at least 6 characters".to_string())
        }
        "INVALID_EMAIL" | "MISSING_EMAIL" => {
            SessionError::Validation("Please enter a valid email address".to_string())
        }
        "MISSING_PASSWORD" => SessionError::Validation("Please enter a password".to_string()),
        other => SessionError::Authentication(other.to_string()),
    }
}

fn parse_expires_in(value: Option<&str>) -> Option<u64> {
    value.and_then(|s| s.trim().parse().ok())
}

fn grant_from_sign_in(data: SignInResponse) -> Result<TokenGrant> {
    if data.id_token.is_empty() {
        return Err(SessionError::Authentication(
            "Identity provider response does not contain idToken".to_string(),
        ));
    }

    Ok(TokenGrant {
        expires_in: parse_expires_in(data.expires_in.as_deref()),
        id_token: data.id_token,
        refresh_token: data.refresh_token,
        user: IdentityUser {
            uid: data.local_id,
            email: data.email,
            display_name: data.display_name,
            first_name: data.first_name,
            last_name: data.last_name,
        },
    })
}

/// Build the form-encoded postBody signInWithIdp expects
fn idp_post_body(credential: &SocialCredential) -> Result<String> {
    let mut params = vec![
        ("id_token", credential.id_token.as_str()),
        ("providerId", credential.provider.provider_id()),
    ];
    if let Some(nonce) = credential.nonce.as_deref() {
        params.push(("nonce", nonce));
    }

    let url = Url::parse_with_params("http://localhost", &params)
        .map_err(|e| SessionError::Internal(anyhow::anyhow!("Invalid IdP parameters: {}", e)))?;
    Ok(url.query().unwrap_or_default().to_string())
}

#[async_trait]
impl IdentityProvider for FirebaseIdentityProvider {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<TokenGrant> {
        tracing::info!("Signing in via Firebase email/password...");

        let request = PasswordRequest {
            email,
            password,
            return_secure_token: true,
        };
        let data: SignInResponse = self.post_accounts("signInWithPassword", &request).await?;
        let grant = grant_from_sign_in(data)?;

        self.publish(Some(grant.user.clone()));
        Ok(grant)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<TokenGrant> {
        tracing::info!("Creating Firebase account...");

        let request = PasswordRequest {
            email,
            password,
            return_secure_token: true,
        };
        let data: SignInResponse = self.post_accounts("signUp", &request).await?;
        let grant = grant_from_sign_in(data)?;

        self.publish(Some(grant.user.clone()));
        Ok(grant)
    }

    async fn sign_in_with_idp(&self, credential: &SocialCredential) -> Result<TokenGrant> {
        tracing::info!(
            provider = credential.provider.provider_id(),
            "Signing in via Firebase IdP..."
        );

        let request = IdpRequest {
            post_body: idp_post_body(credential)?,
            request_uri: "http://localhost".to_string(),
            return_secure_token: true,
            return_idp_credential: true,
        };
        let data: SignInResponse = self.post_accounts("signInWithIdp", &request).await?;
        let grant = grant_from_sign_in(data)?;

        self.publish(Some(grant.user.clone()));
        Ok(grant)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        tracing::debug!("Refreshing Firebase ID token...");

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .client
            .post(self.token_url())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .form(&form)
            .send()
            .await?;

        let response = match check_status(response).await {
            Ok(response) => response,
            Err(e) => {
                // The provider no longer recognizes this session
                if matches!(e, SessionError::Authentication(_)) {
                    self.publish(None);
                }
                return Err(e);
            }
        };

        let data: RefreshResponse = response.json().await?;
        if data.id_token.is_empty() {
            return Err(SessionError::Authentication(
                "Secure token response does not contain id_token".to_string(),
            ));
        }

        let expires_in = parse_expires_in(data.expires_in.as_deref());
        tracing::info!(expires_in = ?expires_in, "Firebase ID token refreshed");

        let mut user = self.state.borrow().clone().unwrap_or_default();
        if let Some(uid) = data.user_id {
            user.uid = uid;
        }

        Ok(TokenGrant {
            id_token: data.id_token,
            refresh_token: data.refresh_token,
            expires_in,
            user,
        })
    }

    async fn send_password_reset(&self, email: &str) -> Result<()> {
        let request = OobCodeRequest {
            request_type: "PASSWORD_RESET",
            email,
        };
        let _: serde_json::Value = self.post_accounts("sendOobCode", &request).await?;
        tracing::info!("Password reset email requested");
        Ok(())
    }

    async fn delete_account(&self, id_token: &str) -> Result<()> {
        let request = DeleteAccountRequest { id_token };
        let _: serde_json::Value = self.post_accounts("delete", &request).await?;
        tracing::info!("Firebase account deleted");
        self.publish(None);
        Ok(())
    }

    async fn sign_out(&self) -> Result<()> {
        // Firebase sessions are client-side; dropping local state is the sign-out
        self.publish(None);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<Option<IdentityUser>> {
        self.state.subscribe()
    }

    fn name(&self) -> &str {
        "firebase"
    }
}
