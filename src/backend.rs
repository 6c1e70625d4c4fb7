use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{Result, SessionError};
use crate::models::{ExportEnvelope, ProfileUpdate, RegisterRequest, SessionUser, UserEnvelope};

/// Backend `/auth` API used by the orchestrator
#[async_trait]
pub trait ProfileBackend: Send + Sync {
    async fn register(&self, token: &str, request: &RegisterRequest) -> Result<SessionUser>;
    async fn login(&self, token: &str) -> Result<SessionUser>;
    async fn profile(&self, token: &str) -> Result<SessionUser>;
    async fn update_profile(&self, token: &str, update: &ProfileUpdate) -> Result<SessionUser>;
    async fn delete_account(&self, token: &str) -> Result<()>;
    async fn export_data(&self, token: &str) -> Result<ExportEnvelope>;
}

/// HTTP client for the SoCap backend with retry logic for idempotent reads
pub struct BackendClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Base URL, e.g. `https://api.socap.app/api`
    base_url: String,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl BackendClient {
    /// Create a new backend client
    pub fn new(
        base_url: String,
        connect_timeout: u64,
        request_timeout: u64,
        max_retries: u32,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries,
            base_delay_ms: 500,
        })
    }

    /// Override the backoff base delay
    pub fn with_base_delay(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    fn request(&self, method: Method, path: &str, token: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .header("Content-Type", "application/json")
    }

    /// Send a request, retrying network errors, 429 and 5xx when `enable_retry`
    async fn send(&self, builder: RequestBuilder, enable_retry: bool) -> Result<Response> {
        let request = builder
            .build()
            .map_err(|e| SessionError::Internal(anyhow::anyhow!("Invalid request: {}", e)))?;
        let max_retries = if enable_retry { self.max_retries } else { 0 };
        let method = request.method().clone();
        let url = request.url().clone();
        let mut attempt = 0;

        tracing::debug!(method = %method, path = url.path(), "Sending backend request");

        loop {
            let req = request.try_clone().ok_or_else(|| {
                SessionError::Internal(anyhow::anyhow!("Request body is not cloneable"))
            })?;

            match self.client.execute(req).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    let retryable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if retryable && attempt < max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Backend returned {}, retrying after {}ms (attempt {}/{})",
                            status,
                            delay,
                            attempt + 1,
                            max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    tracing::warn!(
                        status = status.as_u16(),
                        path = url.path(),
                        attempt = attempt + 1,
                        "Backend request failed"
                    );
                    return Err(map_status(status, &body));
                }

                Err(e) => {
                    let error_kind = if e.is_timeout() {
                        "timeout"
                    } else if e.is_connect() {
                        "connection_failed"
                    } else if e.is_request() {
                        "request_error"
                    } else {
                        "unknown"
                    };

                    if attempt < max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            error_kind = error_kind,
                            error = %e,
                            "Backend unreachable, retrying after {}ms (attempt {}/{})",
                            delay,
                            attempt + 1,
                            max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = error_kind,
                        error = %e,
                        path = url.path(),
                        total_attempts = attempt + 1,
                        "Backend request failed after all retries"
                    );
                    return Err(SessionError::Network(format!("{} ({})", e, error_kind)));
                }
            }
        }
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // base_delay * 2^attempt plus up to 10% jitter
        let delay = self.base_delay_ms * 2_u64.pow(attempt);
        let jitter = (delay as f64 * 0.1 * jitter::random()) as u64;
        delay + jitter
    }

    async fn fetch_user(&self, builder: RequestBuilder, enable_retry: bool) -> Result<SessionUser> {
        let envelope: UserEnvelope = self.fetch(builder, enable_retry).await?;
        unwrap_user(envelope)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        enable_retry: bool,
    ) -> Result<T> {
        let response = self.send(builder, enable_retry).await?;
        Ok(response.json().await?)
    }
}

/// Map a non-success status to the session error taxonomy
fn map_status(status: StatusCode, body: &str) -> SessionError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string());

    match status {
        StatusCode::NOT_FOUND => SessionError::MissingBackendProfile(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SessionError::Authentication(message),
        _ => SessionError::Backend {
            status: status.as_u16(),
            message,
        },
    }
}

fn unwrap_user(envelope: UserEnvelope) -> Result<SessionUser> {
    match envelope {
        UserEnvelope {
            success: true,
            user: Some(user),
            ..
        } => Ok(user),
        UserEnvelope {
            success: true,
            user: None,
            ..
        } => Err(SessionError::MissingBackendProfile(
            "Backend response contains no user".to_string(),
        )),
        UserEnvelope { message, .. } => Err(SessionError::Backend {
            status: 200,
            message: message.unwrap_or_else(|| "Request was not successful".to_string()),
        }),
    }
}

#[async_trait]
impl ProfileBackend for BackendClient {
    async fn register(&self, token: &str, request: &RegisterRequest) -> Result<SessionUser> {
        tracing::info!("Registering backend profile");
        let builder = self.request(Method::POST, "/auth/register", token).json(request);
        self.fetch_user(builder, false).await
    }

    async fn login(&self, token: &str) -> Result<SessionUser> {
        let builder = self.request(Method::POST, "/auth/login", token);
        self.fetch_user(builder, false).await
    }

    async fn profile(&self, token: &str) -> Result<SessionUser> {
        let builder = self.request(Method::GET, "/auth/profile", token);
        self.fetch_user(builder, true).await
    }

    async fn update_profile(&self, token: &str, update: &ProfileUpdate) -> Result<SessionUser> {
        let builder = self.request(Method::PUT, "/auth/profile", token).json(update);
        self.fetch_user(builder, false).await
    }

    async fn delete_account(&self, token: &str) -> Result<()> {
        let builder = self.request(Method::DELETE, "/auth/account", token);
        self.send(builder, false).await?;
        tracing::info!("Backend account deleted");
        Ok(())
    }

    async fn export_data(&self, token: &str) -> Result<ExportEnvelope> {
        let builder = self.request(Method::GET, "/auth/export", token);
        let envelope: ExportEnvelope = self.fetch(builder, true).await?;
        if !envelope.success {
            return Err(SessionError::Backend {
                status: 200,
                message: "Export was not successful".to_string(),
            });
        }
        Ok(envelope)
    }
}

// Simple random number generation for jitter
mod jitter {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hash, Hasher};

    pub fn random() -> f64 {
        let state = RandomState::new();
        let mut hasher = state.build_hasher();
        std::time::SystemTime::now().hash(&mut hasher);
        (hasher.finish() % 1000) as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER_BODY: &str = r#"{"success":true,"user":{"id":"u-1","email":"a@example.com","firstName":"Ada","lastName":"L","timezone":"UTC","isVerified":true}}"#;

    fn client_for(server: &mockito::ServerGuard, retries: u32) -> BackendClient {
        BackendClient::new(server.url(), 5, 5, retries)
            .unwrap()
            .with_base_delay(1)
    }

    #[test]
    fn test_backoff_calculation() {
        let client = BackendClient::new("http://localhost".to_string(), 30, 30, 3).unwrap();

        let delay0 = client.calculate_backoff_delay(0);
        let delay1 = client.calculate_backoff_delay(1);
        let delay2 = client.calculate_backoff_delay(2);

        assert!((500..=550).contains(&delay0));
        assert!((1000..=1100).contains(&delay1));
        assert!((2000..=2200).contains(&delay2));
    }

    #[test]
    fn test_map_status() {
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, r#"{"message":"User not found"}"#),
            SessionError::MissingBackendProfile(ref m) if m == "User not found"
        ));
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, "nope"),
            SessionError::Authentication(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, r#"{"error":"bad"}"#),
            SessionError::Backend { status: 400, ref message } if message == "bad"
        ));
    }

    #[tokio::test]
    async fn test_profile_sends_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/auth/profile")
            .match_header("authorization", "Bearer id-token")
            .with_status(200)
            .with_body(USER_BODY)
            .create_async()
            .await;

        let client = client_for(&server, 0);
        let user = client.profile("id-token").await.unwrap();

        mock.assert_async().await;
        assert_eq!(user.id, "u-1");
        assert_eq!(user.first_name, "Ada");
    }

    #[tokio::test]
    async fn test_profile_404_is_missing_profile() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/auth/profile")
            .with_status(404)
            .with_body(r#"{"success":false,"message":"User not found"}"#)
            .create_async()
            .await;

        let client = client_for(&server, 2);
        let err = client.profile("id-token").await.unwrap_err();
        assert!(matches!(err, SessionError::MissingBackendProfile(_)));
    }

    #[tokio::test]
    async fn test_profile_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/auth/profile")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let client = client_for(&server, 2);
        let err = client.profile("id-token").await.unwrap_err();

        failing.assert_async().await;
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_login_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/login")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, 3);
        assert!(client.login("id-token").await.is_err());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_register_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/register")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "email": "a@example.com",
                "firstName": "Ada",
                "lastName": "L"
            })))
            .with_status(201)
            .with_body(USER_BODY)
            .create_async()
            .await;

        let client = client_for(&server, 0);
        let request = RegisterRequest {
            email: "a@example.com".to_string(),
            first_name: "Ada".to_string(),
            last_name: "L".to_string(),
            timezone: "UTC".to_string(),
        };
        client.register("id-token", &request).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_export_envelope() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/auth/export")
            .with_status(200)
            .with_body(r#"{"success":true,"user":{"id":"u-1","email":"a@example.com"},"stats":{"contacts":4}}"#)
            .create_async()
            .await;

        let client = client_for(&server, 0);
        let export = client.export_data("id-token").await.unwrap();
        assert_eq!(export.stats.unwrap()["contacts"], 4);
    }

    #[test]
    fn test_unwrap_user_unsuccessful() {
        let envelope = UserEnvelope {
            success: false,
            user: None,
            message: Some("Account locked".to_string()),
        };
        assert!(matches!(
            unwrap_user(envelope),
            Err(SessionError::Backend { ref message, .. }) if message == "Account locked"
        ));
    }
}
