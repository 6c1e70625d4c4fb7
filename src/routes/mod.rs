use axum::{
    extract::State,
    http::StatusCode,
    middleware::{self as axum_middleware},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::{AppLifecycle, AuthOrchestrator, TrackerState};
use crate::error::{Result, SessionError};
use crate::identity::{SocialCredential, SocialProvider};
use crate::metrics::{MetricsSnapshot, SessionMetrics};
use crate::middleware;
use crate::models::{ExportEnvelope, ProfileUpdate, SessionUser};

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub agent_api_key: String,
    pub orchestrator: Arc<AuthOrchestrator>,
    pub metrics: Arc<SessionMetrics>,
}

// ==================================================================================================
// Request and response bodies
// ==================================================================================================

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialSignInRequest {
    pub provider: SocialProvider,
    pub id_token: String,
    pub nonce: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LifecycleRequest {
    pub event: AppLifecycle,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub biometric_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logout_on_close: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user: SessionUser,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub signed_in: bool,
    pub active: bool,
    pub user: Option<SessionUser>,
    pub tracker: TrackerState,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

// ==================================================================================================
// Routers
// ==================================================================================================

/// Health check routes (no authentication required)
pub fn health_routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Session API routes (require the agent key)
pub fn session_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/session", get(session_handler))
        .route("/v1/session/sign-in", post(sign_in_handler))
        .route("/v1/session/sign-up", post(sign_up_handler))
        .route("/v1/session/social", post(social_sign_in_handler))
        .route("/v1/session/sign-out", post(sign_out_handler))
        .route("/v1/session/refresh-user", post(refresh_user_handler))
        .route("/v1/session/token", get(token_handler))
        .route("/v1/session/activity", post(activity_handler))
        .route("/v1/session/lifecycle", post(lifecycle_handler))
        .route("/v1/session/profile", put(update_profile_handler))
        .route("/v1/session/account", axum::routing::delete(delete_account_handler))
        .route("/v1/session/export", get(export_handler))
        .route("/v1/session/password-reset", post(password_reset_handler))
        .route(
            "/v1/session/preferences",
            get(get_preferences_handler).put(put_preferences_handler),
        )
        .route("/v1/metrics", get(metrics_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// Build the application with all routes and middleware
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(health_routes(state.clone()))
        .merge(session_routes(state))
        .layer(middleware::cors_layer())
}

// ==================================================================================================
// Handlers
// ==================================================================================================

/// GET / - Simple health check
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "SoCap session agent is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION,
        "store": state.orchestrator.store_backend(),
    }))
}

/// GET /v1/session - Current session snapshot without touching the network
async fn session_handler(State(state): State<AppState>) -> Json<SessionView> {
    let orchestrator = &state.orchestrator;
    let user = orchestrator.current_user();
    Json(SessionView {
        signed_in: user.is_some(),
        active: orchestrator.is_session_active(),
        user,
        tracker: orchestrator.activity().state(),
        expires_at: orchestrator.tokens().credential().map(|c| c.expires_at),
        last_activity: orchestrator.activity().last_activity(),
    })
}

async fn sign_in_handler(
    State(state): State<AppState>,
    Json(request): Json<SignInRequest>,
) -> Result<Json<UserResponse>> {
    let user = state
        .orchestrator
        .sign_in(&request.email, &request.password)
        .await?;
    Ok(Json(UserResponse { user }))
}

async fn sign_up_handler(
    State(state): State<AppState>,
    Json(request): Json<SignUpRequest>,
) -> Result<Json<UserResponse>> {
    let user = state
        .orchestrator
        .sign_up(
            &request.email,
            &request.password,
            &request.first_name,
            &request.last_name,
        )
        .await?;
    Ok(Json(UserResponse { user }))
}

async fn social_sign_in_handler(
    State(state): State<AppState>,
    Json(request): Json<SocialSignInRequest>,
) -> Result<Json<UserResponse>> {
    let user = state
        .orchestrator
        .sign_in_with_social(SocialCredential {
            provider: request.provider,
            id_token: request.id_token,
            nonce: request.nonce,
        })
        .await?;
    Ok(Json(UserResponse { user }))
}

async fn sign_out_handler(State(state): State<AppState>) -> StatusCode {
    state.orchestrator.sign_out().await;
    StatusCode::NO_CONTENT
}

async fn refresh_user_handler(State(state): State<AppState>) -> Result<Json<UserResponse>> {
    let user = state.orchestrator.refresh_user().await?;
    Ok(Json(UserResponse { user }))
}

/// GET /v1/session/token - A usable access token, refreshed first if close to expiry
async fn token_handler(State(state): State<AppState>) -> Result<Json<TokenResponse>> {
    let access_token = state.orchestrator.access_token().await?;
    let expires_at = state.orchestrator.tokens().credential().map(|c| c.expires_at);
    Ok(Json(TokenResponse {
        access_token,
        expires_at,
    }))
}

async fn activity_handler(State(state): State<AppState>) -> Result<Json<Value>> {
    if !state.orchestrator.record_activity() {
        return Err(SessionError::NotSignedIn);
    }
    Ok(Json(json!({
        "lastActivity": state.orchestrator.activity().last_activity(),
    })))
}

async fn lifecycle_handler(
    State(state): State<AppState>,
    Json(request): Json<LifecycleRequest>,
) -> Json<Value> {
    let tracker = state.orchestrator.notify_lifecycle(request.event).await;
    Json(json!({
        "tracker": tracker,
        "signedIn": state.orchestrator.current_user().is_some(),
    }))
}

async fn update_profile_handler(
    State(state): State<AppState>,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<UserResponse>> {
    let user = state.orchestrator.update_profile(&update).await?;
    Ok(Json(UserResponse { user }))
}

async fn delete_account_handler(State(state): State<AppState>) -> Result<StatusCode> {
    state.orchestrator.delete_account().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn export_handler(State(state): State<AppState>) -> Result<Json<ExportEnvelope>> {
    Ok(Json(state.orchestrator.export_data().await?))
}

async fn password_reset_handler(
    State(state): State<AppState>,
    Json(request): Json<PasswordResetRequest>,
) -> Result<StatusCode> {
    state.orchestrator.send_password_reset(&request.email).await?;
    Ok(StatusCode::ACCEPTED)
}

fn current_preferences(orchestrator: &AuthOrchestrator) -> Preferences {
    Preferences {
        biometric_enabled: Some(orchestrator.biometric_enabled()),
        logout_on_close: Some(orchestrator.logout_on_close()),
    }
}

async fn get_preferences_handler(State(state): State<AppState>) -> Json<Preferences> {
    Json(current_preferences(&state.orchestrator))
}

async fn put_preferences_handler(
    State(state): State<AppState>,
    Json(update): Json<Preferences>,
) -> Json<Preferences> {
    if let Some(enabled) = update.biometric_enabled {
        state.orchestrator.set_biometric_enabled(enabled);
    }
    if let Some(enabled) = update.logout_on_close {
        state.orchestrator.set_logout_on_close(enabled);
    }
    Json(current_preferences(&state.orchestrator))
}

async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// App state over in-process fakes, shared by handler and middleware tests
#[cfg(test)]
pub(crate) fn test_state(api_key: &str) -> AppState {
    use crate::auth::testing::{FakeBackend, FakeIdentity};
    use crate::auth::SessionSettings;
    use crate::clock::SystemClock;
    use crate::store::SecureStore;

    let metrics = Arc::new(SessionMetrics::new());
    let orchestrator = AuthOrchestrator::new(
        SessionSettings::default(),
        Arc::new(SecureStore::in_memory()),
        Arc::new(FakeIdentity::new()),
        Arc::new(FakeBackend::new()),
        Arc::new(SystemClock),
        metrics.clone(),
    );
    AppState {
        agent_api_key: api_key.to_string(),
        orchestrator,
        metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::util::ServiceExt;

    const KEY: &str = "test-key";

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", KEY));
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_root_handler() {
        let value = root_handler().await.0;

        assert_eq!(value["status"], "ok");
        assert_eq!(value["version"], VERSION);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let value = health_handler(State(test_state(KEY))).await.0;

        assert_eq!(value["status"], "healthy");
        assert!(value["timestamp"].is_string());
        assert_eq!(value["store"], "memory");
    }

    #[tokio::test]
    async fn test_sign_in_and_session_view() {
        let app = build_app(test_state(KEY));

        let (status, body) = call(
            &app,
            "POST",
            "/v1/session/sign-in",
            Some(json!({"email": "ada@example.com", "password": "secret"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["email"], "ada@example.com");

        let (status, body) = call(&app, "GET", "/v1/session", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["signedIn"], true);
        assert_eq!(body["active"], true);
        assert_eq!(body["tracker"], "active");
        assert!(body["expiresAt"].is_string());

        let (status, body) = call(&app, "GET", "/v1/session/token", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accessToken"], "id-ada@example.com");
    }

    #[tokio::test]
    async fn test_wrong_password_is_unauthorized() {
        let app = build_app(test_state(KEY));
        let (status, body) = call(
            &app,
            "POST",
            "/v1/session/sign-in",
            Some(json!({"email": "ada@example.com", "password": "wrong"})),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["type"], "auth_error");
    }

    #[tokio::test]
    async fn test_token_when_signed_out() {
        let app = build_app(test_state(KEY));
        let (status, body) = call(&app, "GET", "/v1/session/token", None).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["type"], "not_signed_in");
    }

    #[tokio::test]
    async fn test_sign_out_returns_no_content() {
        let app = build_app(test_state(KEY));
        call(
            &app,
            "POST",
            "/v1/session/sign-in",
            Some(json!({"email": "ada@example.com", "password": "secret"})),
        )
        .await;

        let (status, _) = call(&app, "POST", "/v1/session/sign-out", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = call(&app, "GET", "/v1/session", None).await;
        assert_eq!(body["signedIn"], false);
        assert_eq!(body["tracker"], "cleared");
    }

    #[tokio::test]
    async fn test_preferences_round_trip() {
        let app = build_app(test_state(KEY));

        let (_, body) = call(&app, "GET", "/v1/session/preferences", None).await;
        assert_eq!(body["biometricEnabled"], false);

        let (status, body) = call(
            &app,
            "PUT",
            "/v1/session/preferences",
            Some(json!({"logoutOnClose": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["logoutOnClose"], true);
        assert_eq!(body["biometricEnabled"], false);
    }

    #[tokio::test]
    async fn test_activity_requires_session() {
        let app = build_app(test_state(KEY));
        let (status, _) = call(&app, "POST", "/v1/session/activity", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_social_sign_in_and_metrics() {
        let app = build_app(test_state(KEY));
        let (status, body) = call(
            &app,
            "POST",
            "/v1/session/social",
            Some(json!({"provider": "google", "idToken": "g-token"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["email"], "g-token@social.test");

        let (status, body) = call(&app, "GET", "/v1/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sign_ins"], 1);
    }

    #[tokio::test]
    async fn test_session_routes_require_key() {
        let app = build_app(test_state(KEY));
        let request = Request::builder()
            .uri("/v1/session")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
