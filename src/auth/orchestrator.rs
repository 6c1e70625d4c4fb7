use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::activity::{ActivityTracker, ExpiryCallback};
use super::manager::TokenManager;
use super::types::{AppLifecycle, SessionSettings, SessionSignal, TokenEvent, TrackerState};
use crate::backend::ProfileBackend;
use crate::clock::Clock;
use crate::error::{ErrorKind, Result, SessionError};
use crate::identity::{IdentityProvider, SocialCredential, SocialProvider, TokenGrant};
use crate::metrics::SessionMetrics;
use crate::models::{ExportEnvelope, ProfileUpdate, RegisterRequest, SessionUser};
use crate::store::{FeatureFlag, SecureStore, StoreKey};

const DEFAULT_TIMEZONE: &str = "UTC";

/// How the backend profile is obtained once the provider has issued a token
enum ProfileFlow {
    Login,
    Register(RegisterRequest),
    /// Login, registering on first use
    Social,
}

#[derive(Default)]
struct SessionTasks {
    refresh_loop: Option<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
}

/// Single entry point for authentication
///
/// Owns the token manager and activity tracker, talks to the identity provider
/// and the backend profile API, and publishes the current user. Every path that
/// ends a session goes through [`AuthOrchestrator::sign_out`].
pub struct AuthOrchestrator {
    settings: SessionSettings,
    store: Arc<SecureStore>,
    identity: Arc<dyn IdentityProvider>,
    backend: Arc<dyn ProfileBackend>,
    tokens: Arc<TokenManager>,
    activity: Arc<ActivityTracker>,
    metrics: Arc<SessionMetrics>,
    current: watch::Sender<Option<SessionUser>>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionSignal>>>,
    tasks: Mutex<SessionTasks>,
    /// Bumped on every sign-out; in-flight work and signals from an older epoch are dropped
    epoch: Arc<AtomicU64>,
}

impl AuthOrchestrator {
    pub fn new(
        settings: SessionSettings,
        store: Arc<SecureStore>,
        identity: Arc<dyn IdentityProvider>,
        backend: Arc<dyn ProfileBackend>,
        clock: Arc<dyn Clock>,
        metrics: Arc<SessionMetrics>,
    ) -> Arc<Self> {
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            identity.clone(),
            clock.clone(),
            settings.token_refresh_threshold,
            settings.default_token_ttl,
        ));
        let activity = Arc::new(ActivityTracker::new(
            store.clone(),
            clock,
            settings.idle_timeout,
            settings.idle_check_period(),
        ));
        let (current, _) = watch::channel(None);
        let (signals, signal_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            settings,
            store,
            identity,
            backend,
            tokens,
            activity,
            metrics,
            current,
            signals,
            signal_rx: Mutex::new(Some(signal_rx)),
            tasks: Mutex::new(SessionTasks::default()),
            epoch: Arc::new(AtomicU64::new(0)),
        })
    }

    fn tasks(&self) -> MutexGuard<'_, SessionTasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend_name()
    }

    // ==================================================================================================
    // Credential-producing operations
    // ==================================================================================================

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SessionUser> {
        validate_credentials(email, password)?;
        tracing::info!(email = %email, "Signing in with password");

        let grant = self
            .provider_call(self.identity.sign_in_with_password(email, password))
            .await?;
        self.establish(grant, ProfileFlow::Login).await
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<SessionUser> {
        validate_credentials(email, password)?;
        tracing::info!(email = %email, "Creating account");

        let grant = self
            .provider_call(self.identity.sign_up(email, password))
            .await?;
        let request = RegisterRequest {
            email: email.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
        };
        self.establish(grant, ProfileFlow::Register(request)).await
    }

    pub async fn sign_in_with_google(&self, id_token: &str) -> Result<SessionUser> {
        self.sign_in_with_social(SocialCredential {
            provider: SocialProvider::Google,
            id_token: id_token.to_string(),
            nonce: None,
        })
        .await
    }

    pub async fn sign_in_with_apple(&self, id_token: &str, nonce: Option<&str>) -> Result<SessionUser> {
        self.sign_in_with_social(SocialCredential {
            provider: SocialProvider::Apple,
            id_token: id_token.to_string(),
            nonce: nonce.map(str::to_string),
        })
        .await
    }

    pub async fn sign_in_with_social(&self, credential: SocialCredential) -> Result<SessionUser> {
        if credential.id_token.trim().is_empty() {
            return Err(SessionError::Validation("idToken is required".to_string()));
        }
        tracing::info!(provider = credential.provider.provider_id(), "Signing in with social provider");

        let grant = self
            .provider_call(self.identity.sign_in_with_idp(&credential))
            .await?;
        self.establish(grant, ProfileFlow::Social).await
    }

    async fn provider_call(
        &self,
        call: impl std::future::Future<Output = Result<TokenGrant>>,
    ) -> Result<TokenGrant> {
        call.await.inspect_err(|e| {
            tracing::warn!("Identity provider rejected sign-in: {}", e);
            self.metrics.record_sign_in(false);
        })
    }

    /// Store the fresh credential, resolve the backend profile and start the session
    ///
    /// Any backend failure tears the partial session down on both sides.
    async fn establish(&self, grant: TokenGrant, flow: ProfileFlow) -> Result<SessionUser> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.tokens.store_credential(
            &grant.id_token,
            grant.refresh_token.as_deref(),
            grant.expires_in,
        );

        let token = grant.id_token.as_str();
        let result = match flow {
            ProfileFlow::Login => self.backend.login(token).await,
            ProfileFlow::Register(request) => self.backend.register(token, &request).await,
            ProfileFlow::Social => match self.backend.login(token).await {
                Err(SessionError::MissingBackendProfile(_)) => {
                    tracing::info!(uid = %grant.user.uid, "First social sign-in, registering profile");
                    let (first_name, last_name) = grant.user.names();
                    let request = RegisterRequest {
                        email: grant.user.email.clone().unwrap_or_default(),
                        first_name,
                        last_name,
                        timezone: DEFAULT_TIMEZONE.to_string(),
                    };
                    self.backend.register(token, &request).await
                }
                other => other,
            },
        };

        let user = match result {
            Ok(user) => user,
            Err(e) => {
                tracing::error!("Backend profile unavailable during sign-in: {}", e);
                self.metrics.record_sign_in(false);
                self.end_session("sign_in_failed").await;
                return Err(e);
            }
        };

        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::warn!("Signed out while signing in, dropping session");
            self.metrics.record_sign_in(false);
            return Err(SessionError::NotSignedIn);
        }

        self.start_session(user.clone());
        self.metrics.record_sign_in(true);
        tracing::info!(user_id = %user.id, "Signed in");
        Ok(user)
    }

    fn start_session(&self, user: SessionUser) {
        self.persist_user(&user);
        self.activity.reset();
        self.activity.initialize(self.expiry_callback());

        let refresh_loop = self
            .tokens
            .spawn_refresh_loop(self.settings.refresh_period());
        if let Some(previous) = self.tasks().refresh_loop.replace(refresh_loop) {
            previous.abort();
        }

        self.current.send_replace(Some(user));
    }

    fn expiry_callback(&self) -> ExpiryCallback {
        let signals = self.signals.clone();
        let epoch = self.epoch.clone();
        Arc::new(move || {
            let epoch = epoch.load(Ordering::SeqCst);
            let _ = signals.send(SessionSignal::IdleExpired { epoch });
        })
    }

    fn persist_user(&self, user: &SessionUser) {
        match serde_json::to_string(user) {
            Ok(json) => self.store.set(StoreKey::SessionUser, &json),
            Err(e) => tracing::warn!("Failed to serialize session user: {}", e),
        }
    }

    /// Publish and cache a profile unless the session changed since `epoch`
    fn accept_profile(&self, epoch: u64, user: &SessionUser) -> bool {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::warn!("Session ended while fetching profile, discarding result");
            return false;
        }
        self.persist_user(user);
        self.current.send_replace(Some(user.clone()));
        true
    }

    // ==================================================================================================
    // Session queries and maintenance
    // ==================================================================================================

    /// Re-fetch the backend profile
    ///
    /// A missing backend profile signs the user out. Network-class failures
    /// keep the session. Either way the error is returned.
    pub async fn refresh_user(&self) -> Result<SessionUser> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let token = self.access_token().await?;

        match self.backend.profile(&token).await {
            Ok(user) => {
                if !self.accept_profile(epoch, &user) {
                    return Err(SessionError::NotSignedIn);
                }
                tracing::debug!(user_id = %user.id, "Profile refreshed");
                Ok(user)
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::Consistency => {
                        tracing::warn!("Backend has no profile for this identity, signing out");
                        self.end_session("missing_profile").await;
                    }
                    ErrorKind::Transient => {
                        tracing::warn!("Profile refresh failed, keeping session: {}", e);
                    }
                    _ => tracing::warn!("Profile refresh failed: {}", e),
                }
                Err(e)
            }
        }
    }

    /// A usable access token for outbound requests
    ///
    /// A signed-in user whose token cannot be produced is signed out.
    pub async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.tokens.get_access_token().await {
            return Ok(token);
        }
        let signed_in = self.current.borrow().is_some();
        if signed_in {
            tracing::warn!("No usable token for signed-in user, signing out");
            self.end_session("token_unavailable").await;
            return Err(SessionError::Authentication(
                "Session expired, please sign in again".to_string(),
            ));
        }
        Err(SessionError::NotSignedIn)
    }

    /// Current user, only while a credential backs it
    pub fn current_user(&self) -> Option<SessionUser> {
        self.tokens.credential()?;
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SessionUser>> {
        self.current.subscribe()
    }

    pub fn is_session_active(&self) -> bool {
        self.current_user().is_some() && self.activity.state() == TrackerState::Active
    }

    fn is_signed_in(&self) -> bool {
        self.current.borrow().is_some() || self.tokens.credential().is_some()
    }

    /// Bootstrap from persisted state without touching the network
    ///
    /// The cached user is only published when a credential backs it and the
    /// persisted activity marker is within the idle timeout.
    pub async fn restore(&self) -> Option<SessionUser> {
        let raw = self.store.get(StoreKey::SessionUser)?;
        let user: SessionUser = match serde_json::from_str(&raw) {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!("Discarding unreadable cached user: {}", e);
                self.end_session("restore_failed").await;
                return None;
            }
        };

        let usable = self
            .tokens
            .credential()
            .map(|c| c.refresh_token.is_some() || !self.tokens.is_token_expired())
            .unwrap_or(false);
        if !usable {
            tracing::info!("Cached user has no usable credential, clearing");
            self.end_session("restore_failed").await;
            return None;
        }

        if self.activity.initialize(self.expiry_callback()) == TrackerState::Expired {
            self.handle_idle_expiry().await;
            return None;
        }

        let refresh_loop = self
            .tokens
            .spawn_refresh_loop(self.settings.refresh_period());
        if let Some(previous) = self.tasks().refresh_loop.replace(refresh_loop) {
            previous.abort();
        }
        self.current.send_replace(Some(user.clone()));
        tracing::info!(user_id = %user.id, "Restored session from cache");
        Some(user)
    }

    /// Record user interaction; false when no active session
    pub fn record_activity(&self) -> bool {
        if self.current.borrow().is_none() {
            return false;
        }
        self.activity.touch()
    }

    /// Feed a foreground/background transition into the idle tracker
    pub async fn notify_lifecycle(&self, event: AppLifecycle) -> TrackerState {
        if self.current.borrow().is_none() {
            return self.activity.state();
        }
        let state = self.activity.handle_lifecycle(event);
        if state == TrackerState::Expired {
            self.handle_idle_expiry().await;
        }
        state
    }

    async fn handle_idle_expiry(&self) {
        if !self.is_signed_in() {
            return;
        }
        self.metrics.record_idle_expiration();
        self.end_session("idle").await;
    }

    // ==================================================================================================
    // Profile and account operations
    // ==================================================================================================

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<SessionUser> {
        if update.is_empty() {
            return Err(SessionError::Validation("No profile fields to update".to_string()));
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        let token = self.access_token().await?;
        let user = self.backend.update_profile(&token, update).await?;
        if !self.accept_profile(epoch, &user) {
            return Err(SessionError::NotSignedIn);
        }
        Ok(user)
    }

    /// Delete the account on the backend and the provider, then sign out
    pub async fn delete_account(&self) -> Result<()> {
        let token = self.access_token().await?;
        self.backend.delete_account(&token).await?;

        let provider_result = self.identity.delete_account(&token).await;
        if let Err(ref e) = provider_result {
            tracing::error!("Provider account deletion failed: {}", e);
        }
        self.end_session("account_deleted").await;
        provider_result
    }

    pub async fn export_data(&self) -> Result<ExportEnvelope> {
        let token = self.access_token().await?;
        self.backend.export_data(&token).await
    }

    pub async fn send_password_reset(&self, email: &str) -> Result<()> {
        if email.trim().is_empty() {
            return Err(SessionError::Validation("email is required".to_string()));
        }
        self.identity.send_password_reset(email).await
    }

    pub fn biometric_enabled(&self) -> bool {
        self.store.flag(FeatureFlag::BiometricEnabled)
    }

    pub fn set_biometric_enabled(&self, enabled: bool) {
        self.store.set_flag(FeatureFlag::BiometricEnabled, enabled);
    }

    pub fn logout_on_close(&self) -> bool {
        self.store.flag(FeatureFlag::LogoutOnClose)
    }

    pub fn set_logout_on_close(&self, enabled: bool) {
        self.store.set_flag(FeatureFlag::LogoutOnClose, enabled);
    }

    // ==================================================================================================
    // Teardown
    // ==================================================================================================

    /// Sign out; idempotent
    pub async fn sign_out(&self) {
        self.end_session("user").await;
    }

    async fn end_session(&self, reason: &str) {
        let was_signed_in = self.is_signed_in();
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(refresh_loop) = self.tasks().refresh_loop.take() {
            refresh_loop.abort();
        }
        self.activity.clear();
        self.tokens.clear();
        self.store.delete(StoreKey::SessionUser);
        self.current.send_replace(None);

        if let Err(e) = self.identity.sign_out().await {
            tracing::warn!("Provider sign-out failed: {}", e);
        }

        if was_signed_in {
            self.metrics.record_sign_out(reason);
            tracing::info!(reason = reason, "Signed out");
        }
    }

    /// Spawn the supervisor that ends the session on idle expiry, refresh
    /// failure or provider-side sign-out
    pub fn start(self: &Arc<Self>) {
        let Some(mut signals) = self
            .signal_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            tracing::debug!("Session supervisor already running");
            return;
        };
        let mut token_events = self.tokens.subscribe();
        let mut provider = self.identity.subscribe();
        let orchestrator = Arc::downgrade(self);

        let supervisor = tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = signals.recv() => {
                        let Some(SessionSignal::IdleExpired { epoch }) = signal else { break };
                        let Some(this) = orchestrator.upgrade() else { break };
                        if this.epoch.load(Ordering::SeqCst) != epoch {
                            tracing::debug!("Idle expiry for an ended session, ignoring");
                            continue;
                        }
                        this.handle_idle_expiry().await;
                    }
                    event = token_events.recv() => {
                        let Some(this) = orchestrator.upgrade() else { break };
                        match event {
                            Ok(TokenEvent::Refreshed { expires_at }) => {
                                this.metrics.record_refresh(true);
                                tracing::debug!(expires_at = %expires_at.to_rfc3339(), "Token refreshed");
                            }
                            Ok(TokenEvent::RefreshFailed { reason, generation }) => {
                                this.metrics.record_refresh(false);
                                if this.tokens.generation() != generation {
                                    tracing::debug!("Refresh failure for a replaced credential, ignoring");
                                } else if this.is_signed_in() {
                                    tracing::warn!("Token refresh failed, signing out: {}", reason);
                                    this.end_session("refresh_failed").await;
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped = skipped, "Supervisor lagged behind token events");
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                    changed = provider.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let provider_signed_out = provider.borrow_and_update().is_none();
                        let Some(this) = orchestrator.upgrade() else { break };
                        let signed_in = this.current.borrow().is_some();
                        if provider_signed_out && signed_in {
                            tracing::warn!("Identity provider ended the session");
                            this.end_session("provider").await;
                        }
                    }
                }
            }
            tracing::debug!("Session supervisor stopped");
        });

        if let Some(previous) = self.tasks().supervisor.replace(supervisor) {
            previous.abort();
        }
        tracing::debug!("Session supervisor started");
    }

    /// Stop background work, signing out first when logout-on-close is set
    pub async fn shutdown(&self) {
        if self.logout_on_close() && self.is_signed_in() {
            self.end_session("logout_on_close").await;
        } else if self.current.borrow().is_some() {
            self.activity.touch();
        }
        self.activity.stop();

        let mut tasks = self.tasks();
        if let Some(refresh_loop) = tasks.refresh_loop.take() {
            refresh_loop.abort();
        }
        if let Some(supervisor) = tasks.supervisor.take() {
            supervisor.abort();
        }
        tracing::info!("Session orchestrator shut down");
    }
}

fn validate_credentials(email: &str, password: &str) -> Result<()> {
    if email.trim().is_empty() {
        return Err(SessionError::Validation("email is required".to_string()));
    }
    if password.is_empty() {
        return Err(SessionError::Validation("password is required".to_string()));
    }
    Ok(())
}
