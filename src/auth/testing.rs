// In-process fakes for the identity provider and the profile backend

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

use crate::backend::ProfileBackend;
use crate::error::{Result, SessionError};
use crate::identity::{IdentityProvider, IdentityUser, SocialCredential, TokenGrant};
use crate::models::{ExportEnvelope, ProfileUpdate, RegisterRequest, SessionUser};

pub(crate) struct FakeIdentity {
    refresh_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
    fail_refresh: AtomicBool,
    refresh_delay_ms: AtomicU64,
    state: watch::Sender<Option<IdentityUser>>,
}

impl FakeIdentity {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            refresh_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
            fail_refresh: AtomicBool::new(false),
            refresh_delay_ms: AtomicU64::new(0),
            state,
        }
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.refresh_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Simulate the provider dropping the session on its own
    pub fn revoke(&self) {
        self.state.send_replace(None);
    }

    fn grant(&self, email: &str, display_name: Option<&str>) -> TokenGrant {
        let user = IdentityUser {
            uid: format!("uid-{}", email),
            email: Some(email.to_string()),
            display_name: display_name.map(str::to_string),
            ..Default::default()
        };
        self.state.send_replace(Some(user.clone()));
        TokenGrant {
            id_token: format!("id-{}", email),
            refresh_token: Some(format!("rt-{}", email)),
            expires_in: Some(3600),
            user,
        }
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<TokenGrant> {
        if password == "wrong" {
            return Err(SessionError::Authentication("Incorrect password".to_string()));
        }
        Ok(self.grant(email, None))
    }

    async fn sign_up(&self, email: &str, _password: &str) -> Result<TokenGrant> {
        Ok(self.grant(email, None))
    }

    async fn sign_in_with_idp(&self, credential: &SocialCredential) -> Result<TokenGrant> {
        Ok(self.grant(&format!("{}@social.test", credential.id_token), Some("Ada Lovelace")))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
        let delay = self.refresh_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(SessionError::Authentication("TOKEN_EXPIRED".to_string()));
        }
        Ok(TokenGrant {
            id_token: format!("refreshed-{}", n),
            refresh_token: Some(format!("rt-refreshed-{}", n)),
            expires_in: Some(3600),
            user: self.state.borrow().clone().unwrap_or_default(),
        })
    }

    async fn send_password_reset(&self, _email: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_account(&self, _id_token: &str) -> Result<()> {
        self.state.send_replace(None);
        Ok(())
    }

    async fn sign_out(&self) -> Result<()> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(None);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<Option<IdentityUser>> {
        self.state.subscribe()
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Canned backend behavior per operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Ok,
    NotFound,
    Unavailable,
}

pub(crate) struct FakeBackend {
    users: Mutex<HashMap<String, SessionUser>>,
    login_mode: Mutex<Mode>,
    profile_mode: Mutex<Mode>,
    profile_delay_ms: AtomicU64,
    register_calls: AtomicUsize,
    profile_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            login_mode: Mutex::new(Mode::Ok),
            profile_mode: Mutex::new(Mode::Ok),
            profile_delay_ms: AtomicU64::new(0),
            register_calls: AtomicUsize::new(0),
            profile_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_login_mode(&self, mode: Mode) {
        *self.login_mode.lock().unwrap() = mode;
    }

    pub fn set_profile_mode(&self, mode: Mode) {
        *self.profile_mode.lock().unwrap() = mode;
    }

    pub fn set_profile_delay(&self, delay: Duration) {
        self.profile_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, token: &str, mode: Mode) -> Result<SessionUser> {
        match mode {
            Mode::NotFound => Err(SessionError::MissingBackendProfile("User not found".into())),
            Mode::Unavailable => Err(SessionError::Network("connection refused".into())),
            Mode::Ok => {
                let email = token
                    .strip_prefix("id-")
                    .or_else(|| token.strip_prefix("refreshed-"))
                    .unwrap_or(token);
                let users = self.users.lock().unwrap();
                Ok(users
                    .values()
                    .find(|u| u.email == email)
                    .cloned()
                    .unwrap_or_else(|| user_for(email)))
            }
        }
    }
}

pub(crate) fn user_for(email: &str) -> SessionUser {
    SessionUser {
        id: format!("user-{}", email),
        email: email.to_string(),
        first_name: "Test".to_string(),
        last_name: "User".to_string(),
        profile_image: None,
        timezone: "UTC".to_string(),
        is_verified: true,
    }
}

#[async_trait]
impl ProfileBackend for FakeBackend {
    async fn register(&self, _token: &str, request: &RegisterRequest) -> Result<SessionUser> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let user = SessionUser {
            id: format!("user-{}", request.email),
            email: request.email.clone(),
            first_name: request.first_name.clone(),
            last_name: request.last_name.clone(),
            profile_image: None,
            timezone: request.timezone.clone(),
            is_verified: false,
        };
        self.users
            .lock()
            .unwrap()
            .insert(user.id.clone(), user.clone());
        *self.login_mode.lock().unwrap() = Mode::Ok;
        Ok(user)
    }

    async fn login(&self, token: &str) -> Result<SessionUser> {
        let mode = *self.login_mode.lock().unwrap();
        self.lookup(token, mode)
    }

    async fn profile(&self, token: &str) -> Result<SessionUser> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.profile_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let mode = *self.profile_mode.lock().unwrap();
        self.lookup(token, mode)
    }

    async fn update_profile(&self, token: &str, update: &ProfileUpdate) -> Result<SessionUser> {
        let mut user = self.lookup(token, Mode::Ok)?;
        if let Some(ref first) = update.first_name {
            user.first_name = first.clone();
        }
        if let Some(ref last) = update.last_name {
            user.last_name = last.clone();
        }
        if let Some(ref image) = update.profile_image {
            user.profile_image = Some(image.clone());
        }
        if let Some(ref tz) = update.timezone {
            user.timezone = tz.clone();
        }
        self.users
            .lock()
            .unwrap()
            .insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn delete_account(&self, token: &str) -> Result<()> {
        let user = self.lookup(token, Mode::Ok)?;
        self.users.lock().unwrap().remove(&user.id);
        Ok(())
    }

    async fn export_data(&self, token: &str) -> Result<ExportEnvelope> {
        let user = self.lookup(token, Mode::Ok)?;
        Ok(ExportEnvelope {
            success: true,
            user: Some(user),
            stats: Some(serde_json::json!({ "sessions": 3 })),
        })
    }
}
