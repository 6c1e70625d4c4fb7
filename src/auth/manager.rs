use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::types::TokenEvent;
use crate::clock::{span_secs, Clock};
use crate::identity::IdentityProvider;
use crate::models::Credential;
use crate::store::{SecureStore, StoreKey};

/// Provider-reported lifetimes beyond this are clamped (ID tokens last an hour)
const MAX_TOKEN_TTL_SECS: u64 = 7 * 24 * 60 * 60;

const TOKEN_KEYS: [StoreKey; 3] = [
    StoreKey::AccessToken,
    StoreKey::RefreshToken,
    StoreKey::TokenExpiry,
];

/// Token lifecycle manager
/// Tracks expiry, refreshes ahead of it, and serializes refreshes so that
/// concurrent callers share a single provider call
pub struct TokenManager {
    /// Persistent credential storage (source of truth for the credential)
    store: Arc<SecureStore>,

    /// Identity provider performing the forced refresh
    identity: Arc<dyn IdentityProvider>,

    clock: Arc<dyn Clock>,

    /// Refresh when the token expires within this window
    refresh_threshold: Duration,

    /// TTL in seconds when the provider reports none
    default_ttl: u64,

    /// Held for the duration of a refresh
    refresh_gate: Mutex<()>,

    /// Bumped whenever the stored credential is replaced or cleared
    generation: AtomicU64,

    /// Provider refresh calls made, for metrics and tests
    refresh_attempts: AtomicU64,

    events: broadcast::Sender<TokenEvent>,
}

impl TokenManager {
    pub fn new(
        store: Arc<SecureStore>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        refresh_threshold: u64,
        default_ttl: u64,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            store,
            identity,
            clock,
            refresh_threshold: span_secs(refresh_threshold),
            default_ttl,
            refresh_gate: Mutex::new(()),
            generation: AtomicU64::new(0),
            refresh_attempts: AtomicU64::new(0),
            events,
        }
    }

    /// Persist a credential expiring `ttl_seconds` from now
    ///
    /// A missing refresh token keeps the one already stored.
    pub fn store_credential(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        ttl_seconds: Option<u64>,
    ) -> Credential {
        let ttl = ttl_seconds.unwrap_or(self.default_ttl);
        if ttl > MAX_TOKEN_TTL_SECS {
            tracing::warn!(ttl = ttl, "Token lifetime out of range, clamping");
        }
        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(span_secs(ttl.min(MAX_TOKEN_TTL_SECS)))
            .unwrap_or(now);

        self.store.set(StoreKey::AccessToken, access_token);
        if let Some(refresh_token) = refresh_token {
            self.store.set(StoreKey::RefreshToken, refresh_token);
        }
        self.store.set(StoreKey::TokenExpiry, &expires_at.to_rfc3339());
        self.generation.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(expires_at = %expires_at.to_rfc3339(), "Stored credential");

        Credential {
            access_token: access_token.to_string(),
            refresh_token: refresh_token
                .map(str::to_string)
                .or_else(|| self.store.get(StoreKey::RefreshToken)),
            expires_at,
        }
    }

    /// Load the stored credential; partial state reads as absent
    pub fn credential(&self) -> Option<Credential> {
        let access_token = self.store.get(StoreKey::AccessToken)?;
        let expires_at = self
            .store
            .get(StoreKey::TokenExpiry)
            .and_then(|raw| parse_datetime(&raw))?;

        Some(Credential {
            access_token,
            refresh_token: self.store.get(StoreKey::RefreshToken),
            expires_at,
        })
    }

    /// Check if a stored token is expiring soon (within threshold)
    pub fn needs_refresh(&self) -> bool {
        let now = self.clock.now();
        self.credential()
            .map(|c| c.expires_within(now, self.refresh_threshold))
            .unwrap_or(false)
    }

    /// Check if the stored token is actually expired (not just expiring soon)
    pub fn is_token_expired(&self) -> bool {
        let now = self.clock.now();
        self.credential()
            .map(|c| c.is_expired(now))
            .unwrap_or(true)
    }

    /// Get a usable access token, refreshing first when it is close to expiry
    ///
    /// Returns `None` when nothing is stored or the refresh failed.
    pub async fn get_access_token(&self) -> Option<String> {
        let credential = self.credential()?;
        if credential.expires_within(self.clock.now(), self.refresh_threshold) {
            return self.refresh_inner(false).await;
        }
        Some(credential.access_token)
    }

    /// Force a refresh through the identity provider
    ///
    /// Failure clears all token state: the session is treated as unrecoverable.
    pub async fn refresh(&self) -> Option<String> {
        self.refresh_inner(true).await
    }

    async fn refresh_inner(&self, force: bool) -> Option<String> {
        let observed = self.generation.load(Ordering::SeqCst);
        let _guard = self.refresh_gate.lock().await;

        if self.generation.load(Ordering::SeqCst) != observed {
            tracing::debug!("Credential replaced while waiting on refresh, reusing it");
            return self.valid_token();
        }

        let credential = self.credential();
        if !force {
            if let Some(ref current) = credential {
                if !current.expires_within(self.clock.now(), self.refresh_threshold) {
                    return Some(current.access_token.clone());
                }
            }
        }

        let Some(current) = credential else {
            tracing::debug!("No credential stored, nothing to refresh");
            return None;
        };
        let Some(refresh_token) = current.refresh_token else {
            tracing::warn!("Credential has no refresh token");
            self.fail("No refresh token available");
            return None;
        };

        tracing::debug!("Refreshing access token...");
        self.refresh_attempts.fetch_add(1, Ordering::Relaxed);

        let result = self.identity.refresh(&refresh_token).await;

        // Signed out or signed in again while the call was in flight
        if self.generation.load(Ordering::SeqCst) != observed {
            tracing::warn!("Session changed during refresh, discarding result");
            return self.valid_token();
        }

        match result {
            Ok(grant) => {
                let credential = self.store_credential(
                    &grant.id_token,
                    grant.refresh_token.as_deref(),
                    grant.expires_in,
                );
                tracing::info!(
                    "Token refreshed, expires: {}",
                    credential.expires_at.to_rfc3339()
                );
                let _ = self.events.send(TokenEvent::Refreshed {
                    expires_at: credential.expires_at,
                });
                Some(credential.access_token)
            }
            Err(e) => {
                tracing::error!("Token refresh failed: {}", e);
                self.fail(&e.to_string());
                None
            }
        }
    }

    fn fail(&self, reason: &str) {
        self.clear();
        let _ = self.events.send(TokenEvent::RefreshFailed {
            reason: reason.to_string(),
            generation: self.generation(),
        });
    }

    fn valid_token(&self) -> Option<String> {
        let now = self.clock.now();
        self.credential()
            .filter(|c| !c.is_expired(now))
            .map(|c| c.access_token)
    }

    /// Erase every token key
    pub fn clear(&self) {
        self.store.clear(&TOKEN_KEYS);
        self.generation.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Token state cleared");
    }

    /// One background tick: refresh only when the predicate says so
    pub async fn tick(&self) {
        if self.needs_refresh() {
            tracing::info!("Token expiring soon, refreshing proactively");
            self.refresh_inner(false).await;
        }
    }

    /// Spawn the proactive refresh loop; abort the handle to stop it
    pub fn spawn_refresh_loop(self: &Arc<Self>, period: std::time::Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.tick().await;
            }
        })
    }

    /// Current credential generation; changes on every store or clear
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe()
    }

    pub fn refresh_attempts(&self) -> u64 {
        self.refresh_attempts.load(Ordering::Relaxed)
    }
}

/// Parse an RFC 3339 timestamp as written by the store
pub(crate) fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
