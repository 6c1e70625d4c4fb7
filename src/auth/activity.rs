use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::manager::parse_datetime;
use super::types::{AppLifecycle, TrackerState};
use crate::clock::{span_secs, Clock};
use crate::models::ActivityMarker;
use crate::store::{SecureStore, StoreKey};

/// Invoked once when the session goes idle
pub type ExpiryCallback = Arc<dyn Fn() + Send + Sync>;

struct TrackerInner {
    state: TrackerState,
    on_expired: Option<ExpiryCallback>,
    poller: Option<JoinHandle<()>>,
}

/// Session activity tracker
/// Persists the last-activity marker and ends the session after the idle timeout,
/// including time spent while the process was not running
pub struct ActivityTracker {
    store: Arc<SecureStore>,
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    check_period: std::time::Duration,
    inner: Mutex<TrackerInner>,
}

impl ActivityTracker {
    pub fn new(
        store: Arc<SecureStore>,
        clock: Arc<dyn Clock>,
        idle_timeout: u64,
        check_period: std::time::Duration,
    ) -> Self {
        Self {
            store,
            clock,
            idle_timeout: span_secs(idle_timeout),
            check_period,
            inner: Mutex::new(TrackerInner {
                state: TrackerState::Uninitialized,
                on_expired: None,
                poller: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking a session
    ///
    /// A persisted marker older than the idle timeout fires `on_expired` before
    /// this returns, so a stale session never becomes observable.
    pub fn initialize(self: &Arc<Self>, on_expired: ExpiryCallback) -> TrackerState {
        let now = self.clock.now();
        let mut inner = self.lock();
        if let Some(poller) = inner.poller.take() {
            poller.abort();
        }

        match self.marker() {
            Some(marker) if marker.idle_for(now) >= self.idle_timeout => {
                tracing::info!(
                    idle_seconds = marker.idle_for(now).num_seconds(),
                    "Session idle past timeout at startup"
                );
                inner.state = TrackerState::Expired;
                inner.on_expired = None;
                drop(inner);
                on_expired();
                return TrackerState::Expired;
            }
            Some(_) => {}
            None => self.write_marker(now),
        }

        inner.state = TrackerState::Active;
        inner.on_expired = Some(on_expired);
        inner.poller = Some(self.spawn_poller());
        tracing::debug!("Activity tracking started");
        TrackerState::Active
    }

    fn spawn_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = Arc::downgrade(self);
        let period = self.check_period;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                if tracker.check() != TrackerState::Active {
                    break;
                }
            }
        })
    }

    /// Compare the marker against the idle timeout, expiring the session if exceeded
    pub fn check(&self) -> TrackerState {
        let now = self.clock.now();
        {
            let inner = self.lock();
            if inner.state != TrackerState::Active {
                return inner.state;
            }
        }

        match self.marker() {
            None => {
                // Marker vanished underneath an active session
                self.write_marker(now);
                TrackerState::Active
            }
            Some(marker) if marker.idle_for(now) >= self.idle_timeout => self.expire(),
            Some(_) => TrackerState::Active,
        }
    }

    fn expire(&self) -> TrackerState {
        let mut inner = self.lock();
        if inner.state != TrackerState::Active {
            return inner.state;
        }
        inner.state = TrackerState::Expired;
        let callback = inner.on_expired.take();
        let poller = inner.poller.take();
        drop(inner);

        tracing::info!("Session expired after inactivity");
        if let Some(callback) = callback {
            callback();
        }
        if let Some(poller) = poller {
            poller.abort();
        }
        TrackerState::Expired
    }

    /// Record user activity
    ///
    /// The marker never moves backwards. Returns false when the session has
    /// already expired or been cleared.
    pub fn touch(&self) -> bool {
        let inner = self.lock();
        if matches!(inner.state, TrackerState::Expired | TrackerState::Cleared) {
            return false;
        }
        let now = self.clock.now();
        let next = match self.marker() {
            Some(prev) if prev.last_activity_at > now => prev.last_activity_at,
            _ => now,
        };
        self.write_marker(next);
        drop(inner);
        true
    }

    /// Apply a foreground/background transition
    pub fn handle_lifecycle(&self, event: AppLifecycle) -> TrackerState {
        match event {
            AppLifecycle::Background => {
                if self.state() == TrackerState::Active {
                    self.touch();
                }
            }
            AppLifecycle::Foreground => {
                if self.check() == TrackerState::Active {
                    self.touch();
                }
            }
        }
        self.state()
    }

    /// Stop tracking and stamp a fresh marker for the next session
    pub fn reset(&self) {
        let mut inner = self.lock();
        if let Some(poller) = inner.poller.take() {
            poller.abort();
        }
        inner.on_expired = None;
        inner.state = TrackerState::Uninitialized;
        self.write_marker(self.clock.now());
    }

    /// Stop tracking and erase the marker
    pub fn clear(&self) {
        let mut inner = self.lock();
        if let Some(poller) = inner.poller.take() {
            poller.abort();
        }
        inner.on_expired = None;
        inner.state = TrackerState::Cleared;
        self.store.delete(StoreKey::LastActivity);
    }

    /// Stop polling but keep the marker, so idle time keeps counting across restarts
    pub fn stop(&self) {
        let mut inner = self.lock();
        if let Some(poller) = inner.poller.take() {
            poller.abort();
        }
        inner.on_expired = None;
        if inner.state == TrackerState::Active {
            inner.state = TrackerState::Uninitialized;
        }
    }

    pub fn state(&self) -> TrackerState {
        self.lock().state
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.marker().map(|m| m.last_activity_at)
    }

    fn marker(&self) -> Option<ActivityMarker> {
        self.store
            .get(StoreKey::LastActivity)
            .and_then(|raw| parse_datetime(&raw))
            .map(|last_activity_at| ActivityMarker { last_activity_at })
    }

    fn write_marker(&self, at: DateTime<Utc>) {
        self.store.set(StoreKey::LastActivity, &at.to_rfc3339());
    }
}

impl Drop for ActivityTracker {
    fn drop(&mut self) {
        if let Some(poller) = self.lock().poller.take() {
            poller.abort();
        }
    }
}
