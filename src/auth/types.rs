// Session lifecycle types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing knobs for token refresh and idle detection, all in seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Refresh when the token expires within this window (default: 300 = 5 minutes)
    pub token_refresh_threshold: u64,
    /// Background refresh tick
    pub token_refresh_interval: u64,
    /// TTL assumed when the provider does not report one
    pub default_token_ttl: u64,
    /// Inactivity after which the session ends (default: 1800 = 30 minutes)
    pub idle_timeout: u64,
    /// Idle re-check tick
    pub idle_check_interval: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            token_refresh_threshold: 300,
            token_refresh_interval: 60,
            default_token_ttl: 3600,
            idle_timeout: 1800,
            idle_check_interval: 60,
        }
    }
}

impl SessionSettings {
    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.token_refresh_interval.max(1))
    }

    pub fn idle_check_period(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval.max(1))
    }
}

/// Notifications emitted by the token manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    Refreshed { expires_at: DateTime<Utc> },
    /// The session cannot be recovered without signing in again
    ///
    /// `generation` is the credential generation right after the failure
    /// cleared the tokens.
    RefreshFailed { reason: String, generation: u64 },
}

/// Activity tracker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Uninitialized,
    Active,
    Expired,
    Cleared,
}

/// Foreground/background transitions reported by the app shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppLifecycle {
    Foreground,
    Background,
}

/// Internal signals that end a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionSignal {
    /// Stamped with the session epoch current when the tracker expired
    IdleExpired { epoch: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = SessionSettings::default();
        assert_eq!(settings.token_refresh_threshold, 300);
        assert_eq!(settings.idle_timeout, 30 * 60);
        assert_eq!(settings.refresh_period(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let settings = SessionSettings {
            idle_check_interval: 0,
            ..Default::default()
        };
        assert_eq!(settings.idle_check_period(), Duration::from_secs(1));
    }

    #[test]
    fn test_lifecycle_wire_format() {
        let state: AppLifecycle = serde_json::from_str("\"background\"").unwrap();
        assert_eq!(state, AppLifecycle::Background);
        assert_eq!(
            serde_json::to_string(&TrackerState::Expired).unwrap(),
            "\"expired\""
        );
    }
}
