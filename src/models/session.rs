// Session state models

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Access token, optional refresh token and absolute expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// True once `now` has reached the expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the token expires within `threshold` of `now`
    pub fn expires_within(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.expires_at <= now + threshold
    }
}

/// Last observed user activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityMarker {
    pub last_activity_at: DateTime<Utc>,
}

impl ActivityMarker {
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_activity_at
    }
}

/// Cached profile of the signed-in user, as returned by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub is_verified: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_expiry_checks() {
        let now = Utc::now();
        let cred = Credential {
            access_token: "token".to_string(),
            refresh_token: None,
            expires_at: now + Duration::seconds(600),
        };

        assert!(!cred.is_expired(now));
        assert!(!cred.expires_within(now, Duration::seconds(300)));
        assert!(cred.expires_within(now + Duration::seconds(301), Duration::seconds(300)));
        assert!(cred.is_expired(now + Duration::seconds(600)));
    }

    #[test]
    fn test_session_user_wire_format() {
        let json = r#"{
            "id": "u-1",
            "email": "ada@example.com",
            "firstName": "Ada",
            "lastName": "Lovelace",
            "timezone": "Europe/London",
            "isVerified": true
        }"#;
        let user: SessionUser = serde_json::from_str(json).unwrap();
        assert_eq!(user.first_name, "Ada");
        assert_eq!(user.profile_image, None);
        assert!(user.is_verified);

        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(value["lastName"], "Lovelace");
        assert!(value.get("profileImage").is_none());
    }

    #[test]
    fn test_session_user_defaults() {
        let user: SessionUser =
            serde_json::from_str(r#"{"id": "u-2", "email": "b@example.com"}"#).unwrap();
        assert_eq!(user.timezone, "UTC");
        assert!(!user.is_verified);
        assert!(user.first_name.is_empty());
    }
}
