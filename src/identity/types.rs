// Identity provider types

use serde::{Deserialize, Serialize};

/// Identity as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentityUser {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl IdentityUser {
    /// Best-effort (first, last) name, falling back to splitting the display name
    pub fn names(&self) -> (String, String) {
        if self.first_name.is_some() || self.last_name.is_some() {
            return (
                self.first_name.clone().unwrap_or_default(),
                self.last_name.clone().unwrap_or_default(),
            );
        }
        match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => match name.split_once(' ') {
                Some((first, last)) => (first.to_string(), last.trim().to_string()),
                None => (name.to_string(), String::new()),
            },
            _ => (String::new(), String::new()),
        }
    }
}

/// Result of any credential-producing provider call
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub id_token: String,
    pub refresh_token: Option<String>,
    /// Token lifetime in seconds
    pub expires_in: Option<u64>,
    pub user: IdentityUser,
}

/// Social sign-in providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocialProvider {
    Google,
    Apple,
}

impl SocialProvider {
    pub const fn provider_id(&self) -> &'static str {
        match self {
            SocialProvider::Google => "google.com",
            SocialProvider::Apple => "apple.com",
        }
    }
}

/// OAuth credential obtained by the platform sign-in flow
#[derive(Debug, Clone)]
pub struct SocialCredential {
    pub provider: SocialProvider,
    pub id_token: String,
    /// Raw nonce used for Apple sign-in
    pub nonce: Option<String>,
}

// ==================================================================================================
// Firebase REST wire types
// ==================================================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PasswordRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub return_secure_token: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IdpRequest {
    pub post_body: String,
    pub request_uri: String,
    pub return_secure_token: bool,
    pub return_idp_credential: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OobCodeRequest<'a> {
    pub request_type: &'a str,
    pub email: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeleteAccountRequest<'a> {
    pub id_token: &'a str,
}

/// Response of signInWithPassword, signUp and signInWithIdp
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SignInResponse {
    pub id_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<String>,
    pub local_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Response of the secure token refresh grant (snake_case on the wire)
#[derive(Deserialize)]
pub(crate) struct RefreshResponse {
    pub id_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Deserialize)]
pub(crate) struct ErrorBody {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_prefers_explicit_fields() {
        let user = IdentityUser {
            first_name: Some("Grace".to_string()),
            last_name: Some("Hopper".to_string()),
            display_name: Some("Amazing Grace".to_string()),
            ..Default::default()
        };
        assert_eq!(user.names(), ("Grace".to_string(), "Hopper".to_string()));
    }

    #[test]
    fn test_names_splits_display_name() {
        let user = IdentityUser {
            display_name: Some("Ada King Lovelace".to_string()),
            ..Default::default()
        };
        assert_eq!(
            user.names(),
            ("Ada".to_string(), "King Lovelace".to_string())
        );

        let mononym = IdentityUser {
            display_name: Some("Cher".to_string()),
            ..Default::default()
        };
        assert_eq!(mononym.names(), ("Cher".to_string(), String::new()));
        assert_eq!(
            IdentityUser::default().names(),
            (String::new(), String::new())
        );
    }

    #[test]
    fn test_social_provider_ids() {
        assert_eq!(SocialProvider::Google.provider_id(), "google.com");
        assert_eq!(SocialProvider::Apple.provider_id(), "apple.com");
        let parsed: SocialProvider = serde_json::from_str("\"apple\"").unwrap();
        assert_eq!(parsed, SocialProvider::Apple);
    }
}
