// Backend /auth API request and response envelopes

use serde::{Deserialize, Serialize};

use super::session::SessionUser;

/// `{success, user}` envelope returned by register, login and profile calls
#[derive(Debug, Clone, Deserialize)]
pub struct UserEnvelope {
    pub success: bool,
    pub user: Option<SessionUser>,
    pub message: Option<String>,
}

/// `{success, user, stats}` envelope returned by the data export call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportEnvelope {
    pub success: bool,
    pub user: Option<SessionUser>,
    #[serde(default)]
    pub stats: Option<serde_json::Value>,
}

/// Body for POST /auth/register
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub timezone: String,
}

/// Body for PUT /auth/profile; only present fields are changed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.profile_image.is_none()
            && self.timezone.is_none()
    }
}
