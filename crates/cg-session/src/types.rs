//! Session types

use serde::{Deserialize, Serialize};

/// Cached user profile, kept as the backend sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserProfile(pub serde_json::Value);

impl UserProfile {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn id(&self) -> Option<i64> {
        self.0.get("id").and_then(|v| v.as_i64())
    }

    pub fn username(&self) -> Option<&str> {
        self.0.get("username").and_then(|v| v.as_str())
    }

    pub fn email(&self) -> Option<&str> {
        self.0.get("email").and_then(|v| v.as_str())
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }
}

impl From<serde_json::Value> for UserProfile {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Body returned by the login and token refresh endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Username/password pair posted to the login endpoint
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Point-in-time copy of the session fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expiry_epoch_millis: Option<i64>,
    pub user: Option<UserProfile>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.is_some()
    }
}
