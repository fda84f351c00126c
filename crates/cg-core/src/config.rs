//! Configuration management
//!
//! Configuration is resolved in this order:
//! 1. Environment variables
//! 2. `campusgo.toml` in the working directory
//! 3. Default values
//!
//! `${VAR_NAME}` references inside the config file are expanded from the
//! environment before parsing.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::Error;

/// Default config file name looked up by [`Config::load`]
pub const CONFIG_FILE: &str = "campusgo.toml";

/// What to do when a request is still rejected with 401 after a successful
/// token refresh and one retry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnauthorizedRetryPolicy {
    /// Hand the second response back to the caller unchanged
    #[default]
    ReturnResponse,
    /// Log out and fail with `Error::SessionExpired`
    ExpireSession,
}

impl UnauthorizedRetryPolicy {
    /// Parse a policy name as used in the TOML file and environment
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "return_response" | "return" => Some(Self::ReturnResponse),
            "expire_session" | "expire" | "logout" => Some(Self::ExpireSession),
            _ => None,
        }
    }
}

/// Backend API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the CampusGo backend
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout enforced by the HTTP transport
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Authentication endpoints and token freshness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Token refresh endpoint (POST, bearer refresh token)
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,

    /// Current user profile endpoint (GET, bearer access token)
    #[serde(default = "default_profile_path")]
    pub profile_path: String,

    /// Username/password login endpoint (POST)
    #[serde(default = "default_login_path")]
    pub login_path: String,

    /// A token expiring within this many seconds is refreshed before use
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,

    /// Handling of a 401 on the retried request
    #[serde(default)]
    pub retry_policy: UnauthorizedRetryPolicy,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_path: default_refresh_path(),
            profile_path: default_profile_path(),
            login_path: default_login_path(),
            refresh_margin_secs: default_refresh_margin_secs(),
            retry_policy: UnauthorizedRetryPolicy::default(),
        }
    }
}

/// Durable session storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite key-value database
    #[serde(default = "default_store_path")]
    pub path: String,

    /// Prefix applied to every storage key (e.g. `admin_`)
    #[serde(default)]
    pub key_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            key_prefix: String::new(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_refresh_path() -> String {
    "/api/v1/refresh-token/".to_string()
}

fn default_profile_path() -> String {
    "/api/v1/users/me".to_string()
}

fn default_login_path() -> String {
    "/api/v1/login/".to_string()
}

fn default_refresh_margin_secs() -> u64 {
    300
}

fn default_store_path() -> String {
    "data/campusgo-session.db".to_string()
}

/// Main configuration for the CampusGo session client
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Backend API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Session storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Expand `${VAR_NAME}` references from the environment.
    ///
    /// Unknown variables expand to an empty string.
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::with_capacity(value.len());
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next();

                let mut var_name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// Load configuration from a TOML file.
    ///
    /// Environment variables still take precedence over file values.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();

        let toml_content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut cfg = Self::from_toml_str(&toml_content)?;
        cfg.apply_env_overrides();

        Ok(cfg)
    }

    /// Parse configuration from TOML text without environment overrides
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let expanded_content = Self::expand_env_vars(content);

        let toml: TomlConfig = toml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?;

        Self::from_toml_config(toml)
    }

    /// Load configuration from the default location.
    ///
    /// Uses `./campusgo.toml` when present, otherwise the environment only.
    pub fn load() -> crate::Result<Self> {
        if Path::new(CONFIG_FILE).exists() {
            return Self::from_toml_file(CONFIG_FILE);
        }

        Self::from_env()
    }

    /// Build a `Config` from the parsed TOML structure
    fn from_toml_config(toml: TomlConfig) -> crate::Result<Self> {
        let api = toml.api.unwrap_or_default();
        let api_config = ApiConfig {
            base_url: api.base_url.unwrap_or_else(default_base_url),
            request_timeout_secs: api
                .request_timeout_secs
                .unwrap_or_else(default_request_timeout_secs),
        };

        let auth = toml.auth.unwrap_or_default();
        let retry_policy = match auth.retry_policy {
            Some(name) => UnauthorizedRetryPolicy::parse(&name)
                .ok_or_else(|| Error::Config(format!("Unknown retry_policy: {}", name)))?,
            None => UnauthorizedRetryPolicy::default(),
        };
        let auth_config = AuthConfig {
            refresh_path: auth.refresh_path.unwrap_or_else(default_refresh_path),
            profile_path: auth.profile_path.unwrap_or_else(default_profile_path),
            login_path: auth.login_path.unwrap_or_else(default_login_path),
            refresh_margin_secs: auth
                .refresh_margin_secs
                .unwrap_or_else(default_refresh_margin_secs),
            retry_policy,
        };

        let storage = toml.storage.unwrap_or_default();
        let storage_config = StorageConfig {
            path: storage.path.unwrap_or_else(default_store_path),
            key_prefix: storage.key_prefix.unwrap_or_default(),
        };

        Ok(Config {
            api: api_config,
            auth: auth_config,
            storage: storage_config,
        })
    }

    /// Override values from `CAMPUSGO_*` environment variables
    fn apply_env_overrides(&mut self) {
        if let Ok(base_url) = std::env::var("CAMPUSGO_API_BASE_URL") {
            if !base_url.is_empty() {
                self.api.base_url = base_url;
            }
        }
        if let Ok(secs) = std::env::var("CAMPUSGO_REQUEST_TIMEOUT_SECS") {
            if let Ok(s) = secs.parse() {
                self.api.request_timeout_secs = s;
            }
        }

        if let Ok(path) = std::env::var("CAMPUSGO_REFRESH_PATH") {
            self.auth.refresh_path = path;
        }
        if let Ok(path) = std::env::var("CAMPUSGO_PROFILE_PATH") {
            self.auth.profile_path = path;
        }
        if let Ok(path) = std::env::var("CAMPUSGO_LOGIN_PATH") {
            self.auth.login_path = path;
        }
        if let Ok(secs) = std::env::var("CAMPUSGO_REFRESH_MARGIN_SECS") {
            if let Ok(s) = secs.parse() {
                self.auth.refresh_margin_secs = s;
            }
        }
        if let Ok(policy) = std::env::var("CAMPUSGO_RETRY_POLICY") {
            match UnauthorizedRetryPolicy::parse(&policy) {
                Some(p) => self.auth.retry_policy = p,
                None => tracing::warn!("Ignoring unknown CAMPUSGO_RETRY_POLICY: {}", policy),
            }
        }

        if let Ok(path) = std::env::var("CAMPUSGO_STORE_PATH") {
            self.storage.path = path;
        }
        if let Ok(prefix) = std::env::var("CAMPUSGO_KEY_PREFIX") {
            self.storage.key_prefix = prefix;
        }
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> crate::Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Join an endpoint path onto the configured base URL
    pub fn endpoint_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.api.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Full URL of the token refresh endpoint
    pub fn refresh_url(&self) -> String {
        self.endpoint_url(&self.auth.refresh_path)
    }

    /// Full URL of the current user profile endpoint
    pub fn profile_url(&self) -> String {
        self.endpoint_url(&self.auth.profile_path)
    }

    /// Full URL of the login endpoint
    pub fn login_url(&self) -> String {
        self.endpoint_url(&self.auth.login_path)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.auth.refresh_margin_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }
}

// ============================================================================
// TOML file structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    api: Option<TomlApiConfig>,
    auth: Option<TomlAuthConfig>,
    storage: Option<TomlStorageConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlApiConfig {
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlAuthConfig {
    #[serde(default)]
    refresh_path: Option<String>,
    #[serde(default)]
    profile_path: Option<String>,
    #[serde(default)]
    login_path: Option<String>,
    #[serde(default)]
    refresh_margin_secs: Option<u64>,
    /// "return_response" or "expire_session"
    #[serde(default)]
    retry_policy: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlStorageConfig {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    key_prefix: Option<String>,
}
