//! Passport configuration.
//!
//! Raw [`PassportOptions`] are validated once, at construction, into an
//! immutable [`PassportConfig`]. Nothing here performs I/O.

use std::fmt;
use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::strategy::AuthTransport;
use crate::token::{DEFAULT_TOKEN_TTL_SECS, JwtPropsMapper, UserIdMapper};
use crate::user::UserStore;

/// Auth path used when none is configured.
pub const DEFAULT_AUTH_PATH: &str = "ap-auth";

/// Name of the ROOT_URL global and environment variable.
pub const ROOT_URL_KEY: &str = "ROOT_URL";

static GLOBALS: Lazy<DashMap<String, String>> = Lazy::new(DashMap::new);

/// Set a process-wide configuration value.
pub fn set_global(key: impl Into<String>, value: impl Into<String>) {
    GLOBALS.insert(key.into(), value.into());
}

/// Remove a process-wide configuration value.
pub fn clear_global(key: &str) {
    GLOBALS.remove(key);
}

/// Read a process-wide configuration value.
pub fn global(key: &str) -> Option<String> {
    GLOBALS.get(key).map(|v| v.value().clone())
}

/// An external place a configuration value may come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Process-wide global set through [`set_global`].
    Global(String),
    /// Environment variable.
    Env(String),
}

impl ConfigSource {
    /// Read the source. Empty values count as unset.
    pub fn read(&self) -> Option<String> {
        let value = match self {
            Self::Global(key) => global(key),
            Self::Env(var) => std::env::var(var).ok(),
        };
        value.filter(|v| !v.is_empty())
    }

    /// Global, then environment, both named `ROOT_URL`.
    pub fn default_root_url_sources() -> Vec<Self> {
        vec![
            Self::Global(ROOT_URL_KEY.to_string()),
            Self::Env(ROOT_URL_KEY.to_string()),
        ]
    }
}

/// First non-empty value: the explicit one, then each source in order.
pub fn resolve_layered(explicit: Option<&str>, sources: &[ConfigSource]) -> Option<String> {
    explicit
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| sources.iter().find_map(ConfigSource::read))
}

/// Resolve a secret, expanding `env:VAR_NAME` syntax.
pub fn resolve_secret(value: Option<&str>) -> Result<Option<String>, ConfigurationError> {
    match value {
        None => Ok(None),
        Some(value) => {
            if let Some(var_name) = value.strip_prefix("env:") {
                match std::env::var(var_name) {
                    Ok(secret) if !secret.is_empty() => Ok(Some(secret)),
                    Ok(_) => Err(ConfigurationError::EnvVarEmpty(var_name.to_string())),
                    Err(_) => Err(ConfigurationError::EnvVarNotFound(var_name.to_string())),
                }
            } else if value.is_empty() {
                Ok(None)
            } else {
                Ok(Some(value.to_string()))
            }
        }
    }
}

/// Serializable subset of the options, as found in config files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassportSettings {
    /// JWT secret for HS256. Accepts `env:VAR_NAME`.
    pub jwt_secret: Option<String>,

    /// Public root URL of the app. Falls back to the ROOT_URL global/env.
    pub root_url: Option<String>,

    /// Path segment under which auth routes live.
    pub auth_path: Option<String>,

    /// Token lifetime in seconds.
    pub token_ttl_secs: Option<i64>,
}

impl PassportSettings {
    /// Generate a random 64-character alphanumeric JWT secret.
    pub fn generate_jwt_secret() -> String {
        use rand::Rng;

        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        const SECRET_LENGTH: usize = 64;

        let mut rng = rand::rng();
        (0..SECRET_LENGTH)
            .map(|_| {
                let idx = rng.random_range(0..CHARSET.len());
                CHARSET[idx] as char
            })
            .collect()
    }
}

/// Raw constructor options.
#[derive(Clone, Default)]
pub struct PassportOptions {
    pub jwt_secret: Option<String>,
    pub db: Option<Arc<dyn UserStore>>,
    pub root_url: Option<String>,
    pub auth_path: Option<String>,
    pub transport: Option<Arc<dyn AuthTransport>>,
    pub token_ttl: Option<Duration>,
    pub map_user_to_user_id: Option<UserIdMapper>,
    pub map_user_to_jwt_props: Option<JwtPropsMapper>,
    /// Sources consulted for ROOT_URL after the explicit value.
    /// `None` means [`ConfigSource::default_root_url_sources`].
    pub root_url_sources: Option<Vec<ConfigSource>>,
}

impl fmt::Debug for PassportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassportOptions")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db.is_some())
            .field("root_url", &self.root_url)
            .field("auth_path", &self.auth_path)
            .field("transport", &self.transport.is_some())
            .field("token_ttl", &self.token_ttl)
            .field("root_url_sources", &self.root_url_sources)
            .finish_non_exhaustive()
    }
}

impl PassportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options from a settings file section.
    pub fn from_settings(settings: &PassportSettings) -> Self {
        Self {
            jwt_secret: settings.jwt_secret.clone(),
            root_url: settings.root_url.clone(),
            auth_path: settings.auth_path.clone(),
            token_ttl: settings.token_ttl_secs.map(Duration::seconds),
            ..Self::default()
        }
    }

    pub fn jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.jwt_secret = Some(secret.into());
        self
    }

    pub fn db(mut self, db: Arc<dyn UserStore>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn root_url(mut self, url: impl Into<String>) -> Self {
        self.root_url = Some(url.into());
        self
    }

    pub fn auth_path(mut self, path: impl Into<String>) -> Self {
        self.auth_path = Some(path.into());
        self
    }

    pub fn transport(mut self, transport: Arc<dyn AuthTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = Some(ttl);
        self
    }

    pub fn map_user_to_user_id(mut self, mapper: UserIdMapper) -> Self {
        self.map_user_to_user_id = Some(mapper);
        self
    }

    pub fn map_user_to_jwt_props(mut self, mapper: JwtPropsMapper) -> Self {
        self.map_user_to_jwt_props = Some(mapper);
        self
    }

    pub fn root_url_sources(mut self, sources: Vec<ConfigSource>) -> Self {
        self.root_url_sources = Some(sources);
        self
    }

    /// Validate into an immutable config plus the collaborators.
    ///
    /// Checks run in order: db, secret, ROOT_URL.
    pub fn validate(self) -> Result<ValidatedOptions, ConfigurationError> {
        let db = self.db.ok_or(ConfigurationError::MissingDb)?;

        let jwt_secret = resolve_secret(self.jwt_secret.as_deref())?
            .ok_or(ConfigurationError::MissingJwtSecret)?;

        let sources = self
            .root_url_sources
            .unwrap_or_else(ConfigSource::default_root_url_sources);
        let root_url = resolve_layered(self.root_url.as_deref(), &sources)
            .ok_or(ConfigurationError::MissingRootUrl)?;
        let root_url = format!("{}/", root_url.trim_end_matches('/'));

        let auth_path = normalize_auth_path(self.auth_path.as_deref());
        let auth_url_root = format!("{root_url}{auth_path}");

        Ok(ValidatedOptions {
            config: PassportConfig {
                jwt_secret,
                root_url,
                auth_path,
                auth_url_root,
                token_ttl: self
                    .token_ttl
                    .unwrap_or_else(|| Duration::seconds(DEFAULT_TOKEN_TTL_SECS)),
            },
            db,
            transport: self.transport,
            map_user_to_user_id: self.map_user_to_user_id,
            map_user_to_jwt_props: self.map_user_to_jwt_props,
        })
    }
}

/// Strip one leading `/`; default when unset.
fn normalize_auth_path(path: Option<&str>) -> String {
    match path {
        Some(path) => path.strip_prefix('/').unwrap_or(path).to_string(),
        None => DEFAULT_AUTH_PATH.to_string(),
    }
}

/// Output of [`PassportOptions::validate`].
pub struct ValidatedOptions {
    pub config: PassportConfig,
    pub db: Arc<dyn UserStore>,
    pub transport: Option<Arc<dyn AuthTransport>>,
    pub map_user_to_user_id: Option<UserIdMapper>,
    pub map_user_to_jwt_props: Option<JwtPropsMapper>,
}

/// Validated, immutable passport configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct PassportConfig {
    jwt_secret: String,
    root_url: String,
    auth_path: String,
    auth_url_root: String,
    token_ttl: Duration,
}

impl fmt::Debug for PassportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassportConfig")
            .field("jwt_secret", &"<redacted>")
            .field("root_url", &self.root_url)
            .field("auth_path", &self.auth_path)
            .field("auth_url_root", &self.auth_url_root)
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}

impl PassportConfig {
    pub fn jwt_secret(&self) -> &str {
        &self.jwt_secret
    }

    /// Always ends with exactly one `/`.
    pub fn root_url(&self) -> &str {
        &self.root_url
    }

    /// Never starts with `/`.
    pub fn auth_path(&self) -> &str {
        &self.auth_path
    }

    /// `root_url + auth_path`.
    pub fn auth_url_root(&self) -> &str {
        &self.auth_url_root
    }

    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    /// `<authUrlRoot>/<provider>/callback`. With an empty auth path the
    /// provider segment follows `ROOT_URL` directly.
    pub fn callback_url(&self, provider: &str) -> String {
        if self.auth_path.is_empty() {
            format!("{}{}/callback", self.root_url, provider)
        } else {
            format!("{}/{}/callback", self.auth_url_root, provider)
        }
    }
}
