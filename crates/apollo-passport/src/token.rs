//! Stateless session tokens.
//!
//! Tokens are HS256 JWTs signed with the passport's shared secret. The claim
//! set is whatever `map_user_to_jwt_props` produces, plus `iat` and `exp`.

use std::fmt;
use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::user::UserRecord;

/// Fallback id lookup, consulted after `id`, `_id` and `userId`.
pub type UserIdMapper = Arc<dyn Fn(&UserRecord) -> Option<Value> + Send + Sync>;

/// Replacement for the default user-to-claims mapping.
pub type JwtPropsMapper = Arc<dyn Fn(&TokenService, &UserRecord) -> Map<String, Value> + Send + Sync>;

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 30 * 24 * 3600;

/// Errors while issuing tokens.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The claim set has no `userId`.
    #[error("cannot issue a token: no userId could be derived from the user")]
    MissingUserId,

    #[error("failed to sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// Category of a failed verification, named the way JWT clients expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationErrorKind {
    JsonWebTokenError,
    TokenExpiredError,
    NotBeforeError,
}

impl fmt::Display for VerificationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JsonWebTokenError => write!(f, "JsonWebTokenError"),
            Self::TokenExpiredError => write!(f, "TokenExpiredError"),
            Self::NotBeforeError => write!(f, "NotBeforeError"),
        }
    }
}

/// Structured verification failure. Surfaced as data on the request context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{name}: {message}")]
pub struct VerificationError {
    pub name: VerificationErrorKind,
    pub message: String,
}

impl VerificationError {
    fn new(name: VerificationErrorKind, message: impl Into<String>) -> Self {
        Self {
            name,
            message: message.into(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for VerificationError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use VerificationErrorKind::*;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::new(TokenExpiredError, "jwt expired"),
            ErrorKind::ImmatureSignature => Self::new(NotBeforeError, "jwt not active"),
            ErrorKind::InvalidSignature => Self::new(JsonWebTokenError, "invalid signature"),
            ErrorKind::InvalidAlgorithm => Self::new(JsonWebTokenError, "invalid algorithm"),
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => Self::new(JsonWebTokenError, "jwt malformed"),
            _ => Self::new(JsonWebTokenError, err.to_string()),
        }
    }
}

/// Decoded token claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Claims produced by `map_user_to_jwt_props`.
    #[serde(flatten)]
    pub props: Map<String, Value>,

    /// Issued at (as Unix timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Expiration time (as Unix timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl TokenClaims {
    pub fn user_id(&self) -> Option<&Value> {
        self.props.get("userId").filter(|v| !v.is_null())
    }

    pub fn display_name(&self) -> Option<&str> {
        self.props.get("displayName").and_then(Value::as_str)
    }
}

/// Issues and verifies tokens, and maps user records to claims.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
    map_user_to_user_id: Option<UserIdMapper>,
    map_user_to_jwt_props: Option<JwtPropsMapper>,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("ttl", &self.ttl)
            .field("custom_user_id", &self.map_user_to_user_id.is_some())
            .field("custom_jwt_props", &self.map_user_to_jwt_props.is_some())
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
            map_user_to_user_id: None,
            map_user_to_jwt_props: None,
        }
    }

    pub fn with_user_id_mapper(mut self, mapper: UserIdMapper) -> Self {
        self.map_user_to_user_id = Some(mapper);
        self
    }

    pub fn with_jwt_props_mapper(mut self, mapper: JwtPropsMapper) -> Self {
        self.map_user_to_jwt_props = Some(mapper);
        self
    }

    /// Derive the user's identifier.
    ///
    /// Order is fixed: `id`, `_id`, `userId`, then the custom mapper.
    pub fn user_id(&self, user: &UserRecord) -> Option<Value> {
        ["id", "_id", "userId"]
            .into_iter()
            .find_map(|key| user.get(key).cloned())
            .or_else(|| self.map_user_to_user_id.as_ref().and_then(|map| map(user)))
    }

    /// Write `id` onto the record.
    pub fn set_user_id_prop(user: &mut UserRecord, id: Value) {
        user.insert("id", id);
    }

    /// Map a user record to token claims.
    pub fn map_user_to_jwt_props(&self, user: &UserRecord) -> Map<String, Value> {
        match &self.map_user_to_jwt_props {
            Some(mapper) => mapper(self, user),
            None => self.default_jwt_props(user),
        }
    }

    /// `{ userId, displayName }`. `displayName` is omitted when nothing matches.
    pub fn default_jwt_props(&self, user: &UserRecord) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert(
            "userId".to_string(),
            self.user_id(user).unwrap_or(Value::Null),
        );
        if let Some(name) = display_name(user) {
            props.insert("displayName".to_string(), Value::String(name));
        }
        props
    }

    /// Sign the user's claims.
    pub fn create_token_from_user(&self, user: &UserRecord) -> Result<String, TokenError> {
        let props = self.map_user_to_jwt_props(user);
        if props.get("userId").is_none_or(Value::is_null) {
            return Err(TokenError::MissingUserId);
        }
        self.sign(props)
    }

    /// Sign an arbitrary claim set, adding `iat` and `exp`.
    pub fn sign(&self, props: Map<String, Value>) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = TokenClaims {
            props,
            iat: Some(now.timestamp()),
            exp: Some((now + self.ttl).timestamp()),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        debug!("issued token for userId={:?}", claims.user_id());
        Ok(token)
    }

    /// Decode and validate a presented token.
    ///
    /// `exp` is checked when present but not required.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, VerificationError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                warn!("JWT validation failed: {:?}", e);
                VerificationError::from(e)
            })
    }
}

/// `displayName`, then `username`, then the first `services.*.displayName`,
/// then the first email address.
fn display_name(user: &UserRecord) -> Option<String> {
    let non_empty = |v: &Value| v.as_str().filter(|s| !s.is_empty()).map(str::to_string);

    user.get("displayName")
        .and_then(non_empty)
        .or_else(|| user.get("username").and_then(non_empty))
        .or_else(|| {
            user.get("services")
                .and_then(Value::as_object)?
                .values()
                .find_map(|service| service.get("displayName").and_then(non_empty))
        })
        .or_else(|| user.email_addresses().next().map(str::to_string))
}
