//! Passport errors.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::modules::ModuleKind;

/// Construction-time configuration errors.
///
/// A passport is never built from options that produce one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// No db collaborator was supplied.
    #[error("new ApolloPassport(options) - no options.db")]
    MissingDb,

    /// JWT secret missing or empty.
    #[error("new ApolloPassport(options) - no options.jwtSecret")]
    MissingJwtSecret,

    /// No ROOT_URL from any configured source.
    #[error("no ROOT_URL set; pass it in options, set the global, or export ROOT_URL")]
    MissingRootUrl,

    /// Environment variable not found (for `env:VAR_NAME` syntax).
    #[error("environment variable '{0}' not found (referenced via env:{0})")]
    EnvVarNotFound(String),

    /// Environment variable is empty (for `env:VAR_NAME` syntax).
    #[error("environment variable '{0}' is empty (referenced via env:{0})")]
    EnvVarEmpty(String),
}

/// Strategy module resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// No module is registered under the strategy name or its family.
    #[error("no strategy module registered for '{0}'")]
    UnknownStrategy(String),

    /// The module exists but does not export the requested kind.
    #[error("strategy module '{strategy}' has no '{kind}' export")]
    MissingExport { strategy: String, kind: ModuleKind },

    /// The export exists but holds a different kind of value.
    #[error("strategy module '{strategy}' export '{kind}' has the wrong shape")]
    WrongShape { strategy: String, kind: ModuleKind },
}

/// Errors raised by strategies, verify functions and the transport.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// No strategy registered under this name.
    #[error("unknown authentication strategy '{0}'")]
    UnknownStrategy(String),

    /// The strategy could not be constructed from its options.
    #[error("invalid options for strategy '{name}': {reason}")]
    InvalidOptions { name: String, reason: String },

    /// The request did not carry what the strategy needs.
    #[error("bad authentication request: {0}")]
    BadRequest(String),

    /// The db collaborator failed.
    #[error("db error: {0}")]
    Db(#[from] anyhow::Error),

    /// Anything else the strategy wants to surface.
    #[error("{0}")]
    Other(String),
}

/// Errors returned by GraphQL resolvers.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// Resolver argument missing or of the wrong type.
    #[error("invalid argument '{0}'")]
    InvalidArgument(String),

    /// Resolver requires the authentication instance but was called without it.
    #[error("resolver called without an authentication instance")]
    Unbound,

    /// No resolver at the requested path.
    #[error("no resolver for {0}")]
    NotFound(String),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Token(#[from] crate::token::TokenError),
}

/// Umbrella error for passport operations.
#[derive(Debug, Error)]
pub enum PassportError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Token(#[from] crate::token::TokenError),

    /// A strategy is already registered under this name.
    #[error("strategy '{0}' is already registered")]
    DuplicateStrategy(String),
}

pub type Result<T, E = PassportError> = std::result::Result<T, E>;

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for ResolverError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            ResolverError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
            ResolverError::NotFound(_) => (StatusCode::NOT_FOUND, "resolver_not_found"),
            ResolverError::Unbound => (StatusCode::INTERNAL_SERVER_ERROR, "unbound_resolver"),
            ResolverError::Strategy(StrategyError::BadRequest(_)) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            ResolverError::Strategy(_) => (StatusCode::INTERNAL_SERVER_ERROR, "strategy_error"),
            ResolverError::Token(_) => (StatusCode::INTERNAL_SERVER_ERROR, "token_error"),
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}
