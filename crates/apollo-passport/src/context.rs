//! Per-request GraphQL context injection.
//!
//! [`ContextWrapper`] wraps whatever produces the GraphQL server options and,
//! when a request carries a bearer token, attaches either the decoded claims
//! (`auth`) or the verification failure (`authError`) to the context.

use std::fmt;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use futures::future::BoxFuture;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::token::{TokenClaims, TokenService, VerificationError};

/// Authentication data visible to resolvers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Decoded claims of a valid bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<TokenClaims>,

    /// Why the presented bearer token was rejected.
    #[serde(default, rename = "authError", skip_serializing_if = "Option::is_none")]
    pub auth_error: Option<VerificationError>,

    /// Application-supplied context values.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

/// Options handed to the GraphQL server for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphqlOptions {
    #[serde(default)]
    pub context: RequestContext,

    #[serde(default, rename = "rootValue", skip_serializing_if = "Value::is_null")]
    pub root_value: Value,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub type OptionsFactory = Arc<dyn Fn(&Parts) -> BoxFuture<'static, GraphqlOptions> + Send + Sync>;

/// Where the per-request options come from.
#[derive(Clone)]
pub enum OptionsSource {
    /// The same options for every request.
    Static(Arc<GraphqlOptions>),
    /// Options built per request.
    Factory(OptionsFactory),
}

impl OptionsSource {
    pub fn fixed(options: GraphqlOptions) -> Self {
        Self::Static(Arc::new(options))
    }

    async fn produce(&self, parts: &Parts) -> Arc<GraphqlOptions> {
        match self {
            Self::Static(options) => Arc::clone(options),
            Self::Factory(factory) => Arc::new(factory(parts).await),
        }
    }
}

impl fmt::Debug for OptionsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(options) => f.debug_tuple("Static").field(options).finish(),
            Self::Factory(_) => f.write_str("Factory(<fn>)"),
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
fn bearer_token(header_value: &str) -> Option<&str> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let token = parts.next().filter(|t| !t.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    Some(token)
}

/// Options source wrapped with bearer-token handling.
#[derive(Clone)]
pub struct ContextWrapper {
    tokens: TokenService,
    options: OptionsSource,
}

impl fmt::Debug for ContextWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextWrapper")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ContextWrapper {
    pub fn new(tokens: TokenService, options: OptionsSource) -> Self {
        Self { tokens, options }
    }

    /// Options for one request.
    ///
    /// Without a usable bearer token the wrapped options are returned as they
    /// are; for a static source that is the very same `Arc`.
    pub async fn call(&self, parts: &Parts) -> Arc<GraphqlOptions> {
        let options = self.options.produce(parts).await;

        let Some(token) = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(bearer_token)
        else {
            return options;
        };

        let mut options = Arc::unwrap_or_clone(options);
        match self.tokens.verify(token) {
            Ok(claims) => {
                debug!("bearer token accepted for userId={:?}", claims.user_id());
                options.context.auth = Some(claims);
                options.context.auth_error = None;
            }
            Err(err) => {
                debug!("bearer token rejected: {}", err);
                options.context.auth = None;
                options.context.auth_error = Some(err);
            }
        }
        Arc::new(options)
    }
}

/// Wrapped options for the current request, as stored by
/// [`inject_graphql_context`].
#[derive(Debug, Clone)]
pub struct GraphqlContext(pub Arc<GraphqlOptions>);

impl<S> FromRequestParts<S> for GraphqlContext
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<GraphqlContext>()
            .cloned()
            .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "GraphQL context not initialized"))
    }
}

/// Build the request's GraphQL options and store them in its extensions.
///
/// Token problems never fail the request; they end up in `authError`.
pub async fn inject_graphql_context(State(wrapper): State<ContextWrapper>, req: Request, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();
    let options = wrapper.call(&parts).await;
    parts.extensions.insert(GraphqlContext(options));
    next.run(Request::from_parts(parts, body)).await
}
