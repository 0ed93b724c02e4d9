//! HTTP side of strategy authentication.
//!
//! Requests under `/<authPath>/<provider>` (initiation) and
//! `/<authPath>/<provider>/callback` run the provider's strategy. Completed
//! flows answer with a tiny page that relays the result to the window that
//! opened the login popup.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Form, Json,
    extract::{FromRequest, Query, Request, State},
    http::{StatusCode, header::CONTENT_TYPE, header::LOCATION},
    middleware::Next,
    response::{Html, IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, instrument};

use crate::error::{Result, StrategyError};
use crate::passport::ApolloPassport;
use crate::strategy::{AuthOutcome, AuthRequest};

/// Prefix the opener window looks for in relayed messages.
pub const POPUP_PREFIX: &str = "apolloPassport ";

/// Outcome relayed to the opener window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthResult {
    Success {
        token: String,
        #[serde(rename = "userId")]
        user_id: Value,
    },
    Failure {
        error: Value,
    },
}

/// What the bridge should do with an authentication attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthFlow {
    /// The flow finished; relay the result.
    Complete(AuthResult),
    /// Send the browser elsewhere, typically to the provider.
    Redirect(String),
}

/// HTML page posting `data` to `window.opener`.
///
/// The posted string is exactly [`POPUP_PREFIX`] followed by the JSON
/// encoding of `data`; it is escaped only for the single-quoted script
/// literal that carries it.
pub fn popup_script<T: Serialize>(data: &T) -> serde_json::Result<String> {
    let json = escape_script_literal(&serde_json::to_string(data)?);
    Ok(format!(
        "<html><body><script>\n\
         window.opener.postMessage('{POPUP_PREFIX}{json}', window.location.origin);\n\
         window.close();\n\
         </script></body></html>"
    ))
}

/// Escape text for a single-quoted JS string inside an inline `<script>`.
fn escape_script_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '<' => out.push_str("\\u003c"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

/// Provider segment of an auth route, if `path` is one.
fn match_auth_route<'a>(auth_path: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix('/')?;
    let rest = if auth_path.is_empty() {
        rest
    } else {
        rest.strip_prefix(auth_path)?.strip_prefix('/')?
    };
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    let provider = match rest.split_once('/') {
        Some((provider, "callback")) => provider,
        Some(_) => return None,
        None => rest,
    };
    (!provider.is_empty()).then_some(provider)
}

impl ApolloPassport {
    /// Run the strategy serving `provider` against a request.
    ///
    /// Failed logins are a completed flow with an `error`; only strategy or
    /// token errors are returned as `Err`.
    #[instrument(skip(self, request))]
    pub async fn ap_authenticate(&self, provider: &str, request: &AuthRequest) -> Result<AuthFlow> {
        let registry = self.registry();
        let descriptor = registry
            .for_provider(provider)
            .ok_or_else(|| StrategyError::UnknownStrategy(provider.to_string()))?;

        let authenticator = match registry.authenticator(descriptor.name()) {
            Some(authenticator) => authenticator.clone(),
            None => self
                .instance()
                .transport()
                .authenticate(descriptor.name(), descriptor.options().clone())?,
        };

        let flow = match authenticator.run(request).await? {
            AuthOutcome::Success { user, .. } => {
                let core = self.instance();
                let token = core.create_token_from_user(&user)?;
                let user_id = core.user_id(&user).unwrap_or(Value::Null);
                AuthFlow::Complete(AuthResult::Success { token, user_id })
            }
            AuthOutcome::Fail { info } => {
                let error = match info.get("message") {
                    Some(message) => message.clone(),
                    None => info,
                };
                debug!(provider = %provider, error = %error, "authentication failed");
                AuthFlow::Complete(AuthResult::Failure { error })
            }
            AuthOutcome::Redirect { location } => AuthFlow::Redirect(location),
        };
        Ok(flow)
    }

    /// Whether `path` is an auth route for a registered provider.
    pub fn auth_route_provider<'a>(&self, path: &'a str) -> Option<&'a str> {
        match_auth_route(self.config().auth_path(), path)
            .filter(|provider| self.registry().for_provider(provider).is_some())
    }
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
}

/// Build the strategy's view of an HTTP request.
pub async fn auth_request(req: Request) -> std::result::Result<AuthRequest, Response> {
    let query = Query::<HashMap<String, String>>::try_from_uri(req.uri())
        .map(|Query(query)| query)
        .unwrap_or_default();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let body = if content_type.starts_with("application/json") {
        let Json(body) = Json::<Value>::from_request(req, &())
            .await
            .map_err(IntoResponse::into_response)?;
        body
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(fields) = Form::<HashMap<String, String>>::from_request(req, &())
            .await
            .map_err(IntoResponse::into_response)?;
        serde_json::to_value(fields).unwrap_or_default()
    } else {
        Value::Null
    };

    Ok(AuthRequest {
        method,
        uri,
        headers,
        query,
        body,
    })
}

/// Middleware answering auth routes; everything else goes to `next`.
///
/// A completed flow is answered with the popup page, a redirect with `302`,
/// and any error with `500 Internal server error`.
pub async fn express_middleware(State(passport): State<Arc<ApolloPassport>>, req: Request, next: Next) -> Response {
    let Some(provider) = passport.auth_route_provider(req.uri().path()).map(str::to_string) else {
        return next.run(req).await;
    };

    let request = match auth_request(req).await {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };

    match passport.ap_authenticate(&provider, &request).await {
        Ok(AuthFlow::Complete(result)) => match popup_script(&result) {
            Ok(page) => Html(page).into_response(),
            Err(e) => {
                error!(provider = %provider, error = %e, "failed to render popup page");
                internal_error()
            }
        },
        Ok(AuthFlow::Redirect(location)) => (StatusCode::FOUND, [(LOCATION, location)]).into_response(),
        Err(e) => {
            error!(provider = %provider, error = %e, "authentication failed");
            internal_error()
        }
    }
}
