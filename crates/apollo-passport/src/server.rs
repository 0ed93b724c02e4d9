//! Demo HTTP server exposing a passport.

use std::sync::Arc;

use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::{
    Json, Router,
    extract::{Path, State},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::bridge::express_middleware;
use crate::context::{ContextWrapper, GraphqlContext, OptionsSource, inject_graphql_context};
use crate::error::ResolverError;
use crate::passport::ApolloPassport;
use crate::resolvers::{BoundResolverMap, ResolverArgs};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub passport: Arc<ApolloPassport>,
    pub resolvers: Arc<BoundResolverMap>,
    pub context: ContextWrapper,
    pub allowed_origins: Vec<String>,
}

impl AppState {
    /// State for a fully registered passport.
    pub fn new(passport: Arc<ApolloPassport>, options: OptionsSource) -> Self {
        let resolvers = Arc::new(passport.resolvers());
        let context = passport.wrap_options(options);
        Self {
            passport,
            resolvers,
            context,
            allowed_origins: Vec::new(),
        }
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.allowed_origins);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let graphql_routes = Router::new()
        .route("/graphql/schema", get(schema))
        .route("/graphql/{type_name}/{field}", post(call_resolver))
        .layer(middleware::from_fn_with_state(
            state.context.clone(),
            inject_graphql_context,
        ));

    // The callback middleware must see unmatched paths too, so the fallback
    // is installed before it.
    Router::new()
        .route("/health", get(health))
        .merge(graphql_routes)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.passport),
            express_middleware,
        ))
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Schema fragments joined into one document.
pub async fn schema(State(state): State<AppState>) -> String {
    state.passport.schema().join("\n")
}

/// Body of a resolver call.
#[derive(Debug, Default, Deserialize)]
pub struct ResolverCall {
    #[serde(default)]
    pub args: Value,
}

/// Invoke `type_name.field` with the request's GraphQL context.
pub async fn call_resolver(
    State(state): State<AppState>,
    Path((type_name, field)): Path<(String, String)>,
    GraphqlContext(options): GraphqlContext,
    Json(call): Json<ResolverCall>,
) -> Result<Json<Value>, ResolverError> {
    let args = ResolverArgs {
        parent: options.root_value.clone(),
        args: call.args,
        context: options.context.clone(),
    };
    let value = state.resolvers.call(&type_name, &field, args).await?;
    Ok(Json(value))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
    ];

    if allowed_origins.is_empty() {
        tracing::warn!("CORS: No origins configured, allowing default localhost origins");
        return CorsLayer::new()
            .allow_origin([
                HeaderValue::from_static("http://localhost:3000"),
                HeaderValue::from_static("http://localhost:8080"),
            ])
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(true);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        tracing::error!("CORS: All configured origins are invalid, denying cross-origin requests");
        CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")))
    } else {
        tracing::info!("CORS: Allowing {} origin(s)", origins.len());
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(true)
    }
}
