//! Authentication strategies.
//!
//! A strategy is a pluggable authentication method. It contributes a
//! transport-level [`Strategy`] plus, optionally, GraphQL resolvers and
//! schema fragments. Strategies are registered on an
//! [`ApolloPassport`](crate::ApolloPassport) through the
//! [`StrategyRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, Uri};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StrategyError;
use crate::passport::PassportCore;
use crate::resolvers::ResolverMap;
use crate::user::UserRecord;

pub mod local;
pub mod oauth2;
mod registry;
mod transport;

pub use registry::{StrategyDescriptor, StrategyRegistry, oauth_provider};
pub use transport::{AuthTransport, Authenticator, PassportTransport};

/// Strategy options: a JSON object with typed accessors for the keys the
/// passport itself reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyOptions(Map<String, Value>);

impl StrategyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options from a JSON object. Non-objects yield empty options.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// `callbackURL`.
    pub fn callback_url(&self) -> Option<&str> {
        self.get_str("callbackURL")
    }

    /// `scope`, if present.
    pub fn scope(&self) -> Option<&Value> {
        self.get("scope")
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// What a strategy sees of an incoming request.
#[derive(Debug, Clone, Default)]
pub struct AuthRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    /// Parsed JSON or form body; `Null` when there was none.
    pub body: Value,
}

impl AuthRequest {
    /// A request carrying only a JSON body.
    pub fn with_body(body: Value) -> Self {
        Self {
            method: Method::POST,
            body,
            ..Self::default()
        }
    }

    /// Look a field up in the body, then in the query string.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.body
            .get(name)
            .and_then(Value::as_str)
            .or_else(|| self.query.get(name).map(String::as_str))
    }
}

/// Result of running a strategy against a request.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    /// The request authenticated as `user`.
    Success { user: UserRecord, info: Option<Value> },
    /// Authentication failed; `info` says why.
    Fail { info: Value },
    /// The strategy wants the client sent elsewhere (e.g. an OAuth provider).
    Redirect { location: String },
}

/// A transport-level authentication method.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Strategy name, e.g. `local` or `github`.
    fn name(&self) -> &str;

    /// Authenticate a request.
    async fn authenticate(
        &self,
        request: &AuthRequest,
        options: &StrategyOptions,
    ) -> Result<AuthOutcome, StrategyError>;
}

pub type VerifyFuture = BoxFuture<'static, Result<Option<UserRecord>, StrategyError>>;

/// Verify callback. Receives the authentication instance explicitly.
pub type VerifyFn = Arc<dyn Fn(Arc<PassportCore>, Value) -> VerifyFuture + Send + Sync>;

/// Wrap an async closure as a [`VerifyFn`].
pub fn verify_fn<F, Fut>(f: F) -> VerifyFn
where
    F: Fn(Arc<PassportCore>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<UserRecord>, StrategyError>> + Send + 'static,
{
    Arc::new(move |core, args| Box::pin(f(core, args)))
}

/// A verify function with the authentication instance applied.
#[derive(Clone)]
pub struct BoundVerify {
    instance: Arc<PassportCore>,
    verify: VerifyFn,
}

impl BoundVerify {
    pub fn new(instance: Arc<PassportCore>, verify: VerifyFn) -> Self {
        Self { instance, verify }
    }

    /// Call the verify function.
    pub fn call(&self, args: Value) -> VerifyFuture {
        (self.verify)(Arc::clone(&self.instance), args)
    }

    /// The instance this verify function is bound to.
    pub fn instance(&self) -> &Arc<PassportCore> {
        &self.instance
    }
}

impl fmt::Debug for BoundVerify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundVerify").finish_non_exhaustive()
    }
}

/// Strategy constructor: `new Strategy(options, verify)`.
pub type StrategyFactory =
    Arc<dyn Fn(StrategyOptions, BoundVerify) -> Result<Arc<dyn Strategy>, StrategyError> + Send + Sync>;

/// A self-contained strategy carrying its own GraphQL surface.
pub struct PreBuiltStrategy {
    pub strategy: Arc<dyn Strategy>,
    pub resolvers: ResolverMap,
    pub schema: Vec<String>,
}

/// Constructor for a pre-built strategy, called with the instance and options.
pub type PreBuiltFactory = Arc<
    dyn Fn(Arc<PassportCore>, StrategyOptions) -> Result<PreBuiltStrategy, StrategyError>
        + Send
        + Sync,
>;

/// What a `use` call registers.
#[derive(Clone)]
pub enum StrategyInput {
    /// A strategy constructor plus optional options and verify. Missing
    /// pieces are taken from the strategy's module.
    Basic {
        factory: Option<StrategyFactory>,
        options: Option<StrategyOptions>,
        verify: Option<VerifyFn>,
    },
    /// A pre-built strategy; no default injection happens.
    PreBuilt {
        factory: PreBuiltFactory,
        options: Option<StrategyOptions>,
    },
}

impl StrategyInput {
    /// Everything from the strategy's module.
    pub fn from_module() -> Self {
        Self::Basic {
            factory: None,
            options: None,
            verify: None,
        }
    }

    pub fn basic(factory: StrategyFactory) -> Self {
        Self::Basic {
            factory: Some(factory),
            options: None,
            verify: None,
        }
    }

    pub fn options(self, options: StrategyOptions) -> Self {
        match self {
            Self::Basic { factory, verify, .. } => Self::Basic {
                factory,
                options: Some(options),
                verify,
            },
            Self::PreBuilt { factory, .. } => Self::PreBuilt {
                factory,
                options: Some(options),
            },
        }
    }

    /// Set the verify function. Ignored for pre-built strategies.
    pub fn verify(self, verify: VerifyFn) -> Self {
        match self {
            Self::Basic {
                factory, options, ..
            } => Self::Basic {
                factory,
                options,
                verify: Some(verify),
            },
            other => other,
        }
    }

    pub fn prebuilt(factory: PreBuiltFactory) -> Self {
        Self::PreBuilt {
            factory,
            options: None,
        }
    }
}

impl fmt::Debug for StrategyInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic {
                factory,
                options,
                verify,
            } => f
                .debug_struct("Basic")
                .field("factory", &factory.is_some())
                .field("options", options)
                .field("verify", &verify.is_some())
                .finish(),
            Self::PreBuilt { options, .. } => f
                .debug_struct("PreBuilt")
                .field("options", options)
                .finish_non_exhaustive(),
        }
    }
}
