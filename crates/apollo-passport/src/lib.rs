//! Authentication for GraphQL APIs.
//!
//! An [`ApolloPassport`] registers pluggable authentication strategies,
//! issues and verifies stateless JWT session tokens, injects the decoded
//! claims into each request's GraphQL context, and binds strategy-provided
//! root resolvers to the authentication instance.
//!
//! ```no_run
//! use std::sync::Arc;
//! use apollo_passport::{ApolloPassport, MemoryUserStore, PassportOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut passport = ApolloPassport::new(
//!     PassportOptions::new()
//!         .db(Arc::new(MemoryUserStore::new()))
//!         .jwt_secret("env:JWT_SECRET")
//!         .root_url("https://app.example.com"),
//! )?;
//! passport.use_module("local")?;
//! let resolvers = passport.resolvers();
//! # let _ = resolvers;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod modules;
pub mod passport;
pub mod resolvers;
pub mod server;
pub mod strategy;
pub mod token;
pub mod user;

#[cfg(test)]
mod test_support;

pub use bridge::{AuthFlow, AuthResult, POPUP_PREFIX, express_middleware, popup_script};
pub use config::{ConfigSource, PassportConfig, PassportOptions, PassportSettings};
pub use context::{ContextWrapper, GraphqlContext, GraphqlOptions, OptionsSource, RequestContext};
pub use error::{ConfigurationError, PassportError, ResolutionError, ResolverError, StrategyError};
pub use modules::{ModuleKind, ModuleResolver, StrategyModule};
pub use passport::{ApolloPassport, PassportCore};
pub use resolvers::{BoundResolverMap, ResolverArgs, ResolverMap, bind_root_queries_and_mutations};
pub use strategy::{
    AuthOutcome, AuthRequest, Strategy, StrategyDescriptor, StrategyInput, StrategyOptions, verify_fn,
};
pub use token::{TokenClaims, TokenService, VerificationError, VerificationErrorKind};
pub use user::{MemoryUserStore, UserRecord, UserStore};
