//! The underlying authentication transport.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{AuthOutcome, AuthRequest, Strategy, StrategyOptions};
use crate::error::StrategyError;

/// Where strategies are mounted and from which authenticators are made.
pub trait AuthTransport: Send + Sync {
    /// Mount a strategy under `name`, replacing any previous one.
    fn use_strategy(&self, name: &str, strategy: Arc<dyn Strategy>);

    /// Unmount a strategy.
    fn unuse(&self, name: &str);

    /// Prepare an authenticator for the named strategy.
    fn authenticate(
        &self,
        name: &str,
        options: StrategyOptions,
    ) -> Result<Authenticator, StrategyError>;
}

/// A strategy paired with the options it runs under.
#[derive(Clone)]
pub struct Authenticator {
    name: String,
    strategy: Arc<dyn Strategy>,
    options: StrategyOptions,
}

impl Authenticator {
    pub fn new(name: impl Into<String>, strategy: Arc<dyn Strategy>, options: StrategyOptions) -> Self {
        Self {
            name: name.into(),
            strategy,
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &StrategyOptions {
        &self.options
    }

    /// Run the strategy against a request.
    pub async fn run(&self, request: &AuthRequest) -> Result<AuthOutcome, StrategyError> {
        debug!(strategy = %self.name, "authenticating request");
        self.strategy.authenticate(request, &self.options).await
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Default in-process transport.
#[derive(Default, Clone)]
pub struct PassportTransport {
    strategies: Arc<DashMap<String, Arc<dyn Strategy>>>,
}

impl PassportTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }
}

impl fmt::Debug for PassportTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.strategies.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("PassportTransport")
            .field("strategies", &names)
            .finish()
    }
}

impl AuthTransport for PassportTransport {
    fn use_strategy(&self, name: &str, strategy: Arc<dyn Strategy>) {
        self.strategies.insert(name.to_string(), strategy);
    }

    fn unuse(&self, name: &str) {
        self.strategies.remove(name);
    }

    fn authenticate(
        &self,
        name: &str,
        options: StrategyOptions,
    ) -> Result<Authenticator, StrategyError> {
        let strategy = self
            .strategies
            .get(name)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| StrategyError::UnknownStrategy(name.to_string()))?;
        Ok(Authenticator::new(name, strategy, options))
    }
}
