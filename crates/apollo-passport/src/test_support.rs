//! Shared fixtures for unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::config::PassportOptions;
use crate::error::StrategyError;
use crate::passport::PassportCore;
use crate::strategy::{AuthOutcome, AuthRequest, Strategy, StrategyFactory, StrategyOptions};
use crate::user::{MemoryUserStore, UserRecord};

pub const SECRET: &str = "unit-test-secret-that-is-at-least-32-chars";

pub fn test_options() -> PassportOptions {
    PassportOptions::new()
        .db(Arc::new(MemoryUserStore::new()))
        .jwt_secret(SECRET)
        .root_url("http://localhost:3000")
        .root_url_sources(vec![])
}

pub fn test_core() -> Arc<PassportCore> {
    Arc::new(PassportCore::from_options(test_options()).expect("valid test options"))
}

enum Behavior {
    Authenticate(Option<UserRecord>),
    Redirect(String),
    Error,
}

/// Strategy with a canned outcome.
pub struct FakeStrategy {
    behavior: Behavior,
}

impl FakeStrategy {
    /// Succeeds with `user`, or fails with "fake failure".
    pub fn new(user: Option<UserRecord>) -> Self {
        Self {
            behavior: Behavior::Authenticate(user),
        }
    }

    pub fn redirect(location: &str) -> Self {
        Self {
            behavior: Behavior::Redirect(location.to_string()),
        }
    }

    pub fn failing() -> Self {
        Self {
            behavior: Behavior::Error,
        }
    }
}

#[async_trait]
impl Strategy for FakeStrategy {
    fn name(&self) -> &str {
        "fake"
    }

    async fn authenticate(
        &self,
        _request: &AuthRequest,
        _options: &StrategyOptions,
    ) -> Result<AuthOutcome, StrategyError> {
        match &self.behavior {
            Behavior::Authenticate(Some(user)) => Ok(AuthOutcome::Success {
                user: user.clone(),
                info: None,
            }),
            Behavior::Authenticate(None) => Ok(AuthOutcome::Fail {
                info: json!({ "message": "fake failure" }),
            }),
            Behavior::Redirect(location) => Ok(AuthOutcome::Redirect {
                location: location.clone(),
            }),
            Behavior::Error => Err(StrategyError::Other("provider unreachable".to_string())),
        }
    }
}

/// Factory producing a [`FakeStrategy`] that always fails authentication.
pub fn fake_factory() -> StrategyFactory {
    Arc::new(|_options, _verify| {
        let strategy: Arc<dyn Strategy> = Arc::new(FakeStrategy::new(None));
        Ok(strategy)
    })
}
