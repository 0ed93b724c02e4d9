//! Test utilities and common setup.
#![allow(dead_code)]

use std::sync::Arc;

use apollo_passport::server::{AppState, create_router};
use apollo_passport::{
    ApolloPassport, AuthOutcome, AuthRequest, GraphqlOptions, MemoryUserStore, OptionsSource,
    PassportOptions, Strategy, StrategyError, StrategyOptions, UserRecord,
};
use apollo_passport::strategy::StrategyFactory;
use async_trait::async_trait;
use axum::{Router, body::Body, http::Response};
use http_body_util::BodyExt;
use serde_json::{Value, json};

pub const TEST_SECRET: &str = "test-secret-for-integration-tests-minimum-32-chars";

/// Provider strategy with a fixed outcome.
pub enum FakeProvider {
    Succeeds(UserRecord),
    Denies(&'static str),
    Redirects(String),
    Breaks,
}

#[async_trait]
impl Strategy for FakeProvider {
    fn name(&self) -> &str {
        "fake-provider"
    }

    async fn authenticate(
        &self,
        _request: &AuthRequest,
        _options: &StrategyOptions,
    ) -> Result<AuthOutcome, StrategyError> {
        match self {
            Self::Succeeds(user) => Ok(AuthOutcome::Success {
                user: user.clone(),
                info: None,
            }),
            Self::Denies(message) => Ok(AuthOutcome::Fail {
                info: json!({ "message": message }),
            }),
            Self::Redirects(location) => Ok(AuthOutcome::Redirect {
                location: location.clone(),
            }),
            Self::Breaks => Err(StrategyError::Other("provider unreachable".to_string())),
        }
    }
}

fn provider_factory(provider: FakeProvider) -> StrategyFactory {
    let provider: Arc<dyn Strategy> = Arc::new(provider);
    Arc::new(move |_options, _verify| Ok(Arc::clone(&provider)))
}

pub fn test_options() -> PassportOptions {
    PassportOptions::new()
        .db(Arc::new(MemoryUserStore::new()))
        .jwt_secret(TEST_SECRET)
        .root_url("http://localhost:3000")
        .root_url_sources(vec![])
}

/// A passport with `local` plus one fake OAuth provider per outcome:
/// `good`, `denied`, `hostile`, `redirect` and `broken`.
pub fn test_passport() -> ApolloPassport {
    let mut passport = ApolloPassport::new(test_options()).expect("valid test options");
    passport.use_module("local").expect("local strategy");

    let providers = [
        (
            "oauth2:good",
            FakeProvider::Succeeds(
                UserRecord::new()
                    .with("id", "user-good")
                    .with("displayName", "Good User"),
            ),
        ),
        ("oauth2:denied", FakeProvider::Denies("access_denied")),
        (
            "oauth2:hostile",
            FakeProvider::Denies("can't log in</script><script>alert(1)</script>"),
        ),
        (
            "oauth2:redirect",
            FakeProvider::Redirects("https://provider.example.com/authorize".to_string()),
        ),
        ("oauth2:broken", FakeProvider::Breaks),
    ];
    for (name, provider) in providers {
        passport
            .use_with_options(name, provider_factory(provider), StrategyOptions::new())
            .expect("fake provider");
    }
    passport
}

pub fn test_app() -> Router {
    app_for(test_passport())
}

pub fn app_for(passport: ApolloPassport) -> Router {
    let state = AppState::new(
        Arc::new(passport),
        OptionsSource::fixed(GraphqlOptions::default()),
    );
    create_router(state)
}

pub async fn body_string(response: Response<Body>) -> String {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(body.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

/// The JSON payload relayed by a popup page, decoded the way the browser
/// reads the single-quoted script literal.
pub fn popup_payload(page: &str) -> Value {
    let start = page
        .find(apollo_passport::POPUP_PREFIX)
        .expect("popup prefix")
        + apollo_passport::POPUP_PREFIX.len();
    let end = page.rfind("', window.location.origin").expect("payload end");
    serde_json::from_str(&unescape_script_literal(&page[start..end])).unwrap()
}

fn unescape_script_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let code = u32::from_str_radix(&hex, 16).expect("unicode escape");
                out.push(char::from_u32(code).expect("valid char"));
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
