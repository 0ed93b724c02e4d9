//! Email/password strategy.
//!
//! Passwords are stored as bcrypt hashes at `services.password.bcrypt` on the
//! user record.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::{AuthOutcome, AuthRequest, BoundVerify, Strategy, StrategyFactory, StrategyOptions, verify_fn};
use crate::error::{ResolverError, StrategyError};
use crate::modules::StrategyModule;
use crate::passport::PassportCore;
use crate::resolvers::{ResolverArgs, ResolverMap, root_resolver};
use crate::token::TokenService;
use crate::user::UserRecord;

pub const NAME: &str = "local";

pub const SCHEMA: &str = r#"extend type RootMutation {
  apCreateUserEmailPassword(email: String!, password: String!): ApLoginResult
  apLoginEmailPassword(email: String!, password: String!): ApLoginResult
}
"#;

const MISSING_CREDENTIALS: &str = "Missing credentials";
const INVALID_LOGIN: &str = "Invalid email or password";
const EMAIL_TAKEN: &str = "Email already registered";

/// The `local` strategy module.
pub fn module() -> StrategyModule {
    StrategyModule::new()
        .index(factory())
        .default_options(default_options())
        .verify(verify_fn(|core, args| async move {
            let email = args.get("email").and_then(Value::as_str).unwrap_or_default();
            let password = args.get("password").and_then(Value::as_str).unwrap_or_default();
            verify_email_password(&core, email, password).await
        }))
        .resolvers(resolvers())
        .schema([SCHEMA])
}

pub fn default_options() -> StrategyOptions {
    StrategyOptions::new()
        .with("usernameField", "email")
        .with("passwordField", "password")
}

pub fn factory() -> StrategyFactory {
    Arc::new(|options, verify| {
        let strategy: Arc<dyn Strategy> = Arc::new(LocalStrategy::new(&options, verify));
        Ok(strategy)
    })
}

/// Reads credentials from the request and hands them to verify.
#[derive(Debug)]
pub struct LocalStrategy {
    username_field: String,
    password_field: String,
    verify: BoundVerify,
}

impl LocalStrategy {
    pub fn new(options: &StrategyOptions, verify: BoundVerify) -> Self {
        Self {
            username_field: options.get_str("usernameField").unwrap_or("email").to_string(),
            password_field: options.get_str("passwordField").unwrap_or("password").to_string(),
            verify,
        }
    }
}

#[async_trait]
impl Strategy for LocalStrategy {
    fn name(&self) -> &str {
        NAME
    }

    async fn authenticate(
        &self,
        request: &AuthRequest,
        _options: &StrategyOptions,
    ) -> Result<AuthOutcome, StrategyError> {
        let (Some(email), Some(password)) = (
            request.param(&self.username_field),
            request.param(&self.password_field),
        ) else {
            return Ok(AuthOutcome::Fail {
                info: json!({ "message": MISSING_CREDENTIALS }),
            });
        };

        match self.verify.call(json!({ "email": email, "password": password })).await? {
            Some(user) => Ok(AuthOutcome::Success { user, info: None }),
            None => Ok(AuthOutcome::Fail {
                info: json!({ "message": INVALID_LOGIN }),
            }),
        }
    }
}

/// Look the user up by email and check the password hash.
pub async fn verify_email_password(
    core: &PassportCore,
    email: &str,
    password: &str,
) -> Result<Option<UserRecord>, StrategyError> {
    if email.is_empty() || password.is_empty() {
        return Ok(None);
    }

    let Some(mut user) = core.db().fetch_user_by_email(email).await? else {
        debug!("no user for email");
        return Ok(None);
    };

    let Some(hash) = user
        .get("services")
        .and_then(|s| s.pointer("/password/bcrypt"))
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        debug!("user has no password set");
        return Ok(None);
    };

    let password = password.to_string();
    let matches = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| StrategyError::Other(format!("password check aborted: {e}")))?
        .map_err(|e| StrategyError::Other(format!("password check failed: {e}")))?;

    if !matches {
        return Ok(None);
    }

    if user.get("id").is_none()
        && let Some(id) = core.user_id(&user)
    {
        TokenService::set_user_id_prop(&mut user, id);
    }
    Ok(Some(user))
}

pub fn resolvers() -> ResolverMap {
    ResolverMap::new().object(
        "RootMutation",
        ResolverMap::new()
            .field("apCreateUserEmailPassword", root_resolver(create_user_email_password))
            .field("apLoginEmailPassword", root_resolver(login_email_password)),
    )
}

fn login_result(token: Option<String>, error: Option<&str>) -> Value {
    json!({ "token": token, "error": error })
}

#[instrument(skip_all)]
async fn create_user_email_password(core: Arc<PassportCore>, args: ResolverArgs) -> Result<Value, ResolverError> {
    let email = args.str_arg("email")?.to_string();
    let password = args.str_arg("password")?.to_string();
    if email.is_empty() || password.is_empty() {
        return Ok(login_result(None, Some(MISSING_CREDENTIALS)));
    }

    if core
        .db()
        .fetch_user_by_email(&email)
        .await
        .map_err(StrategyError::from)?
        .is_some()
    {
        return Ok(login_result(None, Some(EMAIL_TAKEN)));
    }

    let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
        .await
        .map_err(|e| StrategyError::Other(format!("password hashing aborted: {e}")))?
        .map_err(|e| StrategyError::Other(format!("password hashing failed: {e}")))?;

    let mut user = UserRecord::new()
        .with("emails", json!([{ "address": email, "verified": false }]))
        .with("services", json!({ "password": { "bcrypt": hash } }));

    let id = match core.db().create_user(user.clone()).await {
        Ok(id) => id,
        Err(err) => {
            // A concurrent signup may have taken the address since the check above.
            if let Ok(Some(_)) = core.db().fetch_user_by_email(&email).await {
                return Ok(login_result(None, Some(EMAIL_TAKEN)));
            }
            return Err(StrategyError::from(err).into());
        }
    };
    TokenService::set_user_id_prop(&mut user, id);

    let token = core.create_token_from_user(&user)?;
    Ok(login_result(Some(token), None))
}

#[instrument(skip_all)]
async fn login_email_password(core: Arc<PassportCore>, args: ResolverArgs) -> Result<Value, ResolverError> {
    let email = args.str_arg("email")?;
    let password = args.str_arg("password")?;

    match verify_email_password(&core, email, password).await? {
        Some(user) => {
            let token = core.create_token_from_user(&user)?;
            Ok(login_result(Some(token), None))
        }
        None => Ok(login_result(None, Some(INVALID_LOGIN))),
    }
}
