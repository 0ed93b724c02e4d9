//! Defaults shared by OAuth2 providers.
//!
//! Provider strategies themselves come from the application; this module
//! only supplies default options and the find-or-create verify used when a
//! provider is registered without its own.

use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::{StrategyOptions, oauth_provider, verify_fn};
use crate::error::StrategyError;
use crate::modules::StrategyModule;
use crate::passport::PassportCore;
use crate::token::TokenService;
use crate::user::UserRecord;

/// The `oauth2` family module.
pub fn module() -> StrategyModule {
    StrategyModule::new()
        .default_options(StrategyOptions::new())
        .verify(verify_fn(|core, args| async move { find_or_create_user(&core, args).await }))
}

/// Verify arguments: `{ provider, accessToken, refreshToken, profile }`.
/// `provider` may be a bare provider or a full `oauth2:<provider>` name.
pub async fn find_or_create_user(core: &PassportCore, args: Value) -> Result<Option<UserRecord>, StrategyError> {
    let provider = args
        .get("provider")
        .and_then(Value::as_str)
        .map(|p| oauth_provider(p).unwrap_or(p).to_string())
        .ok_or_else(|| StrategyError::BadRequest("oauth2 verify called without a provider".to_string()))?;
    let profile = args.get("profile").cloned().unwrap_or(Value::Null);

    let email = profile
        .pointer("/emails/0/value")
        .and_then(Value::as_str)
        .ok_or_else(|| StrategyError::BadRequest(format!("{provider} profile has no email")))?;

    if let Some(mut user) = core.db().fetch_user_by_email(email).await? {
        debug!(provider = %provider, "existing user for oauth profile");
        if user.get("id").is_none()
            && let Some(id) = core.user_id(&user)
        {
            TokenService::set_user_id_prop(&mut user, id);
        }
        return Ok(Some(user));
    }

    let mut service = Map::new();
    service.insert("id".to_string(), profile.get("id").cloned().unwrap_or(Value::Null));
    if let Some(name) = profile.get("displayName") {
        service.insert("displayName".to_string(), name.clone());
    }
    if let Some(token) = args.get("accessToken") {
        service.insert("accessToken".to_string(), token.clone());
    }

    let mut user = UserRecord::new()
        .with("emails", json!([{ "address": email, "verified": true }]))
        .with("services", json!({ provider.as_str(): service }));
    if let Some(name) = profile.get("displayName").filter(|v| !v.is_null()) {
        user.insert("displayName", name.clone());
    }

    let id = core.db().create_user(user.clone()).await?;
    TokenService::set_user_id_prop(&mut user, id);
    info!(provider = %provider, "created user from oauth profile");
    Ok(Some(user))
}
