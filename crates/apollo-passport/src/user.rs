//! User records and the db collaborator contract.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Opaque user record handed out by the db collaborator.
///
/// The passport only ever reads the id fields, `displayName`, `username`,
/// `services.*` and `emails[].address`; everything else is carried through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserRecord(Map<String, Value>);

impl UserRecord {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from a JSON value. Returns `None` for non-objects.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Get a field, treating JSON `null` as absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    /// Get a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Set a field, returning `self` for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set a field in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Addresses from `emails[].address`, in order.
    pub fn email_addresses(&self) -> impl Iterator<Item = &str> {
        self.get("emails")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.get("address").and_then(Value::as_str))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for UserRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// The db collaborator.
///
/// `create_user` and `fetch_user_by_email` are the two capabilities every
/// store must provide; the passport refuses to start without a store.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Persist a new user and return its identifier.
    async fn create_user(&self, user: UserRecord) -> Result<Value>;

    /// Look a user up by one of their email addresses.
    async fn fetch_user_by_email(&self, email: &str) -> Result<Option<UserRecord>>;

    /// Look a user up by identifier. Stores that cannot do this return `None`.
    async fn fetch_user_by_id(&self, _id: &Value) -> Result<Option<UserRecord>> {
        Ok(None)
    }
}

/// In-memory user store.
///
/// Ids are v4 UUID strings written to the record's `id` field.
#[derive(Debug, Clone, Default)]
pub struct MemoryUserStore {
    users: Arc<DashMap<String, UserRecord>>,
    by_email: Arc<DashMap<String, String>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

#[async_trait]
impl UserStore for MemoryUserStore {
    #[instrument(skip(self, user))]
    async fn create_user(&self, mut user: UserRecord) -> Result<Value> {
        let mut emails: Vec<String> = user.email_addresses().map(email_key).collect();
        emails.sort();
        emails.dedup();
        let id = Uuid::new_v4().to_string();

        // Each address is claimed atomically; a lost claim releases the others.
        let mut claimed = Vec::with_capacity(emails.len());
        for email in emails {
            match self.by_email.entry(email) {
                Entry::Occupied(entry) => {
                    let taken = entry.key().clone();
                    drop(entry);
                    for email in &claimed {
                        self.by_email.remove(email);
                    }
                    bail!("Email '{}' is already registered.", taken);
                }
                Entry::Vacant(slot) => {
                    claimed.push(slot.key().clone());
                    slot.insert(id.clone());
                }
            }
        }

        user.insert("id", id.clone());
        self.users.insert(id.clone(), user);
        debug!(user_id = %id, "created user");

        Ok(Value::String(id))
    }

    async fn fetch_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let Some(id) = self.by_email.get(&email_key(email)).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }

    async fn fetch_user_by_id(&self, id: &Value) -> Result<Option<UserRecord>> {
        let Some(id) = id.as_str() else {
            return Ok(None);
        };
        Ok(self.users.get(id).map(|u| u.value().clone()))
    }
}
