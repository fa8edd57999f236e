use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DashError, Result};

/// Opaque account identifier used to tag a participant's presence record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

// Keep tokens out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Resolves credentials to the account that owns a node.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AccountId>;
}

/// Identity provider backed by a fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    accounts: HashMap<String, AccountId>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, token: impl Into<String>, account: AccountId) -> Self {
        self.accounts.insert(token.into(), account);
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AccountId> {
        self.accounts
            .get(&credentials.token)
            .cloned()
            .ok_or_else(|| DashError::Unauthenticated("unknown token".to_string()))
    }
}
