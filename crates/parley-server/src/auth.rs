use std::collections::HashMap;

use async_trait::async_trait;
use tracing::warn;

use parley_core::ids::UserId;

/// Resolves a bearer token to the user who holds it.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<UserId>;
}

/// Token table sourced from configuration. Enough for single-box
/// deployments; anything richer sits behind the same trait.
pub struct StaticTokenAuth {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenAuth {
    pub fn new(tokens: HashMap<String, UserId>) -> Self {
        Self { tokens }
    }

    /// One token, one user.
    pub fn single(token: &str, user: &str) -> Self {
        let mut tokens = HashMap::new();
        tokens.insert(token.to_string(), UserId::from_raw(user));
        Self { tokens }
    }

    /// Parse a `token:user,token:user` listing. Malformed entries are
    /// skipped with a warning rather than failing startup.
    pub fn from_spec(spec: &str) -> Self {
        let mut tokens = HashMap::new();
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once(':') {
                Some((token, user)) if !token.is_empty() && !user.is_empty() => {
                    tokens.insert(token.to_string(), UserId::from_raw(user));
                }
                _ => warn!(entry, "ignoring malformed token entry"),
            }
        }
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuth {
    async fn authenticate(&self, token: &str) -> Option<UserId> {
        self.tokens.get(token).cloned()
    }
}
