//! Client authentication contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::RequestCtx;

/// Verifies user credentials presented by a client.
///
/// Implementations must be thread-safe as they are called concurrently from
/// every connection a handler serves.
#[async_trait]
pub trait Auther: Send + Sync {
    /// Returns the client id on success.
    async fn authenticate(&self, ctx: &RequestCtx, user: &str, password: &str) -> Option<String>;
}

#[async_trait]
impl<A: Auther + ?Sized> Auther for Arc<A> {
    #[inline]
    async fn authenticate(&self, ctx: &RequestCtx, user: &str, password: &str) -> Option<String> {
        (**self).authenticate(ctx, user, password).await
    }
}

/// Fixed user/password table. The user name doubles as the client id.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuther {
    users: HashMap<String, String>,
}

impl MemoryAuther {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, U, P>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            users: pairs
                .into_iter()
                .map(|(u, p)| (u.into(), p.into()))
                .collect(),
        }
    }

    pub fn add(&mut self, user: impl Into<String>, password: impl Into<String>) {
        self.users.insert(user.into(), password.into());
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl Auther for MemoryAuther {
    async fn authenticate(&self, _ctx: &RequestCtx, user: &str, password: &str) -> Option<String> {
        // An empty table admits everyone.
        if self.users.is_empty() {
            return Some(user.to_string());
        }
        match self.users.get(user) {
            Some(p) if p == password => Some(user.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checks_password() {
        let auther = MemoryAuther::from_pairs([("alice", "s3cret")]);
        let ctx = RequestCtx::new();
        assert_eq!(
            auther.authenticate(&ctx, "alice", "s3cret").await.as_deref(),
            Some("alice")
        );
        assert!(auther.authenticate(&ctx, "alice", "nope").await.is_none());
        assert!(auther.authenticate(&ctx, "bob", "s3cret").await.is_none());
    }

    #[tokio::test]
    async fn empty_table_admits_all() {
        let auther = MemoryAuther::new();
        assert!(auther.authenticate(&RequestCtx::new(), "x", "").await.is_some());
    }
}
