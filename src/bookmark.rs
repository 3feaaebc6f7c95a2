//! Causal-consistency bookmarks.

use std::collections::BTreeSet;
use std::sync::Arc;

/// A set of opaque causal-consistency tokens. The server hands one back after
/// each write; passing it into a later BEGIN makes that transaction wait for
/// the write's effects to be visible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bookmark {
    tokens: BTreeSet<String>,
}

impl Bookmark {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_token(token: impl Into<String>) -> Self {
        Self {
            tokens: BTreeSet::from([token.into()]),
        }
    }

    pub fn from_tokens<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn values(&self) -> Vec<String> {
        self.tokens.iter().cloned().collect()
    }

    /// Returns a copy with `token` added. Without an explicit token a fresh
    /// UUID is used, which is handy for tests that only need distinctness.
    pub fn with_token(&self, token: Option<String>) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.insert(token.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()));
        Self { tokens }
    }
}

/// A holder shared by the sessions that must observe each other's writes.
/// After each successful commit the set is replaced with the server-returned
/// token.
#[derive(Debug, Clone, Default)]
pub struct BookmarkHolder {
    inner: Arc<parking_lot::Mutex<Bookmark>>,
}

impl BookmarkHolder {
    pub fn new(bookmark: Bookmark) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(bookmark)),
        }
    }

    pub fn current(&self) -> Bookmark {
        self.inner.lock().clone()
    }

    pub fn replace(&self, bookmark: Bookmark) {
        *self.inner.lock() = bookmark;
    }

    /// Replaces the held set with the single token the server returned.
    pub fn update_from_server(&self, token: impl Into<String>) {
        self.replace(Bookmark::from_token(token));
    }
}
