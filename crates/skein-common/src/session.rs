//! Generic session storage traits and utilities.

use async_trait::async_trait;
use miette::Diagnostic;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Errors emitted by session stores.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum SessionStoreError {
    /// Filesystem or I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(skein::session_store::io))]
    Io(#[from] std::io::Error),
    /// Serialization error (e.g., JSON)
    #[error("serialization error: {0}")]
    #[diagnostic(code(skein::session_store::serde))]
    Serde(#[from] serde_json::Error),
    /// Any other error from a backend implementation
    #[error(transparent)]
    #[diagnostic(code(skein::session_store::other))]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

/// Pluggable storage for arbitrary session records.
///
/// The web layer decides how values are encoded (cookies, a database, ...);
/// this crate only ever talks to it through these three calls.
#[async_trait]
pub trait SessionStore<K, T>: Send + Sync
where
    K: Eq + Hash,
    T: Clone,
{
    /// Get the current session if present.
    async fn get(&self, key: &K) -> Option<T>;
    /// Persist the given session.
    async fn set(&self, key: K, session: T) -> Result<(), SessionStoreError>;
    /// Delete the given session.
    async fn del(&self, key: &K) -> Result<(), SessionStoreError>;
}

/// In-memory session store suitable for short-lived sessions and tests.
#[derive(Clone)]
pub struct MemorySessionStore<K, T>(Arc<RwLock<HashMap<K, T>>>);

impl<K, T> Default for MemorySessionStore<K, T> {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(HashMap::new())))
    }
}

impl<K, T> MemorySessionStore<K, T> {
    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.0.read().await.len()
    }

    /// True when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.0.read().await.is_empty()
    }
}

#[async_trait]
impl<K, T> SessionStore<K, T> for MemorySessionStore<K, T>
where
    K: Eq + Hash + Send + Sync,
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Option<T> {
        self.0.read().await.get(key).cloned()
    }
    async fn set(&self, key: K, session: T) -> Result<(), SessionStoreError> {
        self.0.write().await.insert(key, session);
        Ok(())
    }
    async fn del(&self, key: &K) -> Result<(), SessionStoreError> {
        self.0.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_set_get_del() {
        let store: MemorySessionStore<String, u32> = MemorySessionStore::default();
        assert!(store.get(&"a".to_string()).await.is_none());

        store.set("a".to_string(), 1).await.unwrap();
        store.set("a".to_string(), 2).await.unwrap();
        assert_eq!(store.get(&"a".to_string()).await, Some(2));
        assert_eq!(store.len().await, 1);

        store.del(&"a".to_string()).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store: MemorySessionStore<u8, &'static str> = MemorySessionStore::default();
        let other = store.clone();
        store.set(7, "seven").await.unwrap();
        assert_eq!(other.get(&7).await, Some("seven"));
    }
}
