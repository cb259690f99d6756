//! Coordination store abstraction.
//!
//! Every primitive is a single atomic call against the shared store. Nothing
//! here spans more than one key transactionally; callers that chain calls
//! must tolerate a crash between them.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Stream of expired key names. Ends when the subscription is lost.
pub type ExpirationStream = BoxStream<'static, String>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Set `key` only if absent, with expiry. Returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Unconditional set with expiry
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete `key` only if it currently holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    async fn hash_set(&self, map: &str, field: &str, value: &str) -> Result<()>;

    /// Set `field` only if absent. Returns whether it was written.
    async fn hash_set_if_absent(&self, map: &str, field: &str, value: &str) -> Result<bool>;

    async fn hash_get(&self, map: &str, field: &str) -> Result<Option<String>>;

    async fn hash_get_all(&self, map: &str) -> Result<Vec<(String, String)>>;

    /// Returns whether the field existed
    async fn hash_delete(&self, map: &str, field: &str) -> Result<bool>;

    async fn hash_exists(&self, map: &str, field: &str) -> Result<bool>;

    /// Append to the tail of a list
    async fn list_push(&self, list: &str, value: &str) -> Result<()>;

    /// Remove every occurrence of `value`
    async fn list_remove(&self, list: &str, value: &str) -> Result<()>;

    async fn list_range(&self, list: &str) -> Result<Vec<String>>;

    async fn increment(&self, key: &str) -> Result<i64>;

    async fn decrement(&self, key: &str) -> Result<i64>;

    /// Subscribe to key-expiration notifications
    async fn subscribe_expirations(&self) -> Result<ExpirationStream>;
}
