//! Redis backing store for `storeguard` (companion crate).
//! Bring your own `redis::aio::ConnectionManager`, or connect from a URL; keys are namespaced
//! under a prefix.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use std::time::Duration;
use storeguard::{BackingStore, StoreError};

#[derive(Clone)]
pub struct RedisStore {
    prefix: String,
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("conn", &"<redis::aio::ConnectionManager>")
            .finish()
    }
}

impl RedisStore {
    /// Wrap an existing connection; keys are stored as `prefix:<key>`.
    ///
    /// # Errors
    /// Returns `Err` if the prefix is empty or contains whitespace or control characters.
    pub fn new(prefix: impl Into<String>, conn: ConnectionManager) -> Result<Self, String> {
        let prefix = prefix.into().trim().trim_end_matches(':').to_string();
        if prefix.is_empty() {
            return Err("prefix cannot be empty".to_string());
        }
        if prefix.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err("prefix cannot contain whitespace or control characters".to_string());
        }
        Ok(Self { prefix, conn })
    }

    /// Open a managed connection to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        tracing::debug!(target: "storeguard::redis", url = %url, "connecting to redis");
        let client = redis::Client::open(url).map_err(store_error)?;
        let conn = ConnectionManager::new(client).await.map_err(store_error)?;
        Self::new(prefix, conn).map_err(StoreError::Protocol)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

/// Connection-level failures are outages; anything else means Redis answered with something
/// unexpected.
fn store_error(err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Protocol(err.to_string())
    }
}

#[async_trait]
impl BackingStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<Vec<u8>>>(self.key(key)).await.map_err(store_error)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        let result = match ttl {
            Some(ttl) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                conn.pset_ex::<_, _, ()>(&key, value, millis).await
            }
            None => conn.set::<_, _, ()>(&key, value).await,
        };
        if let Err(e) = &result {
            tracing::trace!(target: "storeguard::redis", key = %key, error = %e, "redis SET failed");
        }
        result.map_err(store_error)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(self.key(key)).await.map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let reply: String =
            redis::cmd("PING").query_async(&mut conn).await.map_err(store_error)?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Protocol(format!("unexpected PING reply: {reply}")))
        }
    }
}
