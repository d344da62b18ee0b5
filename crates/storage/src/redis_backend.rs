//! Redis implementation of [`BlobBackend`].
//!
//! Uses a [`ConnectionManager`], which multiplexes one connection and
//! reconnects on failure; it is cloned per call and shared by every job.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::backend::{BlobBackend, BlobError};

pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect to `redis_url`, e.g. `redis://127.0.0.1:6379/0`.
    pub async fn connect(redis_url: &str) -> Result<Self, BlobError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Blob store connected to Redis");
        Ok(Self { conn })
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

/// Redis expiries are whole seconds; never round down to "no expiry".
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl BlobBackend for RedisBackend {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BlobError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BlobError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn append_list(
        &self,
        key: &str,
        items: &[String],
        ttl: Duration,
    ) -> Result<Vec<String>, BlobError> {
        if items.is_empty() {
            return self.read_list(key).await;
        }

        let mut conn = self.conn.clone();
        let (list,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(items)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .ignore()
            .cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(list)
    }

    async fn read_list(&self, key: &str) -> Result<Vec<String>, BlobError> {
        let mut conn = self.conn.clone();
        let list: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_second_ttl_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(86_400)), 86_400);
    }
}
