//! Redis-backed response store shared by every node of a deployment.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::{Client, aio::ConnectionManager};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::error::CacheError;
use super::store::ResponseStore;

/// Response store over a Redis connection manager.
///
/// The manager is created on first use and reconnects on its own afterwards.
/// Until Redis answers, every command fails with `CacheError` and
/// `CacheBackend` turns that into a miss.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
}

impl RedisStore {
    /// Validate `url` without touching the network.
    pub fn open(url: &str) -> Result<Self, CacheError> {
        Ok(Self {
            client: Client::open(url)?,
            connection: OnceCell::new(),
        })
    }

    /// Establish the connection now instead of on the first command.
    pub async fn warm_up(&self) -> Result<(), CacheError> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!(target = "quire::cache::redis", "connected to redis response store");
                Ok::<_, CacheError>(manager)
            })
            .await?;
        Ok(connection.clone())
    }
}

#[async_trait]
impl ResponseStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        debug!(key, hit = value.is_some(), "redis get");
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        // Redis rejects EX 0; sub-second TTLs round up to one second.
        let seconds = ttl.as_secs().max(1);
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value.as_ref())
            .arg("EX")
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }
}
