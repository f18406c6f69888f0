//! Redis implementation of [`UpdateCache`].
//!
//! The client is built at startup without any I/O; the first cache call
//! opens a [`ConnectionManager`], which reconnects on its own afterwards.

use std::future::Future;
use std::pin::Pin;

use anyhow::Context;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{cache_key, UpdateCache};

pub struct RedisCache {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    ttl_secs: u64,
}

impl RedisCache {
    /// Parse `url`; fails only on a malformed URL.
    pub fn new(url: &str, ttl_secs: u64) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid Redis URL")?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            ttl_secs,
        })
    }

    async fn connection(&self) -> anyhow::Result<ConnectionManager> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                debug!("Connecting to Redis at {}", self.client.get_connection_info().addr);
                self.client
                    .get_connection_manager()
                    .await
                    .context("failed to connect to Redis")
            })
            .await?;
        Ok(connection.clone())
    }
}

impl UpdateCache for RedisCache {
    fn kind(&self) -> &'static str {
        "redis"
    }

    fn check_health(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let pong: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .context("Redis PING failed")?;
            anyhow::ensure!(pong == "PONG", "unexpected PING reply: {pong}");
            Ok(())
        })
    }

    fn get_update(
        &self,
        deployment_key: &str,
        request: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let key = cache_key(deployment_key);
        let field = request.to_string();
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let cached: Option<String> = conn
                .hget(&key, &field)
                .await
                .with_context(|| format!("HGET {key}"))?;
            Ok(cached)
        })
    }

    fn put_update(
        &self,
        deployment_key: &str,
        request: &str,
        body: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = cache_key(deployment_key);
        let field = request.to_string();
        let ttl = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let _: () = redis::pipe()
                .atomic()
                .hset(&key, &field, body)
                .ignore()
                .expire(&key, ttl)
                .ignore()
                .query_async(&mut conn)
                .await
                .with_context(|| format!("HSET {key}"))?;
            Ok(())
        })
    }

    fn invalidate(
        &self,
        deployment_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = cache_key(deployment_key);
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let _: () = conn.del(&key).await.with_context(|| format!("DEL {key}"))?;
            Ok(())
        })
    }
}
