use crate::config::RedisConfig;
use crate::kv::{KvStore, StoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::info;

/// [`KvStore`] backed by a Redis server.
///
/// The connection manager multiplexes commands over one connection and
/// reconnects on failure; each call works on a cheap clone of it.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to the configured Redis server
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())?;
        let manager = ConnectionManager::new(client).await?;

        info!("Connected to Redis");

        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply != "PONG" {
            return Err(StoreError::Unavailable(format!("unexpected PING reply {reply:?}")));
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let added: i64 = conn.zadd(key, member, score).await?;
        Ok(added > 0)
    }

    async fn zrevrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        Ok(conn.zrevrange(key, start, stop).await?)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        Ok(conn.zrangebyscore(key, min, max).await?)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        Ok(conn.zcard(key).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        Ok(conn.sismember(key, member).await?)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        Ok(conn.smembers(key).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        Ok(conn.hset_nx(key, field, value).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        Ok(conn.hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn();
        Ok(conn.hgetall(key).await?)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn.lpush(key, value).await?;
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn.ltrim(key, start, stop).await?;
        Ok(())
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        Ok(conn.lrange(key, start, stop).await?)
    }
}
