//! Redis client wrapper
//!
//! Provides type-safe Redis operation interfaces over a shared `fred` pool.

use super::scripts::{LuaScript, ScriptReply, ScriptRunner};
use crate::Result;
use fred::{
    interfaces::*,
    prelude::*,
    types::{Expiration, RedisConfig as FredRedisConfig, ReconnectPolicy, SetOptions},
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Redis connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
        }
    }
}

/// Redis client
#[derive(Clone)]
pub struct RedisClient {
    pool: Arc<RedisPool>,
    scripts: Arc<ScriptRunner>,
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl RedisClient {
    /// Create a new Redis client
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        let redis_config = FredRedisConfig::from_url(&config.url)?;
        let pool = RedisPool::new(
            redis_config,
            None,
            None,
            Some(ReconnectPolicy::default()),
            config.pool_size,
        )?;

        pool.init().await?;

        Ok(Self {
            pool: Arc::new(pool),
            scripts: Arc::new(ScriptRunner::new()),
        })
    }

    /// Create client from connection URL
    pub async fn from_url(url: impl Into<String>) -> Result<Self> {
        Self::new(&RedisConfig {
            url: url.into(),
            ..RedisConfig::default()
        })
        .await
    }

    /// Get the underlying Redis connection pool
    pub fn pool(&self) -> &Arc<RedisPool> {
        &self.pool
    }

    /// Close every pooled connection
    pub async fn quit(&self) -> Result<()> {
        self.pool.quit().await?;
        Ok(())
    }

    /// Ping Redis
    pub async fn ping(&self) -> Result<String> {
        let result: String = self.pool.ping().await?;
        Ok(result)
    }

    /// Get Value
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let result: Option<String> = self.pool.get(key).await?;
        Ok(result)
    }

    /// Set Key-Value expiring after `millis`
    pub async fn set_px(&self, key: &str, value: &str, millis: u64) -> Result<()> {
        let _: () = self
            .pool
            .set(key, value, Some(Expiration::PX(millis as i64)), None, false)
            .await?;
        Ok(())
    }

    /// Set Key-Value only if absent, expiring after `millis`
    ///
    /// Returns `true` when the key was set.
    pub async fn set_nx_px(&self, key: &str, value: &str, millis: u64) -> Result<bool> {
        let result: Option<String> = self
            .pool
            .set(
                key,
                value,
                Some(Expiration::PX(millis as i64)),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        Ok(result.is_some())
    }

    /// Delete Keys
    pub async fn del(&self, keys: Vec<String>) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let result: usize = self.pool.del(keys).await?;
        Ok(result)
    }

    /// Check if Key exists
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let result: bool = self.pool.exists(key).await?;
        Ok(result)
    }

    /// Set expiration time
    pub async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        let result: bool = self.pool.expire(key, seconds as i64).await?;
        Ok(result)
    }

    /// Remaining time to live in milliseconds (-2 missing, -1 no expiry)
    pub async fn pttl(&self, key: &str) -> Result<i64> {
        let result: i64 = self.pool.pttl(key).await?;
        Ok(result)
    }

    /// Hash operation: set fields
    pub async fn hset(&self, key: &str, values: Vec<(RedisKey, RedisValue)>) -> Result<()> {
        let _: u64 = self.pool.hset(key, values).await?;
        Ok(())
    }

    /// Hash operation: get field
    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let result: Option<String> = self.pool.hget(key, field).await?;
        Ok(result)
    }

    /// Hash operation: get all fields
    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, RedisValue>> {
        let result: HashMap<String, RedisValue> = self.pool.hgetall(key).await?;
        Ok(result)
    }

    /// Hash operation: delete field
    pub async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let result: u64 = self.pool.hdel(key, field).await?;
        Ok(result > 0)
    }

    /// Hash operation: increment field
    pub async fn hincrby(&self, key: &str, field: &str, increment: i64) -> Result<i64> {
        let result: i64 = self.pool.hincrby(key, field, increment).await?;
        Ok(result)
    }

    /// Set operation: add
    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let result: u64 = self.pool.sadd(key, member).await?;
        Ok(result > 0)
    }

    /// Set operation: remove
    pub async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let result: u64 = self.pool.srem(key, member).await?;
        Ok(result > 0)
    }

    /// Set operation: all members
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let result: Vec<String> = self.pool.smembers(key).await?;
        Ok(result)
    }

    /// Set operation: check if member exists
    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let result: bool = self.pool.sismember(key, member).await?;
        Ok(result)
    }

    /// Set operation: cardinality
    pub async fn scard(&self, key: &str) -> Result<u64> {
        let result: u64 = self.pool.scard(key).await?;
        Ok(result)
    }

    /// Sorted Set operation: add
    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let values: Vec<(f64, RedisValue)> = vec![(score, member.into())];
        let _: () = self.pool.zadd(key, None, None, false, false, values).await?;
        Ok(())
    }

    /// Sorted Set operation: get by index range
    pub async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let result: Vec<String> = self
            .pool
            .zrange(key, start, stop, None, false, None, false)
            .await?;
        Ok(result)
    }

    /// Sorted Set operation: get by score range, at most `count` members
    pub async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        count: Option<i64>,
    ) -> Result<Vec<String>> {
        let limit = count.map(|c| (0, c));
        let result: Vec<String> = self
            .pool
            .zrangebyscore(key, min, max, false, limit)
            .await?;
        Ok(result)
    }

    /// Sorted Set operation: remove
    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let result: u64 = self.pool.zrem(key, member).await?;
        Ok(result > 0)
    }

    /// Sorted Set operation: get cardinality (number of elements)
    pub async fn zcard(&self, key: &str) -> Result<u64> {
        let result: u64 = self.pool.zcard(key).await?;
        Ok(result)
    }

    /// Sorted Set operation: member score
    pub async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let result: Option<f64> = self.pool.zscore(key, member).await?;
        Ok(result)
    }

    /// List operation: right push
    pub async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let result: u64 = self.pool.rpush(key, value).await?;
        Ok(result)
    }

    /// List operation: left push
    pub async fn lpush(&self, key: &str, value: &str) -> Result<u64> {
        let result: u64 = self.pool.lpush(key, value).await?;
        Ok(result)
    }

    /// List operation: get range
    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let result: Vec<String> = self.pool.lrange(key, start, stop).await?;
        Ok(result)
    }

    /// List operation: get length
    pub async fn llen(&self, key: &str) -> Result<u64> {
        let result: u64 = self.pool.llen(key).await?;
        Ok(result)
    }

    /// List operation: remove element
    pub async fn lrem(&self, key: &str, value: &str, count: i64) -> Result<u64> {
        let result: u64 = self.pool.lrem(key, count, value).await?;
        Ok(result)
    }

    /// Load a Lua script into the script cache, returning its SHA1
    pub async fn script_load(&self, source: &str) -> Result<String> {
        let sha: String = self.pool.next().script_load(source).await?;
        Ok(sha)
    }

    /// Run a cached Lua script by SHA1
    pub async fn evalsha(
        &self,
        sha: &str,
        keys: Vec<String>,
        args: Vec<RedisValue>,
    ) -> Result<RedisValue> {
        let result: RedisValue = self.pool.next().evalsha(sha, keys, args).await?;
        Ok(result)
    }

    /// Run one of the named redmq scripts atomically
    pub async fn eval_script(
        &self,
        script: LuaScript,
        keys: Vec<String>,
        args: Vec<RedisValue>,
    ) -> Result<ScriptReply> {
        self.scripts.run(self, script, keys, args).await
    }
}
