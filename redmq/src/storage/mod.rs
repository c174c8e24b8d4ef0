//! Storage layer
//!
//! Provides Redis storage abstraction and implementation.

pub mod keys;
pub mod redis;
pub mod scripts;

pub use keys::{ExchangeKeys, Keys, QueueKeys};
pub use redis::{RedisClient, RedisConfig};
pub use scripts::{LuaScript, ScriptReply};

use crate::{Error, Result};
use chrono::Utc;
use fred::prelude::RedisValue;
use std::collections::HashMap;

/// Current time in milliseconds since the Unix epoch
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Read a string field from an `HGETALL` reply
pub(crate) fn hash_str(hash: &HashMap<String, RedisValue>, field: &str) -> Option<String> {
    hash.get(field)
        .and_then(|v| v.as_string())
        .filter(|s| !s.is_empty())
}

/// Read an integer field from an `HGETALL` reply, 0 when absent
pub(crate) fn hash_i64(hash: &HashMap<String, RedisValue>, field: &str) -> i64 {
    hash_str(hash, field)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Read a binary field from an `HGETALL` reply
pub(crate) fn hash_bytes<'a>(
    hash: &'a HashMap<String, RedisValue>,
    field: &str,
) -> Result<&'a [u8]> {
    hash.get(field)
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| Error::Serialization(format!("field '{}' is not bytes", field)))
}
