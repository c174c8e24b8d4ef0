//! Server-side Lua scripts
//!
//! Every state change that touches more than one key runs as exactly one
//! script invocation. Scripts are loaded once per client with `SCRIPT LOAD`
//! and invoked by SHA1; a `NOSCRIPT` reply (after a server restart or
//! `SCRIPT FLUSH`) triggers a transparent reload.
//!
//! Each script returns a flat array whose first element is a status code
//! (`OK` or one of the codes mapped in [`ScriptReply::check`]) followed by
//! zero or more string values.

use super::redis::RedisClient;
use crate::queue::state::QueueOperation;
use crate::{Error, Result};
use fred::prelude::RedisValue;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

/// Helpers shared by every script, prepended at load time
const PRELUDE: &str = include_str!("lua/prelude.lua");

/// Named redmq scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaScript {
    /// Register a queue and its namespace
    CreateQueue,
    /// Remove an empty, unbound queue without consumers
    DeleteQueue,
    /// Compare-and-set the operational state of a queue
    SetQueueState,
    /// Set or clear the rate limit of a queue
    SetRateLimit,
    /// Count one unit against the rate limit window
    CheckRateLimit,
    /// Add a consumer group to a PUB_SUB queue
    SaveConsumerGroup,
    /// Remove an empty consumer group
    DeleteConsumerGroup,
    /// Store a message and put it into pending or scheduled
    PublishMessage,
    /// Move the next pending message into a consumer's processing list
    DequeueMessage,
    /// Remove a message from processing and archive or discard it
    AcknowledgeMessage,
    /// Requeue, delay or dead-letter a message taken from processing
    UnacknowledgeMessage,
    /// Move a due scheduled message into pending, or publish a periodic copy
    PublishScheduledMessage,
    /// Move an acknowledged or dead-lettered message back to pending
    RequeueMessage,
    /// Delete a message that is not being processed
    DeleteMessage,
    /// Bind a queue to an exchange
    BindQueue,
    /// Unbind a queue from an exchange
    UnbindQueue,
    /// Delete an exchange without bindings
    DeleteExchange,
    /// Rename a message container to a garbage key for collection
    PurgeContainer,
    /// Reclaim a batch of messages from a garbage key
    CollectGarbage,
    /// Extend a worker lock held with a given token
    ExtendLock,
    /// Release a worker lock held with a given token
    ReleaseLock,
}

impl LuaScript {
    /// Script name, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateQueue => "create_queue",
            Self::DeleteQueue => "delete_queue",
            Self::SetQueueState => "set_queue_state",
            Self::SetRateLimit => "set_rate_limit",
            Self::CheckRateLimit => "check_rate_limit",
            Self::SaveConsumerGroup => "save_consumer_group",
            Self::DeleteConsumerGroup => "delete_consumer_group",
            Self::PublishMessage => "publish_message",
            Self::DequeueMessage => "dequeue_message",
            Self::AcknowledgeMessage => "acknowledge_message",
            Self::UnacknowledgeMessage => "unacknowledge_message",
            Self::PublishScheduledMessage => "publish_scheduled_message",
            Self::RequeueMessage => "requeue_message",
            Self::DeleteMessage => "delete_message",
            Self::BindQueue => "bind_queue",
            Self::UnbindQueue => "unbind_queue",
            Self::DeleteExchange => "delete_exchange",
            Self::PurgeContainer => "purge_container",
            Self::CollectGarbage => "collect_garbage",
            Self::ExtendLock => "extend_lock",
            Self::ReleaseLock => "release_lock",
        }
    }

    fn body(&self) -> &'static str {
        match self {
            Self::CreateQueue => include_str!("lua/create_queue.lua"),
            Self::DeleteQueue => include_str!("lua/delete_queue.lua"),
            Self::SetQueueState => include_str!("lua/set_queue_state.lua"),
            Self::SetRateLimit => include_str!("lua/set_rate_limit.lua"),
            Self::CheckRateLimit => include_str!("lua/check_rate_limit.lua"),
            Self::SaveConsumerGroup => include_str!("lua/save_consumer_group.lua"),
            Self::DeleteConsumerGroup => include_str!("lua/delete_consumer_group.lua"),
            Self::PublishMessage => include_str!("lua/publish_message.lua"),
            Self::DequeueMessage => include_str!("lua/dequeue_message.lua"),
            Self::AcknowledgeMessage => include_str!("lua/acknowledge_message.lua"),
            Self::UnacknowledgeMessage => include_str!("lua/unacknowledge_message.lua"),
            Self::PublishScheduledMessage => include_str!("lua/publish_scheduled_message.lua"),
            Self::RequeueMessage => include_str!("lua/requeue_message.lua"),
            Self::DeleteMessage => include_str!("lua/delete_message.lua"),
            Self::BindQueue => include_str!("lua/bind_queue.lua"),
            Self::UnbindQueue => include_str!("lua/unbind_queue.lua"),
            Self::DeleteExchange => include_str!("lua/delete_exchange.lua"),
            Self::PurgeContainer => include_str!("lua/purge_container.lua"),
            Self::CollectGarbage => include_str!("lua/collect_garbage.lua"),
            Self::ExtendLock => include_str!("lua/extend_lock.lua"),
            Self::ReleaseLock => include_str!("lua/release_lock.lua"),
        }
    }

    /// Full script source, prelude included
    pub fn source(&self) -> String {
        format!("{}\n{}", PRELUDE, self.body())
    }
}

impl fmt::Display for LuaScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded script reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptReply {
    code: String,
    values: Vec<String>,
}

impl ScriptReply {
    /// Build a reply by hand
    pub fn new(code: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            code: code.into(),
            values,
        }
    }

    /// Decode the raw array returned by a script
    pub fn from_value(script: LuaScript, value: RedisValue) -> Result<Self> {
        let items = match value {
            RedisValue::Array(items) => items,
            other => {
                return Err(Error::Script(format!(
                    "{} returned {:?}, expected an array",
                    script, other
                )))
            }
        };

        let mut strings = items.into_iter().map(|v| v.as_string().unwrap_or_default());
        let code = strings
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Script(format!("{} returned an empty reply", script)))?;

        Ok(Self {
            code,
            values: strings.collect(),
        })
    }

    /// Status code
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Whether the script succeeded
    pub fn is_ok(&self) -> bool {
        self.code == "OK"
    }

    /// Value at `index`, if present
    pub fn value(&self, index: usize) -> Option<&str> {
        self.values.get(index).map(String::as_str)
    }

    /// Value at `index` parsed as an integer, 0 when absent
    pub fn int(&self, index: usize) -> i64 {
        self.value(index).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// All values
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Map a failure code to the matching [`Error`]
    ///
    /// `subject` names the entity the script operated on (a queue, message,
    /// exchange or lock); `operation` is the gated queue operation, if any.
    pub fn check(self, subject: &str, operation: Option<QueueOperation>) -> Result<Self> {
        if self.is_ok() {
            return Ok(self);
        }

        let subject = subject.to_string();
        let detail = self.value(0).unwrap_or_default().to_string();
        let err = match self.code.as_str() {
            "QUEUE_NOT_FOUND" => Error::QueueNotFound(subject),
            "QUEUE_EXISTS" => Error::QueueExists(subject),
            "QUEUE_NOT_EMPTY" => Error::QueueNotEmpty(subject),
            "QUEUE_HAS_CONSUMERS" => Error::QueueHasActiveConsumers(subject),
            "QUEUE_HAS_EXCHANGES" => Error::QueueHasBoundExchanges(subject),
            "QUEUE_OPERATION_FORBIDDEN" => Error::ForbiddenOperation {
                queue: subject,
                operation: operation
                    .map(|op| op.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                state: detail,
            },
            "QUEUE_LOCKED" => Error::QueueLocked(subject),
            "STATE_CONFLICT" => Error::StateConflict(subject),
            "CONSUMER_GROUP_NOT_FOUND" => Error::ConsumerGroupNotFound(format!("{}/{}", subject, detail)),
            "CONSUMER_GROUP_NOT_EMPTY" => Error::ConsumerGroupNotEmpty(format!("{}/{}", subject, detail)),
            "CONSUMER_GROUP_NOT_SUPPORTED" => Error::ConsumerGroupNotSupported(subject),
            "MESSAGE_NOT_FOUND" => Error::MessageNotFound(subject),
            "MESSAGE_IN_PROCESS" => Error::MessageInProcess(subject),
            "MESSAGE_NOT_IN_PROCESSING" => Error::MessageNotInProcessing(subject),
            "MESSAGE_NOT_REQUEUABLE" => Error::Validation(format!(
                "message {} cannot be requeued while {}",
                subject, detail
            )),
            "EXCHANGE_NOT_FOUND" => Error::ExchangeNotFound(subject),
            "EXCHANGE_TYPE_MISMATCH" => Error::ExchangeTypeMismatch(format!(
                "{} is a {} exchange",
                subject, detail
            )),
            "EXCHANGE_QUEUE_POLICY_MISMATCH" => Error::ExchangeQueuePolicyMismatch(format!(
                "{} does not accept {} queues",
                subject, detail
            )),
            "EXCHANGE_HAS_BOUND_QUEUES" => Error::ExchangeHasBoundQueues(subject),
            "LOCK_NOT_OWNED" => Error::LockNotAcquired(subject),
            other => Error::Script(format!("unexpected reply {} for {}", other, subject)),
        };
        Err(err)
    }
}

/// Loads scripts on first use and keeps their SHA1 digests
#[derive(Debug, Default)]
pub struct ScriptRunner {
    shas: RwLock<HashMap<LuaScript, String>>,
}

impl ScriptRunner {
    /// Create an empty runner
    pub fn new() -> Self {
        Self::default()
    }

    async fn sha(&self, redis: &RedisClient, script: LuaScript) -> Result<String> {
        if let Some(sha) = self.shas.read().await.get(&script) {
            return Ok(sha.clone());
        }
        self.load(redis, script).await
    }

    async fn load(&self, redis: &RedisClient, script: LuaScript) -> Result<String> {
        let sha = redis.script_load(&script.source()).await?;
        tracing::debug!("Loaded script {} ({})", script, sha);
        self.shas.write().await.insert(script, sha.clone());
        Ok(sha)
    }

    /// Invoke `script`, reloading it once if the server lost its cache
    pub async fn run(
        &self,
        redis: &RedisClient,
        script: LuaScript,
        keys: Vec<String>,
        args: Vec<RedisValue>,
    ) -> Result<ScriptReply> {
        let sha = self.sha(redis, script).await?;
        let value = match redis.evalsha(&sha, keys.clone(), args.clone()).await {
            Ok(value) => value,
            Err(Error::Redis(e)) if e.details().contains("NOSCRIPT") => {
                tracing::warn!("Script {} missing from server cache, reloading", script);
                let sha = self.load(redis, script).await?;
                redis.evalsha(&sha, keys, args).await?
            }
            Err(e) => return Err(e),
        };
        ScriptReply::from_value(script, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_include_prelude() {
        for script in [
            LuaScript::PublishMessage,
            LuaScript::DequeueMessage,
            LuaScript::UnacknowledgeMessage,
            LuaScript::ReleaseLock,
        ] {
            let source = script.source();
            assert!(source.contains("local function reply"), "{}", script);
            assert!(source.len() > PRELUDE.len());
        }
    }

    #[test]
    fn test_reply_from_value() {
        let value = RedisValue::Array(vec!["OK".into(), "abc".into(), RedisValue::Integer(3)]);
        let reply = ScriptReply::from_value(LuaScript::DequeueMessage, value).unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.value(0), Some("abc"));
        assert_eq!(reply.int(1), 3);
        assert_eq!(reply.value(2), None);
    }

    #[test]
    fn test_reply_rejects_non_array() {
        let result = ScriptReply::from_value(LuaScript::DequeueMessage, RedisValue::Null);
        assert!(matches!(result, Err(Error::Script(_))));
    }

    #[test]
    fn test_check_maps_codes() {
        let reply = ScriptReply::new("QUEUE_OPERATION_FORBIDDEN", vec!["stopped".into()]);
        match reply.check("orders@shop", Some(QueueOperation::Produce)) {
            Err(Error::ForbiddenOperation { queue, operation, state }) => {
                assert_eq!(queue, "orders@shop");
                assert_eq!(operation, "produce");
                assert_eq!(state, "stopped");
            }
            other => panic!("unexpected {:?}", other),
        }

        let reply = ScriptReply::new("QUEUE_NOT_FOUND", vec![]);
        assert!(matches!(reply.check("q@ns", None), Err(Error::QueueNotFound(_))));

        let reply = ScriptReply::new("WHATEVER", vec![]);
        assert!(matches!(reply.check("q@ns", None), Err(Error::Script(_))));

        let reply = ScriptReply::new("OK", vec!["1".into()]);
        assert_eq!(reply.check("q@ns", None).unwrap().int(0), 1);
    }
}
