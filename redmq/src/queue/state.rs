//! Queue operational state machine
//!
//! A queue is `Active`, `Paused`, `Locked` or `Stopped`. Which states can be
//! reached from which is fixed by [`STATE_TRANSITION_RULES`]; which
//! operations are legal in which state is fixed by
//! [`QueueOperation::allowed_states`]. Scripts receive the operation's
//! bitmask and check it against the stored state in the same atomic unit as
//! the mutation they perform.

use super::QueueParams;
use crate::context::Context;
use crate::events::Event;
use crate::storage::{now_millis, LuaScript, QueueKeys};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Operational state of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOperationalState {
    /// Every operation is allowed
    Active,
    /// Consumers stop receiving messages; producers may still publish
    Paused,
    /// Administrative lock held by an owner; no produce or consume
    Locked,
    /// Only purge and delete are allowed
    Stopped,
}

impl QueueOperationalState {
    /// All states
    pub const ALL: [QueueOperationalState; 4] = [
        QueueOperationalState::Active,
        QueueOperationalState::Paused,
        QueueOperationalState::Locked,
        QueueOperationalState::Stopped,
    ];

    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Locked => "locked",
            Self::Stopped => "stopped",
        }
    }

    /// Bit of this state in an operation's allowed-state mask
    pub const fn bit(self) -> u8 {
        match self {
            Self::Active => 1,
            Self::Paused => 2,
            Self::Locked => 4,
            Self::Stopped => 8,
        }
    }

    /// States reachable from this one
    pub fn allowed_targets(self) -> &'static [QueueOperationalState] {
        STATE_TRANSITION_RULES
            .iter()
            .find(|(from, _)| *from == self)
            .map(|(_, targets)| *targets)
            .unwrap_or(&[])
    }

    /// Whether `target` is reachable from this state
    pub fn can_transition_to(self, target: QueueOperationalState) -> bool {
        self.allowed_targets().contains(&target)
    }
}

impl fmt::Display for QueueOperationalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueOperationalState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "locked" => Ok(Self::Locked),
            "stopped" => Ok(Self::Stopped),
            other => Err(Error::Validation(format!("unknown queue state '{}'", other))),
        }
    }
}

use QueueOperationalState::{Active, Locked, Paused, Stopped};

/// Static transition table: state -> states reachable from it
pub static STATE_TRANSITION_RULES: &[(QueueOperationalState, &[QueueOperationalState])] = &[
    (Active, &[Paused, Locked, Stopped]),
    (Paused, &[Active, Locked, Stopped]),
    (Locked, &[Active, Stopped]),
    (Stopped, &[Active]),
];

/// Operations gated by the queue's operational state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOperation {
    /// Publish a message
    Produce,
    /// Dequeue a message
    Consume,
    /// Purge a message container
    Purge,
    /// Delete the queue
    Delete,
    /// Set a rate limit
    SetRateLimit,
    /// Clear the rate limit
    ClearRateLimit,
    /// Bind to an exchange
    BindExchange,
    /// Unbind from an exchange
    UnbindExchange,
    /// Create a consumer group
    CreateConsumerGroup,
    /// Delete a consumer group
    DeleteConsumerGroup,
    /// Move an archived message back to pending
    RequeueMessage,
    /// Delete a single message
    DeleteMessage,
}

impl QueueOperation {
    /// All operations
    pub const ALL: [QueueOperation; 12] = [
        QueueOperation::Produce,
        QueueOperation::Consume,
        QueueOperation::Purge,
        QueueOperation::Delete,
        QueueOperation::SetRateLimit,
        QueueOperation::ClearRateLimit,
        QueueOperation::BindExchange,
        QueueOperation::UnbindExchange,
        QueueOperation::CreateConsumerGroup,
        QueueOperation::DeleteConsumerGroup,
        QueueOperation::RequeueMessage,
        QueueOperation::DeleteMessage,
    ];

    /// Operation name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Produce => "produce",
            Self::Consume => "consume",
            Self::Purge => "purge",
            Self::Delete => "delete",
            Self::SetRateLimit => "set_rate_limit",
            Self::ClearRateLimit => "clear_rate_limit",
            Self::BindExchange => "bind_exchange",
            Self::UnbindExchange => "unbind_exchange",
            Self::CreateConsumerGroup => "create_consumer_group",
            Self::DeleteConsumerGroup => "delete_consumer_group",
            Self::RequeueMessage => "requeue_message",
            Self::DeleteMessage => "delete_message",
        }
    }

    /// Bitmask of the states in which the operation is allowed
    pub const fn allowed_states(self) -> u8 {
        const ACTIVE: u8 = Active.bit();
        const PAUSED: u8 = Paused.bit();
        const LOCKED: u8 = Locked.bit();
        const STOPPED: u8 = Stopped.bit();

        match self {
            Self::Produce => ACTIVE | PAUSED,
            Self::Consume => ACTIVE,
            Self::Purge => ACTIVE | PAUSED | LOCKED | STOPPED,
            Self::Delete => ACTIVE | PAUSED | STOPPED,
            Self::SetRateLimit
            | Self::ClearRateLimit
            | Self::BindExchange
            | Self::UnbindExchange
            | Self::CreateConsumerGroup
            | Self::DeleteConsumerGroup
            | Self::RequeueMessage
            | Self::DeleteMessage => ACTIVE | PAUSED | LOCKED,
        }
    }

    /// Mask as passed to scripts
    pub(crate) fn mask_arg(self) -> String {
        self.allowed_states().to_string()
    }
}

impl fmt::Display for QueueOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `operation` may run while a queue is in `state`
pub fn is_operation_allowed(operation: QueueOperation, state: QueueOperationalState) -> bool {
    operation.allowed_states() & state.bit() != 0
}

/// Lock information accompanying a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockInfo {
    /// Owner taking the lock when entering `Locked`
    Owner(String),
    /// Lock id presented when leaving `Locked`
    LockId(String),
}

/// Result of a successful transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStateTransition {
    /// Queue
    pub queue: QueueParams,
    /// State before the transition
    pub from: QueueOperationalState,
    /// State after the transition
    pub to: QueueOperationalState,
    /// Reason given by the caller
    pub reason: Option<String>,
    /// Lock id generated when entering `Locked`
    pub lock_id: Option<String>,
    /// Transition time (ms since epoch)
    pub changed_at: i64,
}

/// Reads and changes queue operational states
#[derive(Debug, Clone)]
pub struct QueueStateManager {
    ctx: Context,
}

impl QueueStateManager {
    /// Create a state manager
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Current state of a queue
    pub async fn get_state(&self, queue: &QueueParams) -> Result<QueueOperationalState> {
        let keys = QueueKeys::new(queue);
        let state = self
            .ctx
            .redis
            .hget(&keys.properties, "state")
            .await?
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
        state.parse()
    }

    /// Move a queue to `target`
    ///
    /// Entering `Locked` requires [`LockInfo::Owner`] and returns the new lock
    /// id in the transition. Leaving `Locked` requires [`LockInfo::LockId`]
    /// matching the stored lock id.
    pub async fn transition(
        &self,
        queue: &QueueParams,
        target: QueueOperationalState,
        reason: Option<&str>,
        lock: Option<LockInfo>,
    ) -> Result<QueueStateTransition> {
        let from = self.get_state(queue).await?;
        if !from.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: from.to_string(),
                to: target.to_string(),
            });
        }

        let (lock_owner, lock_id) = match (target, &lock) {
            (Locked, Some(LockInfo::Owner(owner))) if !owner.is_empty() => {
                (owner.clone(), Uuid::new_v4().to_string())
            }
            (Locked, _) => {
                return Err(Error::Validation(
                    "a lock owner is required to lock a queue".into(),
                ))
            }
            _ => (String::new(), String::new()),
        };

        let presented = match (from, &lock) {
            (Locked, Some(LockInfo::LockId(id))) => id.clone(),
            (Locked, _) => return Err(Error::QueueLocked(queue.to_string())),
            _ => String::new(),
        };

        let keys = QueueKeys::new(queue);
        let now = now_millis();
        self.ctx
            .redis
            .eval_script(
                LuaScript::SetQueueState,
                vec![keys.properties],
                vec![
                    from.as_str().into(),
                    target.as_str().into(),
                    reason.unwrap_or_default().into(),
                    now.to_string().into(),
                    lock_owner.into(),
                    lock_id.clone().into(),
                    presented.into(),
                ],
            )
            .await?
            .check(&queue.to_string(), None)?;

        tracing::info!("Queue {} state changed: {} -> {}", queue, from, target);

        self.ctx.events.emit(Event::QueueStateChanged {
            queue: queue.clone(),
            from,
            to: target,
            reason: reason.map(str::to_string),
        });

        Ok(QueueStateTransition {
            queue: queue.clone(),
            from,
            to: target,
            reason: reason.map(str::to_string),
            lock_id: (target == Locked).then_some(lock_id),
            changed_at: now,
        })
    }

    /// Pause an active queue
    pub async fn pause(&self, queue: &QueueParams, reason: Option<&str>) -> Result<QueueStateTransition> {
        self.transition(queue, Paused, reason, None).await
    }

    /// Resume a paused queue
    pub async fn resume(&self, queue: &QueueParams) -> Result<QueueStateTransition> {
        self.transition(queue, Active, Some("resumed"), None).await
    }

    /// Lock a queue for `owner`, returning the lock id in the transition
    pub async fn lock(
        &self,
        queue: &QueueParams,
        owner: &str,
        reason: Option<&str>,
    ) -> Result<QueueStateTransition> {
        self.transition(queue, Locked, reason, Some(LockInfo::Owner(owner.to_string())))
            .await
    }

    /// Unlock a locked queue with the lock id returned by [`Self::lock`]
    pub async fn unlock(&self, queue: &QueueParams, lock_id: &str) -> Result<QueueStateTransition> {
        self.transition(
            queue,
            Active,
            Some("unlocked"),
            Some(LockInfo::LockId(lock_id.to_string())),
        )
        .await
    }

    /// Stop a queue
    pub async fn stop(&self, queue: &QueueParams, reason: Option<&str>) -> Result<QueueStateTransition> {
        self.transition(queue, Stopped, reason, None).await
    }

    /// Start a stopped queue
    pub async fn start(&self, queue: &QueueParams) -> Result<QueueStateTransition> {
        self.transition(queue, Active, Some("started"), None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        assert!(Active.can_transition_to(Paused));
        assert!(Active.can_transition_to(Locked));
        assert!(Active.can_transition_to(Stopped));
        assert!(Paused.can_transition_to(Active));
        assert!(Paused.can_transition_to(Locked));
        assert!(Locked.can_transition_to(Active));
        assert!(Locked.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Active));

        assert!(!Locked.can_transition_to(Paused));
        assert!(!Stopped.can_transition_to(Paused));
        assert!(!Stopped.can_transition_to(Locked));
        for state in QueueOperationalState::ALL {
            assert!(!state.can_transition_to(state), "{} -> {}", state, state);
        }
    }

    #[test]
    fn test_operation_bitmask_table() {
        use QueueOperation::*;

        let expected: &[(QueueOperation, [bool; 4])] = &[
            // active, paused, locked, stopped
            (Produce, [true, true, false, false]),
            (Consume, [true, false, false, false]),
            (Purge, [true, true, true, true]),
            (Delete, [true, true, false, true]),
            (SetRateLimit, [true, true, true, false]),
            (ClearRateLimit, [true, true, true, false]),
            (BindExchange, [true, true, true, false]),
            (UnbindExchange, [true, true, true, false]),
            (CreateConsumerGroup, [true, true, true, false]),
            (DeleteConsumerGroup, [true, true, true, false]),
            (RequeueMessage, [true, true, true, false]),
            (DeleteMessage, [true, true, true, false]),
        ];

        assert_eq!(expected.len(), QueueOperation::ALL.len());
        for (op, allowed) in expected {
            for (state, allowed) in QueueOperationalState::ALL.iter().zip(allowed) {
                assert_eq!(
                    is_operation_allowed(*op, *state),
                    *allowed,
                    "{} while {}",
                    op,
                    state
                );
            }
        }
    }

    #[test]
    fn test_stopped_and_locked_reject_produce_and_consume() {
        for state in [Locked, Stopped] {
            assert!(!is_operation_allowed(QueueOperation::Produce, state));
            assert!(!is_operation_allowed(QueueOperation::Consume, state));
        }
    }

    #[test]
    fn test_state_round_trip_names() {
        for state in QueueOperationalState::ALL {
            assert_eq!(state.as_str().parse::<QueueOperationalState>().unwrap(), state);
        }
        assert!("running".parse::<QueueOperationalState>().is_err());
    }

    #[test]
    fn test_mask_arg() {
        assert_eq!(QueueOperation::Consume.mask_arg(), "1");
        assert_eq!(QueueOperation::Purge.mask_arg(), "15");
    }
}
