//! Distributed lock of a background worker
//!
//! Only one instance of each background worker runs a pass at a time across
//! every consumer process. The lock is a plain key set with `NX PX` holding
//! a random token; extension and release compare the token in a script.

use crate::context::Context;
use crate::storage::{Keys, LuaScript};
use crate::{Error, Result};
use std::time::Duration;

/// Lock on one background worker
#[derive(Debug)]
pub struct WorkerLock {
    ctx: Context,
    key: String,
    token: String,
    ttl: Duration,
    held: bool,
}

impl WorkerLock {
    /// Create an unheld lock for `worker`
    pub fn new(ctx: Context, worker: &str, ttl: Duration) -> Self {
        Self {
            ctx,
            key: Keys::worker_lock(worker),
            token: uuid::Uuid::new_v4().to_string(),
            ttl,
            held: false,
        }
    }

    /// Whether this instance believes it holds the lock
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Acquire the lock, or extend it when already held
    ///
    /// Fails with [`Error::LockNotAcquired`] when another instance holds it.
    /// A lock that expired under its holder is reported the same way and
    /// may be acquired again on the next call.
    pub async fn acquire_or_extend(&mut self) -> Result<()> {
        if self.held {
            match self.extend().await {
                Ok(()) => return Ok(()),
                Err(Error::LockNotAcquired(_)) => self.held = false,
                Err(e) => return Err(e),
            }
        }
        self.acquire().await
    }

    /// Acquire the lock
    pub async fn acquire(&mut self) -> Result<()> {
        let acquired = self
            .ctx
            .redis
            .set_nx_px(&self.key, &self.token, self.ttl_millis())
            .await?;
        if !acquired {
            return Err(Error::LockNotAcquired(self.key.clone()));
        }
        self.held = true;
        tracing::debug!("Lock {} acquired", self.key);
        Ok(())
    }

    /// Push the expiry of a held lock forward
    pub async fn extend(&self) -> Result<()> {
        self.ctx
            .redis
            .eval_script(
                LuaScript::ExtendLock,
                vec![self.key.clone()],
                vec![
                    self.token.as_str().into(),
                    self.ttl_millis().to_string().into(),
                ],
            )
            .await?
            .check(&self.key, None)?;
        Ok(())
    }

    /// Release the lock if held
    pub async fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        let reply = self
            .ctx
            .redis
            .eval_script(
                LuaScript::ReleaseLock,
                vec![self.key.clone()],
                vec![self.token.as_str().into()],
            )
            .await?;
        if !reply.is_ok() {
            tracing::debug!("Lock {} was no longer held at release", self.key);
        }
        Ok(())
    }

    fn ttl_millis(&self) -> u64 {
        (self.ttl.as_millis() as u64).max(1)
    }
}
