//! Background workers
//!
//! Housekeeping that must run somewhere for the broker to make progress:
//! publishing due scheduled messages, recovering messages held by dead
//! consumers and reclaiming purged containers. Every consumer started with
//! background workers runs all three; a per-worker lock in Redis makes sure
//! only one process runs a given pass at a time.
//!
//! Each worker runs as an actor task driven by a timer and by
//! [`WorkerCommand`]s sent over a channel.

pub mod gc;
pub mod lock;
pub mod reaper;
pub mod scheduled;

pub use gc::GarbageCollectorWorker;
pub use lock::WorkerLock;
pub use reaper::ConsumerReaperWorker;
pub use scheduled::ScheduledMessagesWorker;

use crate::context::Context;
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Background worker timings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkersConfig {
    /// Interval of the scheduled messages worker
    pub scheduled_interval: Duration,
    /// Interval of the consumer reaper
    pub reaper_interval: Duration,
    /// Interval of the garbage collector
    pub gc_interval: Duration,
    /// Items handled per queue or container in one pass
    pub batch_size: u64,
    /// Expiry of a worker lock, extended on every pass
    pub lock_ttl: Duration,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            scheduled_interval: Duration::from_secs(1),
            reaper_interval: Duration::from_secs(5),
            gc_interval: Duration::from_secs(5),
            batch_size: 100,
            lock_ttl: Duration::from_secs(30),
        }
    }
}

impl WorkersConfig {
    /// Set the scheduled messages worker interval
    #[must_use]
    pub fn scheduled_interval(mut self, interval: Duration) -> Self {
        self.scheduled_interval = interval;
        self
    }

    /// Set the consumer reaper interval
    #[must_use]
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Set the garbage collector interval
    #[must_use]
    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Set the batch size
    #[must_use]
    pub fn batch_size(mut self, size: u64) -> Self {
        self.batch_size = size;
        self
    }
}

/// A periodic housekeeping job
#[async_trait]
pub trait BackgroundWorker: Send + Sync + 'static {
    /// Name, also naming the worker's lock
    fn name(&self) -> &'static str;

    /// Time between passes
    fn interval(&self) -> Duration;

    /// Run one pass; returns the number of items handled
    async fn work(&self) -> Result<u64>;
}

/// Command sent to a [`WorkerRunner`]
#[derive(Debug)]
pub enum WorkerCommand {
    /// Run a pass now and reply with its result
    RunOnce(oneshot::Sender<Result<u64>>),
    /// Stop the runner
    Shutdown,
}

/// Actor task running one [`BackgroundWorker`]
#[derive(Debug)]
pub struct WorkerRunner {
    name: &'static str,
    commands: mpsc::Sender<WorkerCommand>,
    handle: JoinHandle<()>,
}

impl WorkerRunner {
    /// Start the actor
    pub fn spawn<W: BackgroundWorker>(ctx: Context, worker: W, lock_ttl: Duration) -> Self {
        let name = worker.name();
        let (commands, receiver) = mpsc::channel(8);
        let lock = WorkerLock::new(ctx, name, lock_ttl);
        let handle = tokio::spawn(run_worker(worker, lock, receiver));
        Self {
            name,
            commands,
            handle,
        }
    }

    /// Worker name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run a pass now, outside the timer
    ///
    /// Fails with [`Error::LockNotAcquired`] when another process is
    /// running this worker.
    pub async fn run_once(&self) -> Result<u64> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(WorkerCommand::RunOnce(reply))
            .await
            .map_err(|_| Error::Shutdown)?;
        response.await.map_err(|_| Error::Shutdown)?
    }

    /// Stop the actor after its current pass
    pub async fn shutdown(self) {
        if self.commands.send(WorkerCommand::Shutdown).await.is_err() {
            tracing::debug!("Worker {} already stopped", self.name);
        }
        if let Err(e) = self.handle.await {
            tracing::error!("Worker {} task failed: {}", self.name, e);
        }
    }
}

async fn run_worker<W: BackgroundWorker>(
    worker: W,
    mut lock: WorkerLock,
    mut commands: mpsc::Receiver<WorkerCommand>,
) {
    let name = worker.name();
    let mut timer = tokio::time::interval(worker.interval());
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!("Worker {} started (interval: {:?})", name, worker.interval());

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(WorkerCommand::RunOnce(reply)) => {
                    let result = pass(&worker, &mut lock).await;
                    // caller may have given up waiting
                    let _ = reply.send(result);
                }
                Some(WorkerCommand::Shutdown) | None => break,
            },
            _ = timer.tick() => match pass(&worker, &mut lock).await {
                Ok(0) => {}
                Ok(count) => tracing::debug!("Worker {} handled {} item(s)", name, count),
                Err(Error::LockNotAcquired(_)) => {
                    tracing::trace!("Worker {} is running elsewhere", name);
                }
                Err(e) => tracing::error!("Worker {} pass failed: {}", name, e),
            },
        }
    }

    if let Err(e) = lock.release().await {
        tracing::warn!("Worker {} could not release its lock: {}", name, e);
    }
    tracing::info!("Worker {} stopped", name);
}

async fn pass<W: BackgroundWorker>(worker: &W, lock: &mut WorkerLock) -> Result<u64> {
    lock.acquire_or_extend().await?;
    worker.work().await
}

/// The background workers of one consumer
#[derive(Debug)]
pub struct WorkerManager {
    runners: Vec<WorkerRunner>,
}

impl WorkerManager {
    /// Start the scheduled messages worker, the consumer reaper and the
    /// garbage collector
    pub fn start(ctx: Context, config: &WorkersConfig) -> Self {
        let runners = vec![
            WorkerRunner::spawn(
                ctx.clone(),
                ScheduledMessagesWorker::new(ctx.clone(), config.scheduled_interval, config.batch_size),
                config.lock_ttl,
            ),
            WorkerRunner::spawn(
                ctx.clone(),
                ConsumerReaperWorker::new(ctx.clone(), config.reaper_interval),
                config.lock_ttl,
            ),
            WorkerRunner::spawn(
                ctx.clone(),
                GarbageCollectorWorker::new(ctx, config.gc_interval, config.batch_size),
                config.lock_ttl,
            ),
        ];
        Self { runners }
    }

    /// Names of the running workers
    pub fn names(&self) -> Vec<&'static str> {
        self.runners.iter().map(WorkerRunner::name).collect()
    }

    /// Run one pass of the named worker now
    pub async fn run_once(&self, name: &str) -> Result<u64> {
        let runner = self
            .runners
            .iter()
            .find(|r| r.name() == name)
            .ok_or_else(|| Error::Validation(format!("unknown worker '{}'", name)))?;
        runner.run_once().await
    }

    /// Stop every worker
    pub async fn shutdown(self) {
        for runner in self.runners {
            runner.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workers_config() {
        let config = WorkersConfig::default()
            .scheduled_interval(Duration::from_millis(200))
            .batch_size(10);
        assert_eq!(config.scheduled_interval, Duration::from_millis(200));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
    }
}
