//! Consumer
//!
//! A consumer binds message handlers to queues (and consumer groups of
//! PUB_SUB queues) and, once running, dequeues and handles messages for each
//! binding. Liveness is reported with a [`Heartbeat`]; the background
//! workers run alongside unless disabled.
//!
//! # Examples
//!
//! ```rust,no_run
//! use redmq::{Consumer, ConsumerConfig, Context, RedmqConfig};
//! use redmq::message::MessageEnvelope;
//! use redmq::queue::QueueParams;
//!
//! # async fn example() -> redmq::Result<()> {
//! let ctx = Context::connect(RedmqConfig::default()).await?;
//! let consumer = Consumer::new(ctx, ConsumerConfig::default());
//!
//! consumer
//!     .consume(&QueueParams::new("shop", "orders"), None, |message: MessageEnvelope| async move {
//!         let order: String = message.body()?;
//!         println!("received {}", order);
//!         Ok::<_, redmq::Error>(())
//!     })
//!     .await?;
//!
//! consumer.run().await?;
//! // ...
//! consumer.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod handler;
pub mod heartbeat;
pub mod runner;

pub use handler::MessageHandler;
pub use heartbeat::{Heartbeat, HeartbeatPayload};
pub use runner::{MessageHandlerRunner, StepOutcome};

use crate::context::Context;
use crate::events::{Event, InstanceKind};
use crate::power_switch::PowerSwitch;
use crate::queue::{ConsumerGroups, QueueManager, QueueParams};
use crate::storage::keys::validate_name;
use crate::storage::{Keys, QueueKeys};
use crate::workers::{WorkerManager, WorkersConfig};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Consumer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Drive every handler from a single task, round-robin
    pub multiplexing: bool,
    /// Run the background workers in this consumer
    pub run_background_workers: bool,
    /// Time between heartbeats
    pub heartbeat_interval: Duration,
    /// Expiry of a heartbeat; a consumer silent for longer is offline
    pub heartbeat_ttl: Duration,
    /// Wait before polling an empty queue again
    pub poll_interval: Duration,
    /// Background worker timings
    pub workers: WorkersConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            multiplexing: false,
            run_background_workers: true,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_ttl: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
            workers: WorkersConfig::default(),
        }
    }
}

impl ConsumerConfig {
    /// Create a default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive all handlers from one task
    #[must_use]
    pub fn multiplexing(mut self, enabled: bool) -> Self {
        self.multiplexing = enabled;
        self
    }

    /// Run or skip the background workers
    #[must_use]
    pub fn run_background_workers(mut self, enabled: bool) -> Self {
        self.run_background_workers = enabled;
        self
    }

    /// Set the heartbeat interval and expiry
    #[must_use]
    pub fn heartbeat(mut self, interval: Duration, ttl: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_ttl = ttl;
        self
    }

    /// Set the poll interval
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the background worker timings
    #[must_use]
    pub fn workers(mut self, workers: WorkersConfig) -> Self {
        self.workers = workers;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(Error::Config(
                "heartbeat and poll intervals must be greater than 0".into(),
            ));
        }
        if self.heartbeat_ttl <= self.heartbeat_interval {
            return Err(Error::Config(
                "heartbeat TTL must exceed the heartbeat interval".into(),
            ));
        }
        Ok(())
    }
}

/// A queue, and consumer group, a consumer reads
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConsumedQueue {
    /// Queue
    pub queue: QueueParams,
    /// Consumer group of a PUB_SUB queue
    pub consumer_group: Option<String>,
}

type Registry = Arc<RwLock<BTreeMap<ConsumedQueue, Arc<MessageHandlerRunner>>>>;

fn snapshot(registry: &Registry) -> Vec<Arc<MessageHandlerRunner>> {
    registry
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .cloned()
        .collect()
}

fn registered_queues(registry: &Registry) -> Vec<QueueParams> {
    let mut queues: Vec<QueueParams> = registry
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .map(|k| k.queue.clone())
        .collect();
    queues.dedup();
    queues
}

/// Tasks of a running consumer
struct Running {
    token: CancellationToken,
    runners: HashMap<ConsumedQueue, (CancellationToken, JoinHandle<()>)>,
    multiplexer: Option<JoinHandle<()>>,
    heartbeat: JoinHandle<()>,
    workers: Option<WorkerManager>,
}

struct Inner {
    id: String,
    ctx: Context,
    config: ConsumerConfig,
    power: PowerSwitch,
    registry: Registry,
    running: Mutex<Option<Running>>,
    heartbeat: Heartbeat,
    queues: QueueManager,
    groups: ConsumerGroups,
}

/// Message consumer
///
/// Cloning yields another handle to the same consumer.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.inner.id)
            .field("state", &self.inner.power.state())
            .finish()
    }
}

impl Consumer {
    /// Create a consumer
    pub fn new(ctx: Context, config: ConsumerConfig) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let heartbeat = Heartbeat::new(
            ctx.clone(),
            id.clone(),
            config.heartbeat_interval,
            config.heartbeat_ttl,
        );
        Self {
            inner: Arc::new(Inner {
                queues: QueueManager::new(ctx.clone()),
                groups: ConsumerGroups::new(ctx.clone()),
                power: PowerSwitch::new(),
                registry: Arc::new(RwLock::new(BTreeMap::new())),
                running: Mutex::new(None),
                heartbeat,
                config,
                ctx,
                id,
            }),
        }
    }

    /// Consumer id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether the consumer is running
    pub fn is_running(&self) -> bool {
        self.inner.power.is_up()
    }

    /// Queues with a bound handler, sorted
    pub fn queues(&self) -> Vec<ConsumedQueue> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Bind `handler` to a queue
    ///
    /// PUB_SUB queues require a consumer group, created when missing;
    /// point-to-point queues refuse one. Binding while running starts
    /// consuming right away.
    pub async fn consume<H: MessageHandler>(
        &self,
        queue: &QueueParams,
        consumer_group: Option<&str>,
        handler: H,
    ) -> Result<()> {
        let queue = QueueParams::validated(&queue.namespace, &queue.name)?;
        let properties = self.inner.queues.get_properties(&queue).await?;

        let consumer_group = match (properties.is_pub_sub(), consumer_group) {
            (true, None) => return Err(Error::ConsumerGroupRequired(queue.to_string())),
            (false, Some(_)) => return Err(Error::ConsumerGroupNotSupported(queue.to_string())),
            (false, None) => None,
            (true, Some(group)) => {
                let group = validate_name(group)
                    .map_err(|e| Error::Validation(format!("consumer group: {}", e)))?;
                self.inner.groups.save(&queue, &group).await?;
                Some(group)
            }
        };

        let key = ConsumedQueue {
            queue: queue.clone(),
            consumer_group: consumer_group.clone(),
        };
        let runner = Arc::new(MessageHandlerRunner::new(
            self.inner.ctx.clone(),
            self.inner.id.clone(),
            queue.clone(),
            consumer_group,
            Arc::new(handler),
        ));

        let mut running = self.inner.running.lock().await;
        {
            let mut registry = self
                .inner
                .registry
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if registry.contains_key(&key) {
                return Err(Error::Validation(format!(
                    "consumer {} already consumes {}",
                    self.inner.id, queue
                )));
            }
            registry.insert(key.clone(), Arc::clone(&runner));
        }

        if let Some(running) = running.as_mut() {
            self.inner.heartbeat.register_queue(&queue).await?;
            if !self.inner.config.multiplexing {
                self.spawn_runner(running, key, runner);
            }
        }
        tracing::info!("Consumer {} consuming {}", self.inner.id, queue);
        Ok(())
    }

    /// Remove the handler bound to a queue
    ///
    /// Returns `false` when nothing was bound. A running handler finishes
    /// its current message first.
    pub async fn cancel(&self, queue: &QueueParams, consumer_group: Option<&str>) -> Result<bool> {
        let queue = &QueueParams::validated(&queue.namespace, &queue.name)?;
        let consumer_group = consumer_group
            .map(validate_name)
            .transpose()
            .map_err(|e| Error::Validation(format!("consumer group: {}", e)))?;
        let key = ConsumedQueue {
            queue: queue.clone(),
            consumer_group,
        };

        let mut running = self.inner.running.lock().await;
        let removed = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        let Some(runner) = removed else {
            return Ok(false);
        };

        if let Some(running) = running.as_mut() {
            if let Some((token, handle)) = running.runners.remove(&key) {
                token.cancel();
                if let Err(e) = handle.await {
                    tracing::error!("Runner for {} failed: {}", queue, e);
                }
            }
            self.release_processing(&runner).await;
            if !registered_queues(&self.inner.registry).contains(queue) {
                self.inner.heartbeat.unregister_queue(queue).await?;
            }
        }
        tracing::info!("Consumer {} stopped consuming {}", self.inner.id, queue);
        Ok(true)
    }

    /// Start consuming
    pub async fn run(&self) -> Result<()> {
        self.inner.config.validate()?;
        if !self.inner.power.going_up() {
            return Err(Error::InstanceBusy(format!("consumer {}", self.inner.id)));
        }
        tracing::info!("Consumer {} starting", self.inner.id);
        self.emit(|kind, id| Event::GoingUp { kind, id });

        let mut running = self.inner.running.lock().await;
        match self.start().await {
            Ok(started) => *running = Some(started),
            Err(e) => {
                self.inner.power.rollback();
                self.emit(|kind, id| Event::Error {
                    kind,
                    id,
                    message: e.to_string(),
                });
                return Err(e);
            }
        }
        drop(running);

        self.inner.power.commit();
        tracing::info!("Consumer {} is up", self.inner.id);
        self.emit(|kind, id| Event::Up { kind, id });
        Ok(())
    }

    /// Stop consuming
    ///
    /// Waits for running handlers, stops the heartbeat and the background
    /// workers, then removes the consumer's registrations.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.inner.power.going_down() {
            return Err(Error::InstanceBusy(format!("consumer {}", self.inner.id)));
        }
        tracing::info!("Consumer {} stopping", self.inner.id);
        self.emit(|kind, id| Event::GoingDown { kind, id });

        let running = self.inner.running.lock().await.take();
        if let Some(running) = running {
            self.stop(running).await;
        }

        self.inner.power.commit();
        tracing::info!("Consumer {} is down", self.inner.id);
        self.emit(|kind, id| Event::Down { kind, id });
        Ok(())
    }

    async fn start(&self) -> Result<Running> {
        let inner = &self.inner;
        inner.ctx.redis.ping().await?;
        inner
            .heartbeat
            .register(&registered_queues(&inner.registry))
            .await?;

        let token = CancellationToken::new();
        let failed = CancellationToken::new();

        let registry = Arc::clone(&inner.registry);
        let heartbeat = inner.heartbeat.clone().spawn(
            move || registered_queues(&registry),
            token.clone(),
            failed.clone(),
        );

        let mut running = Running {
            token: token.clone(),
            runners: HashMap::new(),
            multiplexer: None,
            heartbeat,
            workers: None,
        };

        if inner.config.multiplexing {
            let registry = Arc::clone(&inner.registry);
            running.multiplexer = Some(tokio::spawn(runner::run_multiplexed(
                move || snapshot(&registry),
                token.clone(),
                inner.config.poll_interval,
            )));
        } else {
            let entries: Vec<_> = inner
                .registry
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(k, r)| (k.clone(), Arc::clone(r)))
                .collect();
            for (key, runner) in entries {
                self.spawn_runner(&mut running, key, runner);
            }
        }

        if inner.config.run_background_workers {
            running.workers = Some(WorkerManager::start(inner.ctx.clone(), &inner.config.workers));
        }

        // shut down on heartbeat failure
        let consumer = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = failed.cancelled() => {
                    tracing::error!("Consumer {} lost its heartbeat, shutting down", consumer.id());
                    if let Err(e) = consumer.shutdown().await {
                        tracing::error!("Consumer {} shutdown failed: {}", consumer.id(), e);
                    }
                }
                _ = token.cancelled() => {}
            }
        });

        Ok(running)
    }

    fn spawn_runner(
        &self,
        running: &mut Running,
        key: ConsumedQueue,
        runner: Arc<MessageHandlerRunner>,
    ) {
        let token = running.token.child_token();
        let handle = tokio::spawn(runner.run(token.clone(), self.inner.config.poll_interval));
        running.runners.insert(key, (token, handle));
    }

    async fn stop(&self, running: Running) {
        running.token.cancel();
        for (key, (_, handle)) in running.runners {
            if let Err(e) = handle.await {
                tracing::error!("Runner for {} failed: {}", key.queue, e);
            }
        }
        if let Some(multiplexer) = running.multiplexer {
            if let Err(e) = multiplexer.await {
                tracing::error!("Multiplexed runner failed: {}", e);
            }
        }
        if let Err(e) = running.heartbeat.await {
            tracing::error!("Heartbeat task failed: {}", e);
        }
        if let Some(workers) = running.workers {
            workers.shutdown().await;
        }

        for runner in snapshot(&self.inner.registry) {
            self.release_processing(&runner).await;
        }
        let queues = registered_queues(&self.inner.registry);
        if let Err(e) = self.inner.heartbeat.unregister(&queues).await {
            tracing::error!("Failed to unregister consumer {}: {}", self.inner.id, e);
        }
    }

    /// Return what the runner still holds to its queue and drop the
    /// processing list from the queue's index
    async fn release_processing(&self, runner: &MessageHandlerRunner) {
        let redis = &self.inner.ctx.redis;
        let key = runner.processing_key();
        match runner.release().await {
            Ok(0) => {}
            Ok(released) => tracing::info!("Released {} message(s) from {}", released, key),
            Err(e) => {
                tracing::warn!("Failed to release {}: {}", key, e);
                return;
            }
        }
        let index = Keys::consumer_processing(&self.inner.id);
        let cleanup = async {
            redis.srem(&QueueKeys::new(runner.queue()).processing_queues, key).await?;
            redis.hdel(&index, key).await?;
            Ok::<_, Error>(())
        };
        if let Err(e) = cleanup.await {
            tracing::warn!("Failed to drop {}: {}", key, e);
        }
    }

    fn emit(&self, event: impl FnOnce(InstanceKind, String) -> Event) {
        self.inner
            .ctx
            .events
            .emit(event(InstanceKind::Consumer, self.inner.id.clone()));
    }
}
