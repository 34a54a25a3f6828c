use crate::config::WorkerConfig;
use crate::control::{ControlAction, ControlCommand};
use crate::delayed_delivery::DelayedDelivery;
use crate::dispatch::Dispatcher;
use crate::handler::TaskHandlerRegistry;
use crate::retry::RetryController;
use crate::revoked::RevocationRegistry;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use task_queue_broker::{BrokerConnection, Consumer, DelayedDeliveryPublisher, MessageQueue};
use task_queue_core::{Enqueuer, ResultBackend, TaskId, TaskMessage};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// Wall-clock time source, compared against message ETAs
pub trait WallClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Holds one concurrency slot until dropped, even if the task panics
struct ActiveTaskGuard(Arc<RwLock<usize>>);

impl ActiveTaskGuard {
    fn acquire(active_tasks: &Arc<RwLock<usize>>) -> Self {
        *active_tasks.write() += 1;
        ActiveTaskGuard(Arc::clone(active_tasks))
    }
}

impl Drop for ActiveTaskGuard {
    fn drop(&mut self) {
        let mut active = self.0.write();
        *active = active.saturating_sub(1);
    }
}

/// Worker process that executes tasks
pub struct Worker {
    config: WorkerConfig,
    worker_id: String,
    dispatcher: Arc<Dispatcher>,
    consumer: Arc<dyn Consumer>,
    connector: Arc<dyn BrokerConnection>,
    publisher: Arc<DelayedDeliveryPublisher>,
    clock: Arc<dyn WallClock>,
    /// Delivered messages whose ETA has not passed yet
    pending_eta: MessageQueue,
    active_tasks: Arc<RwLock<usize>>,
    shutdown: Arc<Notify>,
    control_tx: mpsc::Sender<ControlCommand>,
    control_rx: Mutex<Option<mpsc::Receiver<ControlCommand>>>,
}

impl Worker {
    pub fn new<T>(
        config: WorkerConfig,
        registry: TaskHandlerRegistry,
        transport: Arc<T>,
        backend: Arc<dyn ResultBackend>,
    ) -> Self
    where
        T: BrokerConnection + Consumer + Enqueuer + 'static,
    {
        let worker_id = config.generate_worker_id();
        let revoked: Arc<RevocationRegistry> = Arc::new(config.revoked.build_registry());
        let default_routing_key = config
            .queue_specs()
            .first()
            .map_or_else(|| "default".to_string(), |queue| queue.routing_key.clone());
        let publisher = Arc::new(DelayedDeliveryPublisher::new(transport.clone(), default_routing_key));
        let enqueuer: Arc<dyn Enqueuer> = publisher.clone();
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            revoked,
            Arc::new(RetryController::new(enqueuer)),
            backend,
        )
        .with_purge_interval(config.revoked.purge_interval());
        let (control_tx, control_rx) = mpsc::channel(64);

        Worker {
            config,
            worker_id,
            dispatcher: Arc::new(dispatcher),
            consumer: transport.clone(),
            connector: transport,
            publisher,
            clock: Arc::new(SystemClock),
            pending_eta: MessageQueue::new(),
            active_tasks: Arc::new(RwLock::new(0)),
            shutdown: Arc::new(Notify::new()),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
        }
    }

    /// Replace the clock deciding when held messages become ready
    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn revoked(&self) -> &Arc<RevocationRegistry> {
        self.dispatcher.revoked()
    }

    /// Sender for remote-control commands
    pub fn control(&self) -> mpsc::Sender<ControlCommand> {
        self.control_tx.clone()
    }

    pub fn active_tasks(&self) -> usize {
        *self.active_tasks.read()
    }

    /// Run the worker
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("Starting worker {} (concurrency: {})", self.worker_id, self.config.concurrency);

        let mut control_rx = self
            .control_rx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("Worker {} is already running", self.worker_id))?;

        self.setup_delayed_delivery().await?;

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            tokio::select! {
                Some(command) = control_rx.recv() => {
                    if self.handle_command(command) == ControlAction::Shutdown {
                        info!("Worker shutting down gracefully");
                        self.graceful_shutdown().await;
                        break;
                    }
                }

                _ = self.shutdown.notified() => {
                    info!("Worker shutting down gracefully");
                    self.graceful_shutdown().await;
                    break;
                }

                _ = tokio::time::sleep(poll_interval) => {
                    self.consume().await;
                }
            }
        }

        Ok(())
    }

    async fn setup_delayed_delivery(&self) -> anyhow::Result<()> {
        let queues = self.config.queue_specs();
        let first_url = self.config.broker_url.first().unwrap_or_default();

        if !DelayedDelivery::include_if(first_url, &queues) {
            debug!("Delayed delivery setup skipped");
            return Ok(());
        }

        let delayed_delivery =
            DelayedDelivery::new(Arc::clone(&self.connector), self.config.delayed_delivery.clone());
        let ready = delayed_delivery.start(&self.config.broker_url, &queues).await?;
        if ready {
            self.publisher.enable();
        }
        Ok(())
    }

    fn handle_command(&self, command: ControlCommand) -> ControlAction {
        let revoked_ids = match &command {
            ControlCommand::Revoke { task_ids } => task_ids.clone(),
            ControlCommand::Shutdown => Vec::new(),
        };
        let action = command.apply(self.revoked());
        self.release_revoked(&revoked_ids);
        action
    }

    /// Dispatch held messages of revoked tasks now so they are recorded as revoked
    fn release_revoked(&self, task_ids: &[TaskId]) {
        for task_id in task_ids {
            for message in self.pending_eta.remove(task_id) {
                debug!("Releasing held {}[{}]", message.task, message.id);
                self.spawn_task(message);
            }
        }
    }

    /// Start as many ready messages as there is capacity for
    async fn consume(&self) {
        while self.active_tasks() < self.config.concurrency {
            let message = match self.next_message().await {
                Some(message) => message,
                None => break,
            };
            self.spawn_task(message);
        }
    }

    async fn next_message(&self) -> Option<TaskMessage> {
        if let Some(message) = self.pending_eta.pop_ready(self.clock.now()) {
            return Some(message);
        }

        loop {
            let message = match self.consumer.fetch().await {
                Ok(Some(message)) => message,
                Ok(None) => return None,
                Err(e) => {
                    warn!("Failed to fetch task: {}", e);
                    return None;
                }
            };

            if message.is_ready(self.clock.now()) {
                return Some(message);
            }
            debug!("Holding {}[{}] until its ETA", message.task, message.id);
            self.pending_eta.push(message);
        }
    }

    fn spawn_task(&self, message: TaskMessage) {
        let slot = ActiveTaskGuard::acquire(&self.active_tasks);
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let _slot = slot;
            let task_id = message.id.clone();
            if let Err(e) = dispatcher.dispatch(message).await {
                error!(task_id = %task_id, "Failed to process task {}: {}", task_id, e);
            }
        });
    }

    /// Graceful shutdown - wait for active tasks to complete
    async fn graceful_shutdown(&self) {
        info!("Waiting for active tasks to complete...");

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.graceful_shutdown_timeout_secs);

        loop {
            let active = self.active_tasks();

            if active == 0 {
                info!("All tasks completed, shutting down");
                break;
            }

            if tokio::time::Instant::now() > deadline {
                warn!("Shutdown deadline exceeded, {} tasks still active", active);
                break;
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        if !self.pending_eta.is_empty() {
            warn!("{} scheduled tasks were not started before shutdown", self.pending_eta.len());
        }
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}
