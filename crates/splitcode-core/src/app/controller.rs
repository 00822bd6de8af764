//! Level-trigger driver.
//!
//! Turns store changes into keys on a [`WorkQueue`] and runs a pool of
//! workers that hand task keys to the orchestrator and job keys to the
//! feedback handler. A periodic resync re-enqueues everything, which is what
//! repairs lost deliveries and lost status writes.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::feedback::JobFeedbackHandler;
use super::orchestrator::TaskOrchestrator;
use super::retry::RequeuePolicy;
use super::work_queue::WorkQueue;
use crate::config::ControllerConfig;
use crate::domain::{BatchJob, LabelSelector, TranscodeTask};
use crate::error::Result;
use crate::pipeline::PipelineError;
use crate::ports::{Api, Clock, WatchEvent, WatchEventKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkKey {
    Task(String),
    Job(String),
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(name) => write!(f, "task/{name}"),
            Self::Job(name) => write!(f, "job/{name}"),
        }
    }
}

struct Shared {
    tasks: Arc<dyn Api<TranscodeTask>>,
    jobs: Arc<dyn Api<BatchJob>>,
    orchestrator: TaskOrchestrator,
    feedback: JobFeedbackHandler,
    queue: WorkQueue<WorkKey>,
}

impl Shared {
    async fn process(&self, key: &WorkKey) -> Result<(), PipelineError> {
        match key {
            WorkKey::Task(name) => {
                let out = self.orchestrator.reconcile(name).await?;
                if !out.created_jobs.is_empty() || out.reaped_jobs > 0 {
                    debug!(
                        %key,
                        created = out.created_jobs.len(),
                        reaped = out.reaped_jobs,
                        "task reconciled"
                    );
                }
            }
            WorkKey::Job(name) => {
                self.feedback.handle(name).await?;
            }
        }
        Ok(())
    }

    async fn resync(&self) {
        match self.tasks.list(&LabelSelector::everything()).await {
            Ok(tasks) => {
                for task in tasks {
                    self.queue.add(WorkKey::Task(task.metadata.name)).await;
                }
            }
            Err(e) => warn!(error = %e, "listing tasks for resync failed"),
        }
        match self.jobs.list(&LabelSelector::everything()).await {
            Ok(jobs) => {
                for job in jobs {
                    self.queue.add(WorkKey::Job(job.metadata.name)).await;
                }
            }
            Err(e) => warn!(error = %e, "listing jobs for resync failed"),
        }
    }
}

pub struct Controller {
    shared: Arc<Shared>,
    config: ControllerConfig,
}

impl Controller {
    /// Wire the orchestrator and feedback handler to the stores.
    ///
    /// Fails if `config` does not validate.
    pub fn new(
        tasks: Arc<dyn Api<TranscodeTask>>,
        jobs: Arc<dyn Api<BatchJob>>,
        config: ControllerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let orchestrator =
            TaskOrchestrator::new(tasks.clone(), jobs.clone(), &config, clock.clone());
        let feedback = JobFeedbackHandler::new(tasks.clone(), jobs.clone(), &config, clock);
        let queue = WorkQueue::new(RequeuePolicy::from(&config.requeue));
        Ok(Self {
            shared: Arc::new(Shared {
                tasks,
                jobs,
                orchestrator,
                feedback,
                queue,
            }),
            config,
        })
    }

    /// Enqueue every task and job once.
    pub async fn resync(&self) {
        self.shared.resync().await;
    }

    /// Run a single key through its handler, outside the worker pool.
    pub async fn process(&self, key: &WorkKey) -> Result<(), PipelineError> {
        self.shared.process(key).await
    }

    pub async fn queued(&self) -> usize {
        self.shared.queue.len().await
    }

    /// Start watchers, the resync ticker and the worker pool.
    pub fn start(self) -> ControllerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::with_capacity(self.config.workers + 3);

        // Subscribe before the first resync lists, so nothing falls between.
        let task_events = self.shared.tasks.watch();
        let job_events = self.shared.jobs.watch();

        joins.push(tokio::spawn(watch_loop(
            self.shared.clone(),
            task_events,
            WorkKey::Task,
            shutdown_rx.clone(),
        )));
        joins.push(tokio::spawn(watch_loop(
            self.shared.clone(),
            job_events,
            WorkKey::Job,
            shutdown_rx.clone(),
        )));
        joins.push(tokio::spawn(resync_loop(
            self.shared.clone(),
            self.config.resync_period(),
            shutdown_rx.clone(),
        )));
        for worker_id in 0..self.config.workers {
            joins.push(tokio::spawn(worker_loop(
                worker_id,
                self.shared.clone(),
                shutdown_rx.clone(),
            )));
        }

        info!(workers = self.config.workers, "controller started");
        ControllerHandle {
            shared: self.shared,
            shutdown_tx,
            joins,
        }
    }
}

/// Running controller.
/// - dropping it without `shutdown_and_join` leaves the tasks running
/// - `shutdown_and_join` stops taking new keys and waits for in-flight passes
pub struct ControllerHandle {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl ControllerHandle {
    /// Ask every loop to stop after its current iteration.
    pub fn request_shutdown(&self) {
        // Receivers may already be gone.
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        self.shared.queue.shutdown().await;
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "controller task ended abnormally");
            }
        }
        info!("controller stopped");
    }
}

async fn watch_loop(
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<WatchEvent>,
    key: fn(String) -> WorkKey,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => event,
        };
        match event {
            // A deleted object has nothing left to reconcile.
            Ok(event) if event.kind == WatchEventKind::Deleted => {}
            Ok(event) => shared.queue.add(key(event.name)).await,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "watch fell behind, resyncing");
                shared.resync().await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn resync_loop(
    shared: Arc<Shared>,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                debug!("resync");
                shared.resync().await;
            }
        }
    }
}

async fn worker_loop(worker_id: usize, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let key = tokio::select! {
            _ = shutdown.changed() => break,
            key = shared.queue.next() => key,
        };
        let Some(key) = key else {
            break;
        };

        match shared.process(&key).await {
            Ok(()) => shared.queue.forget(&key).await,
            Err(e) => {
                let delay = shared.queue.retry(key.clone()).await;
                warn!(worker = worker_id, %key, error = %e, ?delay, "pass failed, requeued");
            }
        }
        shared.queue.done(&key).await;
    }
    debug!(worker = worker_id, "worker stopped");
}
