//! Task scheduler: one loop, a bounded worker pool, sqlite-backed claims.
//!
//! The loop sleeps until the earliest pending task is due (or until poked
//! through the handle when new tasks appear), claims it with an atomic
//! UPDATE, and hands it to a worker. Workers settle each outcome back into
//! storage: delete on success, requeue with backoff on retryable failure,
//! delete plus a logged error when retries are exhausted.

use std::cmp::min;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Notify, Semaphore, mpsc, oneshot};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::core::storage::{Store, TaskSnapshot};
use crate::core::types::{ErrorKind, Task};

/// Attempts before a retried task is declared dead.
pub const MAX_RETRIES: u32 = 20;

/// Retry delays; every fifth retry climbs one rung.
const BACKOFF_LADDER: [Duration; 4] = [
    Duration::from_millis(2500),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

pub fn backoff_delay(retry_count: u32) -> Duration {
    BACKOFF_LADDER[min(retry_count as usize / 5, BACKOFF_LADDER.len() - 1)]
}

/// How a task run ended, as reported by its handler.
pub enum TaskOutcome {
    /// Finished; the task is deleted.
    Done,
    /// Finished; run again at the given time for the given logical day
    /// with the retry counter reset (periodic tasks).
    Requeue {
        at: DateTime<Utc>,
        logical_day: NaiveDate,
    },
    /// Failed in a way worth retrying with backoff.
    Retry { kind: ErrorKind, message: String },
    /// Failed for good; the task is deleted and the error logged.
    Failed { kind: ErrorKind, message: String },
}

/// Executes one task. The scheduler knows nothing about what tasks do.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task) -> TaskOutcome;
}

enum Command {
    Snapshot(oneshot::Sender<Vec<TaskSnapshot>>),
}

/// Cheap, clonable handle for poking the scheduler and taking snapshots.
#[derive(Clone)]
pub struct SchedulerHandle {
    notify: Arc<Notify>,
    commands: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Tell the scheduler a new task exists.
    pub fn poke(&self) {
        self.notify.notify_one();
    }

    /// Read-only snapshot of all tasks, produced inside the scheduler loop.
    pub async fn snapshot(&self) -> Result<Vec<TaskSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| anyhow::anyhow!("scheduler is gone"))?;
        Ok(rx.await?)
    }
}

pub struct Scheduler {
    store: Arc<Store>,
    runner: Arc<dyn TaskRunner>,
    notify: Arc<Notify>,
    commands: mpsc::Receiver<Command>,
    workers: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        runner: Arc<dyn TaskRunner>,
        workers: usize,
    ) -> (Self, SchedulerHandle) {
        let notify = Arc::new(Notify::new());
        let (tx, rx) = mpsc::channel(16);
        let handle = SchedulerHandle {
            notify: notify.clone(),
            commands: tx,
        };
        (
            Self {
                store,
                runner,
                notify,
                commands: rx,
                workers: Arc::new(Semaphore::new(workers)),
            },
            handle,
        )
    }

    /// Run the scheduling loop forever. Call once.
    pub async fn run(mut self) -> Result<()> {
        // A previous process may have died mid-task.
        for task in self.store.reset_interrupted_tasks().await? {
            warn!(
                kind = task.kind.as_str(),
                owner = task.owner.as_deref().unwrap_or("-"),
                retries = task.retry_count,
                "detected interrupted task, requeueing"
            );
        }
        loop {
            let next = self.store.next_pending_task().await?;
            let due_in = next.as_ref().map(|task| {
                (task.next_run_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            });
            tokio::select! {
                _ = self.notify.notified() => {
                    // New or rescheduled task; recompute the earliest.
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Snapshot(reply)) => {
                            let _ = reply.send(self.store.task_snapshots().await?);
                        }
                        None => return Ok(()),
                    }
                }
                _ = wait(due_in) => {
                    let task = next.expect("wait() only completes with a task");
                    if !self.store.claim_task(&task.id).await? {
                        continue;
                    }
                    let workers = self.workers.clone();
                    let store = self.store.clone();
                    let runner = self.runner.clone();
                    let notify = self.notify.clone();
                    tokio::spawn(async move {
                        // Waiting for a worker slot happens off the loop;
                        // a saturated pool must not block claims or
                        // snapshot replies.
                        let Ok(_permit) = workers.acquire_owned().await else {
                            return;
                        };
                        if let Err(err) = run_claimed(&store, runner.as_ref(), &task).await {
                            error!(task = %task.id, error = %err, "failed to settle task outcome");
                        }
                        notify.notify_one();
                    });
                }
            }
        }
    }
}

/// Sleep until the next task is due; pend forever when there is none.
async fn wait(due_in: Option<Duration>) {
    match due_in {
        Some(duration) => sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn run_claimed(store: &Store, runner: &dyn TaskRunner, task: &Task) -> Result<()> {
    info!(
        kind = task.kind.as_str(),
        owner = task.owner.as_deref().unwrap_or("-"),
        retries = task.retry_count,
        "starting task"
    );
    let outcome = runner.run(task).await;
    settle(store, task, outcome).await
}

/// Apply a task outcome to storage.
async fn settle(store: &Store, task: &Task, outcome: TaskOutcome) -> Result<()> {
    match outcome {
        TaskOutcome::Done => {
            info!(kind = task.kind.as_str(), "task done");
            store.delete_task(&task.id).await
        }
        TaskOutcome::Requeue { at, logical_day } => {
            info!(kind = task.kind.as_str(), next = %at, "task requeued");
            store.reschedule_task(&task.id, at, 0, logical_day).await
        }
        TaskOutcome::Retry { kind, message } if task.retry_count >= MAX_RETRIES => {
            warn!(kind = task.kind.as_str(), "task failed, retries exhausted: {}", message);
            if let Some(owner) = &task.owner {
                store.log_error(owner, kind, &message).await?;
            }
            store.delete_task(&task.id).await
        }
        TaskOutcome::Retry { message, .. } => {
            let delay = backoff_delay(task.retry_count);
            warn!(
                kind = task.kind.as_str(),
                retries = task.retry_count,
                "task failed, retrying in {:?}: {}",
                delay,
                message
            );
            store
                .reschedule_task(
                    &task.id,
                    Utc::now() + chrono::Duration::from_std(delay)?,
                    task.retry_count + 1,
                    task.logical_day,
                )
                .await
        }
        TaskOutcome::Failed { kind, message } => {
            warn!(kind = task.kind.as_str(), "task failed, not retrying: {}", message);
            if let Some(owner) = &task.owner {
                store.log_error(owner, kind, &message).await?;
            }
            store.delete_task(&task.id).await
        }
    }
}
