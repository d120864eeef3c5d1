//! Background indexing queue.
//!
//! [`IndexQueue`] replaces fire-and-forget task spawning with a worker
//! pool fed by reference ids. Triggers for the same id are coalesced:
//!
//! - id queued but not started: the new trigger is dropped
//! - id running: exactly one follow-up run is scheduled after it finishes
//!
//! Workers are bounded by a semaphore with `indexing.workers` permits.
//! Failures never propagate to whoever enqueued the job; the
//! [`IndexJob`] implementation logs and records them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify, Semaphore};

/// Work performed for one dequeued reference id.
#[async_trait]
pub trait IndexJob: Send + Sync + 'static {
    async fn index(&self, reference_id: &str);

    /// Called after `index` panicked for `reference_id`.
    async fn aborted(&self, _reference_id: &str, _reason: &str) {}
}

#[derive(Default)]
struct QueueState {
    queued: HashSet<String>,
    running: HashSet<String>,
    rerun: HashSet<String>,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.running.is_empty()
    }
}

struct Shared {
    state: Mutex<QueueState>,
    idle: Notify,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cloneable handle to the indexing worker pool.
///
/// The dispatcher stops once every handle is dropped and the channel
/// drains.
#[derive(Clone)]
pub struct IndexQueue {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<String>,
}

impl IndexQueue {
    /// Start the dispatcher. Must be called from within a tokio runtime.
    pub fn start(job: Arc<dyn IndexJob>, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            idle: Notify::new(),
        });
        tokio::spawn(dispatch(
            shared.clone(),
            tx.downgrade(),
            job,
            rx,
            workers.max(1),
        ));
        Self { shared, tx }
    }

    /// Schedule indexing for `reference_id`. Never blocks on the work itself.
    pub fn enqueue(&self, reference_id: &str) {
        let mut state = self.shared.state();
        if state.queued.contains(reference_id) {
            tracing::debug!(reference_id, "already queued; trigger dropped");
            return;
        }
        if state.running.contains(reference_id) {
            tracing::debug!(reference_id, "running; follow-up scheduled");
            state.rerun.insert(reference_id.to_string());
            return;
        }
        state.queued.insert(reference_id.to_string());
        if self.tx.send(reference_id.to_string()).is_err() {
            state.queued.remove(reference_id);
            tracing::error!(reference_id, "indexing dispatcher has stopped");
        }
    }

    /// True while `reference_id` is queued or being indexed.
    pub fn is_pending(&self, reference_id: &str) -> bool {
        let state = self.shared.state();
        state.queued.contains(reference_id) || state.running.contains(reference_id)
    }

    /// Resolve once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.state().is_idle() {
                return;
            }
            notified.await;
        }
    }
}

async fn dispatch(
    shared: Arc<Shared>,
    tx: mpsc::WeakUnboundedSender<String>,
    job: Arc<dyn IndexJob>,
    mut rx: mpsc::UnboundedReceiver<String>,
    workers: usize,
) {
    let semaphore = Arc::new(Semaphore::new(workers));
    while let Some(id) = rx.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        {
            let mut state = shared.state();
            state.queued.remove(&id);
            state.running.insert(id.clone());
        }
        let running = Running {
            shared: shared.clone(),
            tx: tx.clone(),
            id,
        };
        let job = job.clone();
        tokio::spawn(async move {
            let _permit = permit;
            run_job(job, &running.id).await;
            drop(running);
        });
    }
    tracing::debug!("indexing dispatcher stopped");
}

/// Runs the job on its own task so a panic surfaces as a `JoinError`
/// instead of unwinding through the worker.
async fn run_job(job: Arc<dyn IndexJob>, id: &str) {
    let handle = tokio::spawn({
        let job = job.clone();
        let id = id.to_string();
        async move { job.index(&id).await }
    });
    if let Err(e) = handle.await {
        let reason = if e.is_panic() {
            "indexing panicked"
        } else {
            "indexing cancelled"
        };
        tracing::error!(reference_id = id, error = %e, "{}", reason);
        job.aborted(id, reason).await;
    }
}

/// Marks an id as no longer running when dropped, whatever way the
/// worker ends.
struct Running {
    shared: Arc<Shared>,
    tx: mpsc::WeakUnboundedSender<String>,
    id: String,
}

impl Drop for Running {
    fn drop(&mut self) {
        let mut state = self.shared.state();
        state.running.remove(&self.id);
        if state.rerun.remove(&self.id) {
            let sent = self
                .tx
                .upgrade()
                .is_some_and(|tx| tx.send(self.id.clone()).is_ok());
            if sent {
                state.queued.insert(self.id.clone());
            } else {
                tracing::debug!(reference_id = %self.id, "queue closed; follow-up dropped");
            }
        }
        if state.is_idle() {
            self.shared.idle.notify_waiters();
        }
    }
}
