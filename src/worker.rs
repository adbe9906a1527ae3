//! Logical I/O workers.
//!
//! Each DCB is bound to one worker for its lifetime and is only mutated by
//! code running under that worker's scope. Cross-cutting mutations (marking
//! a server under maintenance, refreshing user caches, sweeping the pool)
//! are posted as tasks to the distinguished main worker instead of running
//! inline in the I/O path.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identity of a worker. Worker 0 is the main worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

tokio::task_local! {
    static CURRENT_WORKER: WorkerId;
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of logical workers with a task queue each.
pub struct Workers {
    queues: Vec<mpsc::UnboundedSender<Task>>,
    next: AtomicUsize,
}

impl Workers {
    pub const MAIN: WorkerId = WorkerId(0);

    /// Spawn `count` worker loops (at least one; worker 0 is the main
    /// worker).
    pub fn start(count: usize) -> Arc<Self> {
        let count = count.max(1);
        let mut queues = Vec::with_capacity(count);
        for id in 0..count {
            let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
            tokio::spawn(CURRENT_WORKER.scope(WorkerId(id), async move {
                while let Some(task) = rx.recv().await {
                    task();
                }
                debug!(worker = id, "Worker queue closed");
            }));
            queues.push(tx);
        }
        Arc::new(Self {
            queues,
            next: AtomicUsize::new(1),
        })
    }

    pub fn count(&self) -> usize {
        self.queues.len()
    }

    /// Round-robin assignment for a new session.
    pub fn assign(&self) -> WorkerId {
        let n = self.queues.len();
        WorkerId(self.next.fetch_add(1, Ordering::Relaxed) % n)
    }

    /// Post a task to a specific worker's queue.
    pub fn post(&self, worker: WorkerId, task: impl FnOnce() + Send + 'static) -> bool {
        match self.queues.get(worker.0) {
            Some(tx) => tx.send(Box::new(task)).is_ok(),
            None => {
                warn!(worker = worker.0, "Task posted to unknown worker");
                false
            }
        }
    }

    /// Post a task to the main worker.
    pub fn post_to_main(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.post(Self::MAIN, task)
    }

    /// The worker the calling task runs under, if any.
    pub fn current() -> Option<WorkerId> {
        CURRENT_WORKER.try_with(|w| *w).ok()
    }

    /// Run a future under a worker's scope. Everything spawned with this
    /// sees `Workers::current() == Some(worker)`.
    pub fn scope<F>(worker: WorkerId, fut: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        CURRENT_WORKER.scope(worker, fut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_tasks_run_under_their_worker() {
        let workers = Workers::start(3);
        let (tx, rx) = oneshot::channel();
        workers.post(WorkerId(2), move || {
            let _ = tx.send(Workers::current());
        });
        assert_eq!(rx.await.unwrap(), Some(WorkerId(2)));
    }

    #[tokio::test]
    async fn test_main_worker_is_zero() {
        let workers = Workers::start(2);
        let (tx, rx) = oneshot::channel();
        workers.post_to_main(move || {
            let _ = tx.send(Workers::current());
        });
        assert_eq!(rx.await.unwrap(), Some(Workers::MAIN));
    }

    #[tokio::test]
    async fn test_assign_round_robin_covers_all_workers() {
        let workers = Workers::start(4);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..8 {
            seen.insert(workers.assign().0);
        }
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn test_scope_sets_current() {
        assert_eq!(Workers::current(), None);
        let id = Workers::scope(WorkerId(7), async { Workers::current() }).await;
        assert_eq!(id, Some(WorkerId(7)));
    }
}
