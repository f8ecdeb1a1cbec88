//! Bounded fan-out for per-unit work.
//!
//! The pool's permits outlive any single tick: a creation still running when
//! its tick gives up keeps its permit until it finishes, so the next tick
//! sees a smaller pool instead of an unbounded one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Fixed-size pool shared by every tick of one sweep.
#[derive(Debug, Clone)]
pub struct DispatchPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl DispatchPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not held by a running task.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Start a batch of tasks for one tick.
    pub fn batch<T: Send + 'static>(&self) -> DispatchBatch<T> {
        DispatchBatch {
            permits: Arc::clone(&self.permits),
            tasks: JoinSet::new(),
        }
    }
}

/// Tasks spawned by one tick.
///
/// Dropping a batch without joining it aborts its tasks.
pub struct DispatchBatch<T> {
    permits: Arc<Semaphore>,
    tasks: JoinSet<Option<T>>,
}

/// What became of a joined batch.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub results: Vec<T>,
    pub panicked: usize,
    /// Tasks left running past the deadline.
    pub detached: usize,
}

impl<T: Send + 'static> DispatchBatch<T> {
    /// Spawn `work`. The task waits for a permit itself, so this never blocks.
    pub fn spawn<F>(&mut self, work: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.ok()?;
            Some(work.await)
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task, up to `timeout`. Tasks still running at the
    /// deadline are detached and keep running on their own.
    pub async fn join(mut self, timeout: Option<Duration>) -> BatchOutcome<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut outcome = BatchOutcome {
            results: Vec::with_capacity(self.tasks.len()),
            panicked: 0,
            detached: 0,
        };

        loop {
            let next = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            outcome.detached = self.tasks.len();
                            self.tasks.detach_all();
                            break;
                        }
                    }
                }
                None => self.tasks.join_next().await,
            };

            match next {
                None => break,
                Some(Ok(Some(result))) => outcome.results.push(result),
                // Semaphore closed; the work never ran.
                Some(Ok(None)) => {}
                Some(Err(e)) => {
                    if e.is_panic() {
                        outcome.panicked += 1;
                    }
                }
            }
        }
        outcome
    }
}
