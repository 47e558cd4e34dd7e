//! A bounded pool for fanning out tree-recursive work.
//!
//! Work is submitted in [`Batch`]es. A submission runs on a pool task when a permit is free and
//! inline in the submitter otherwise, so recursive work that waits on its own children never
//! starves the pool.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

/// Default number of concurrent workers.
pub const NSYNCERS: usize = 5;

/// A pool running at most `n` submissions concurrently. Clones share the bound.
#[derive(Debug, Clone)]
pub struct WorkPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl Default for WorkPool {
    fn default() -> Self {
        Self::new(NSYNCERS)
    }
}

impl WorkPool {
    /// A pool of `n` workers. Zero is treated as one.
    pub fn new(n: usize) -> Self {
        let size = n.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// The concurrency bound.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently busy.
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    /// A new group of submissions that can be waited for together.
    pub fn batch(&self) -> Batch {
        Batch {
            pool: self.clone(),
            tasks: JoinSet::new(),
        }
    }

    /// Waits for every running submission, then refuses further pool tasks. Later submissions
    /// run inline.
    pub async fn wait(&self) {
        let Ok(all) = self.permits.acquire_many(self.size as u32).await else {
            return;
        };
        all.forget();
        self.permits.close();
    }
}

/// Submissions to a [`WorkPool`] awaited as a group.
pub struct Batch {
    pool: WorkPool,
    tasks: JoinSet<()>,
}

impl Batch {
    /// Runs `work` on a free worker, or right here when none is free.
    pub async fn submit<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match Arc::clone(&self.pool.permits).try_acquire_owned() {
            Ok(permit) => {
                self.tasks.spawn(async move {
                    work.await;
                    drop(permit);
                });
            }
            Err(_) => work.await,
        }
    }

    /// Waits for every submission in the batch.
    pub async fn wait(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
                warn!(?e, "work: task cancelled");
            }
        }
    }
}
