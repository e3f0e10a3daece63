use crate::error::{ConductorError, ConductorResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Bounded pool of cooperative workers (§4.E). `reserve` and `spawn` are
/// split so a caller can roll back state if the pool is saturated before
/// any work is actually dispatched (used by `Task::spawn_after`'s
/// `err_handler`).
///
/// The "check free slot, then spawn" sequence is serialized by
/// `spawn_lock`, mirroring the source's process-wide `WORKER_SPAWN_LOCK`,
/// so two callers racing for the last slot cannot both observe success.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    spawn_lock: Mutex<()>,
    size: usize,
}

pub struct WorkerPermit(OwnedSemaphorePermit);

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            spawn_lock: Mutex::new(()),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn in_use(&self) -> usize {
        self.size - self.semaphore.available_permits()
    }

    /// Synchronously reserves a slot, failing `NoFreeConductorWorker` if the
    /// pool is saturated.
    pub async fn reserve(&self) -> ConductorResult<WorkerPermit> {
        let _guard = self.spawn_lock.lock().await;
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(WorkerPermit(permit)),
            Err(_) => Err(ConductorError::NoFreeConductorWorker),
        }
    }

    pub fn spawn<F>(&self, permit: WorkerPermit, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            job.await;
            drop(permit);
        });
    }

    /// Blocks until every in-flight job has drained, for graceful shutdown.
    pub async fn wait_all(&self) {
        debug!(size = self.size, "waiting for worker pool to drain");
        let _ = self.semaphore.acquire_many(self.size as u32).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    async fn reserve_fails_when_saturated() {
        let pool = WorkerPool::new(1);
        let permit = pool.reserve().await.unwrap();
        let err = pool.reserve().await.unwrap_err();
        assert!(matches!(err, ConductorError::NoFreeConductorWorker));
        drop(permit);
        assert!(pool.reserve().await.is_ok());
    }
}
