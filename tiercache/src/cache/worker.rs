use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::core::{CacheError, Result};
use crate::disk::DiskStorage;

type Job = Box<dyn FnOnce(&mut DiskStorage) + Send + 'static>;

/// Serialized executor owning the disk engine.
///
/// Every job runs on one dedicated thread in submission order, so no two
/// disk operations ever overlap. The worker stops once all handles are
/// dropped and the queue has drained.
#[derive(Clone)]
pub struct DiskWorker {
    jobs: mpsc::UnboundedSender<Job>,
    queued: Arc<AtomicUsize>,
}

impl DiskWorker {
    /// Move `storage` onto a new worker thread
    pub fn spawn(storage: DiskStorage) -> Result<Self> {
        let (jobs, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let root = storage.root().display().to_string();

        let queued_clone = Arc::clone(&queued);
        thread::Builder::new()
            .name("tiercache-disk".to_string())
            .spawn(move || Self::worker_loop(storage, rx, queued_clone))?;

        info!(root = %root, "Disk worker started");
        Ok(Self { jobs, queued })
    }

    fn worker_loop(
        mut storage: DiskStorage,
        mut rx: mpsc::UnboundedReceiver<Job>,
        queued: Arc<AtomicUsize>,
    ) {
        while let Some(job) = rx.blocking_recv() {
            if panic::catch_unwind(AssertUnwindSafe(|| job(&mut storage))).is_err() {
                error!("Disk job panicked; continuing with next job");
            }
            queued.fetch_sub(1, Ordering::SeqCst);
        }

        info!(root = %storage.root().display(), "Disk worker loop terminated");
    }

    /// Enqueue a job without waiting for it
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&mut DiskStorage) + Send + 'static,
    {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.jobs.send(Box::new(job)).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            CacheError::WorkerClosed
        })
    }

    /// Enqueue a job and get a receiver for its result
    pub fn submit<F, R>(&self, job: F) -> Result<oneshot::Receiver<R>>
    where
        F: FnOnce(&mut DiskStorage) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(move |storage| {
            let _ = tx.send(job(storage));
        })?;
        Ok(rx)
    }

    /// Enqueue a job and await its result
    pub async fn run<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&mut DiskStorage) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit(job)?
            .await
            .map_err(|_| CacheError::WorkerClosed)
    }

    /// Enqueue a job and park the calling thread until it finishes.
    ///
    /// Must not be called from within an async context.
    pub fn run_blocking<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&mut DiskStorage) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit(job)?
            .blocking_recv()
            .map_err(|_| CacheError::WorkerClosed)
    }

    /// Wait until every job queued before this call has run
    pub async fn drain(&self) -> Result<()> {
        self.run(|_| ()).await
    }

    /// Jobs submitted but not yet finished
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DiskConfig;
    use crate::disk::MemoryAttributes;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    fn worker(dir: &std::path::Path) -> DiskWorker {
        let config = DiskConfig::new(dir).with_capacity(1024 * 1024);
        let storage = DiskStorage::open(&config, Arc::new(MemoryAttributes::new())).unwrap();
        DiskWorker::spawn(storage).unwrap()
    }

    #[test]
    fn test_jobs_run_in_submission_order() {
        let dir = tempdir().unwrap();
        let worker = worker(dir.path());
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            worker.execute(move |_| seen.lock().push(i)).unwrap();
        }
        worker.run_blocking(|_| ()).unwrap();

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
        assert_eq!(worker.queued(), 0);
    }

    #[test]
    fn test_put_then_get_observes_program_order() {
        let dir = tempdir().unwrap();
        let worker = worker(dir.path());

        worker
            .execute(|s| s.put("k", b"first").unwrap())
            .unwrap();
        worker
            .execute(|s| s.put("k", b"second").unwrap())
            .unwrap();
        let value = worker.run_blocking(|s| s.get("k")).unwrap().unwrap();

        assert_eq!(value, Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_run_async() {
        let dir = tempdir().unwrap();
        let worker = worker(dir.path());

        worker.run(|s| s.put("a", b"123")).await.unwrap().unwrap();
        worker.drain().await.unwrap();
        let total = worker.run(|s| s.total_size()).await.unwrap();

        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_worker() {
        let dir = tempdir().unwrap();
        let worker = worker(dir.path());

        let rx = worker.submit(|_| -> u8 { panic!("boom") }).unwrap();
        assert!(rx.await.is_err());

        let len = worker.run(|s| s.len()).await.unwrap();
        assert_eq!(len, 0);
    }
}
