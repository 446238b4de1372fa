//! Fixed-size worker pool for blocking device I/O
//!
//! Jobs are queued on a crossbeam channel and picked up by dedicated OS
//! threads; results come back to the async caller over a oneshot channel.

use super::TransportError;
use crossbeam_channel::{unbounded, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::oneshot;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Blocking I/O worker pool
pub struct IoPool {
    jobs: Sender<Job>,
    size: usize,
}

impl IoPool {
    /// Spawn `size` workers (at least one)
    pub fn new(size: usize) -> Result<Self, TransportError> {
        let size = size.max(1);
        let (jobs, rx) = unbounded::<Job>();

        for index in 0..size {
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("rigcon-io-{index}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("I/O job panicked on worker {}", index);
                        }
                    }
                    debug!("I/O worker {} stopped", index);
                })
                .map_err(TransportError::IoError)?;
        }

        Ok(Self { jobs, size })
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.size
    }

    /// Run a blocking closure on a worker and await its result
    pub async fn run<T, F>(&self, f: F) -> Result<T, TransportError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            // Receiver may be gone if the caller was cancelled
            let _ = tx.send(f());
        });
        self.jobs
            .send(job)
            .map_err(|_| TransportError::WorkerUnavailable)?;
        rx.await.map_err(|_| TransportError::WorkerUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_run_returns_value() {
        let pool = IoPool::new(2).unwrap();
        let value = pool.run(|| 6 * 7).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_jobs_run_in_parallel_up_to_size() {
        let pool = Arc::new(IoPool::new(2).unwrap());
        let started = Instant::now();
        let a = pool.run(|| std::thread::sleep(Duration::from_millis(150)));
        let b = pool.run(|| std::thread::sleep(Duration::from_millis(150)));
        let (a, b) = tokio::join!(a, b);
        a.unwrap();
        b.unwrap();
        assert!(started.elapsed() < Duration::from_millis(290));
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = IoPool::new(1).unwrap();
        let result: Result<(), _> = pool.run(|| panic!("boom")).await;
        assert!(matches!(result, Err(TransportError::WorkerUnavailable)));

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.run(move || c.fetch_add(1, Ordering::SeqCst)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
