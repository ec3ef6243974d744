//! Bounded worker pool for user-initiated pipeline runs.
//!
//! A fixed set of threads pulls jobs off a bounded crossbeam queue. Each job
//! carries its own `CancellationToken`; the returned `JobHandle` can cancel it
//! and wait for its result.

#![allow(missing_docs)]

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::core::errors::{DeployError, Result};
use crate::pipeline::cancel::CancellationToken;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Queued jobs allowed per worker before `submit` refuses more.
const QUEUE_PER_WORKER: usize = 16;

pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `threads` workers (at least one).
    pub fn new(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let (tx, rx) = bounded::<Job>(threads * QUEUE_PER_WORKER);
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("fdp-worker-{index}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            eprintln!("[FDP-PIPELINE] worker job panicked; worker continues");
                        }
                    }
                })
                .map_err(|e| DeployError::Runtime {
                    details: format!("failed to spawn worker thread: {e}"),
                })?;
            workers.push(handle);
        }
        Ok(Self {
            tx: Some(tx),
            workers,
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue `work`. It receives the token that the returned handle cancels.
    pub fn submit<T, F>(&self, cancel: CancellationToken, work: F) -> Result<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
    {
        let tx = self.tx.as_ref().ok_or(DeployError::ChannelClosed {
            component: "worker-pool",
        })?;
        let (result_tx, result_rx) = bounded::<T>(1);
        let token = cancel.clone();
        let job: Job = Box::new(move || {
            let _ = result_tx.send(work(&token));
        });
        match tx.try_send(job) {
            Ok(()) => Ok(JobHandle {
                cancel,
                result: result_rx,
            }),
            Err(TrySendError::Full(_)) => Err(DeployError::Runtime {
                details: "worker queue is full".to_string(),
            }),
            Err(TrySendError::Disconnected(_)) => Err(DeployError::ChannelClosed {
                component: "worker-pool",
            }),
        }
    }

    /// Stop accepting jobs, let queued ones finish, and join the workers.
    pub fn shutdown(mut self) {
        self.join_all();
    }

    fn join_all(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join_all();
    }
}

/// Handle to one queued or running job.
pub struct JobHandle<T> {
    cancel: CancellationToken,
    result: Receiver<T>,
}

impl<T> JobHandle<T> {
    /// Request cancellation. The job observes it at its next check.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Block until the job finishes.
    pub fn wait(self) -> Result<T> {
        self.result.recv().map_err(|_| DeployError::ChannelClosed {
            component: "worker-job",
        })
    }

    /// Wait up to `timeout`; `Ok(None)` if the job is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        match self.result.recv_timeout(timeout) {
            Ok(value) => Ok(Some(value)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DeployError::ChannelClosed {
                component: "worker-job",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_jobs_and_returns_results() {
        let pool = WorkerPool::new(2).unwrap();
        let handles: Vec<_> = (0..6)
            .map(|i| pool.submit(CancellationToken::new(), move |_| i * 2).unwrap())
            .collect();
        let sum: i32 = handles.into_iter().map(|h| h.wait().unwrap()).sum();
        assert_eq!(sum, 30);
        pool.shutdown();
    }

    #[test]
    fn concurrency_is_bounded_by_pool_size() {
        let pool = WorkerPool::new(2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.submit(CancellationToken::new(), move |_| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        for h in handles {
            h.wait().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn cancellation_reaches_the_job() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool
            .submit(CancellationToken::new(), |token| {
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                token.check("executing")
            })
            .unwrap();
        assert!(handle.wait_timeout(Duration::from_millis(30)).unwrap().is_none());
        handle.cancel();
        let err = handle.wait().unwrap().unwrap_err();
        assert_eq!(err.code(), "FDP-4002");
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1).unwrap();
        let bad = pool
            .submit(CancellationToken::new(), |_| -> u8 { panic!("boom") })
            .unwrap();
        assert!(bad.wait().is_err());
        let good = pool.submit(CancellationToken::new(), |_| 7_u8).unwrap();
        assert_eq!(good.wait().unwrap(), 7);
    }
}
