//! Fixed-width worker pool for build jobs.
//!
//! Every job is queued before any worker starts; `width` scoped threads
//! drain the queue and the caller gets one result per job, in submission
//! order, once the pool is empty.

use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread;

/// A unit of work handed to [`WorkerPool::run`].
pub type Job<'a, T> = Box<dyn FnOnce() -> T + Send + 'a>;

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    width: usize,
}

impl WorkerPool {
    /// A pool running at most `width` jobs at once (at least one).
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Run all `jobs` and return their results in submission order.
    pub fn run<'a, T: Send>(&self, jobs: Vec<Job<'a, T>>) -> Vec<T> {
        let total = jobs.len();
        if total == 0 {
            return Vec::new();
        }

        let (job_tx, job_rx) = mpsc::channel::<(usize, Job<'a, T>)>();
        for job in jobs.into_iter().enumerate() {
            // The receiver is alive until the scope below ends.
            let _ = job_tx.send(job);
        }
        drop(job_tx);
        let job_rx = Mutex::new(job_rx);
        let (result_tx, result_rx) = mpsc::channel::<(usize, T)>();

        let workers = self.width.min(total);
        thread::scope(|s| {
            for _ in 0..workers {
                let tx = result_tx.clone();
                let rx = &job_rx;
                s.spawn(move || loop {
                    let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
                    let Ok((index, job)) = next else {
                        break;
                    };
                    if tx.send((index, job())).is_err() {
                        break;
                    }
                });
            }
        });
        drop(result_tx);

        let mut results: Vec<(usize, T)> = result_rx.into_iter().collect();
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }
}
