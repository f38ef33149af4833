use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::debug;

use crate::error::{Result, RunError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads that launch clients in parallel.
pub struct LaunchPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl LaunchPool {
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for idx in 0..size {
            let rx = rx.clone();
            let worker = thread::Builder::new()
                .name(format!("launch-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .map_err(|source| RunError::Spawn {
                    what: format!("launch worker {idx}"),
                    source,
                })?;
            workers.push(worker);
        }
        debug!(size, "launch pool started");
        Ok(Self {
            jobs: Some(tx),
            workers,
        })
    }

    /// One worker per core, keeping one core free, but never more than the
    /// largest batch that will be launched at once.
    pub fn size_for(largest_batch: usize) -> usize {
        let cores = thread::available_parallelism().map_or(1, |n| n.get());
        cores.saturating_sub(1).min(largest_batch).max(1)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Run every job on the pool and return their results in input order.
    ///
    /// A job that panics yields `ThreadPanic` in its own slot; the other
    /// results and the worker survive it.
    pub fn run_batch<T, F>(&self, batch: Vec<F>) -> Result<Vec<Result<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let Some(jobs) = &self.jobs else {
            return Err(RunError::ThreadPanic("launch pool"));
        };

        let expected = batch.len();
        let (done_tx, done_rx) = unbounded::<(usize, Result<T>)>();
        for (idx, job) in batch.into_iter().enumerate() {
            let done_tx = done_tx.clone();
            jobs.send(Box::new(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(job))
                    .map_err(|_| RunError::ThreadPanic("launch job"));
                let _ = done_tx.send((idx, outcome));
            }))
            .map_err(|_| RunError::ThreadPanic("launch pool"))?;
        }
        drop(done_tx);

        let mut results: Vec<Option<Result<T>>> = (0..expected).map(|_| None).collect();
        for (idx, value) in done_rx.iter() {
            results[idx] = Some(value);
        }
        // Only a job lost with its worker never reports back.
        results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or(RunError::ThreadPanic("launch worker"))
    }
}

impl Drop for LaunchPool {
    fn drop(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    #[test]
    fn results_come_back_in_input_order() {
        let pool = LaunchPool::new(3).unwrap();
        let jobs: Vec<_> = (0..10u64)
            .map(|i| {
                move || {
                    thread::sleep(Duration::from_millis(10 - i));
                    i * i
                }
            })
            .collect();
        let squares: Vec<u64> = pool
            .run_batch(jobs)
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(squares, (0..10u64).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn jobs_run_in_parallel() {
        let pool = LaunchPool::new(4).unwrap();
        let barrier = Arc::new(Barrier::new(4));
        let jobs: Vec<_> = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                move || {
                    barrier.wait();
                }
            })
            .collect();
        // Would deadlock if the pool ran jobs one at a time.
        assert_eq!(pool.run_batch(jobs).unwrap().len(), 4);
    }

    #[test]
    fn empty_batch_is_fine() {
        let pool = LaunchPool::new(1).unwrap();
        let out = pool.run_batch(Vec::<fn() -> u8>::new()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn panicking_job_keeps_the_others_and_the_worker() {
        let pool = LaunchPool::new(1).unwrap();
        let jobs: Vec<Box<dyn FnOnce() -> u8 + Send>> = vec![
            Box::new(|| 1),
            Box::new(|| -> u8 { panic!("launch failed") }),
            Box::new(|| 3),
        ];
        let results = pool.run_batch(jobs).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().ok(), Some(&1));
        assert!(matches!(results[1], Err(RunError::ThreadPanic(_))));
        assert_eq!(results[2].as_ref().ok(), Some(&3));

        // The single worker is still there for the next batch.
        let next = pool.run_batch(vec![|| 7u8]).unwrap();
        assert_eq!(next[0].as_ref().ok(), Some(&7));
    }

    #[test]
    fn pool_size_is_bounded_by_batch_and_at_least_one() {
        assert_eq!(LaunchPool::size_for(0), 1);
        assert_eq!(LaunchPool::size_for(1), 1);
        let cores = thread::available_parallelism().unwrap().get();
        assert_eq!(
            LaunchPool::size_for(10_000),
            cores.saturating_sub(1).max(1)
        );
    }
}
