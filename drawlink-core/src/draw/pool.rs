//! Fixed-size worker pool for index-parameterised work.
//!
//! [`WorkerPool::run`] invokes a function once for every index in
//! `0..count` across a set of persistent threads and returns when all of
//! them have finished. Each thread owns one scratch value (`S`), handed to
//! the function by `&mut`; expensive per-thread state such as match tables
//! and transform buffers lives there and is reused across calls.
//!
//! If the threads cannot be started the pool degrades to running every
//! index on the caller's thread.

use std::sync::{Mutex, MutexGuard};

use rayon::iter::{IntoParallelIterator, ParallelIterator};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{info, warn};

/// Upper bound on worker threads.
pub const MAX_WORKERS: usize = 8;

/// Default worker count: half the logical cores, clamped to `1..=8`.
pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    (cores / 2).clamp(1, MAX_WORKERS)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A fixed set of worker threads, each with its own scratch state.
pub struct WorkerPool<S> {
    threads: Option<ThreadPool>,
    scratch: Vec<Mutex<S>>,
    /// Serialises concurrent `run` callers.
    gate: Mutex<()>,
}

impl<S: Send> WorkerPool<S> {
    /// Start `workers` threads (clamped to `1..=MAX_WORKERS`), building one
    /// scratch value per thread with `init`.
    pub fn new(workers: usize, init: impl Fn() -> S) -> Self {
        let workers = workers.clamp(1, MAX_WORKERS);
        let threads = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("draw-worker-{i}"))
            .build();
        let (threads, slots) = match threads {
            Ok(pool) => {
                info!("worker pool started with {workers} threads");
                (Some(pool), workers)
            }
            Err(e) => {
                warn!("worker pool unavailable ({e}); encoding on the caller thread");
                (None, 1)
            }
        };
        Self {
            threads,
            scratch: (0..slots).map(|_| Mutex::new(init())).collect(),
            gate: Mutex::new(()),
        }
    }

    /// A single-threaded pool that runs everything on the caller.
    pub fn inline(init: impl Fn() -> S) -> Self {
        Self {
            threads: None,
            scratch: vec![Mutex::new(init())],
            gate: Mutex::new(()),
        }
    }

    /// Number of threads work is spread over.
    pub fn workers(&self) -> usize {
        self.scratch.len()
    }

    /// Invoke `work(scratch, i)` exactly once for each `i` in `0..count`,
    /// blocking until all invocations have returned.
    ///
    /// Invocations run in no particular order and must not depend on each
    /// other. Only one `run` executes at a time; other callers wait.
    pub fn run<F>(&self, count: usize, work: F)
    where
        F: Fn(&mut S, usize) + Sync,
    {
        if count == 0 {
            return;
        }
        let _gate = lock(&self.gate);
        match &self.threads {
            Some(pool) => pool.install(|| {
                (0..count).into_par_iter().for_each(|i| {
                    let slot = rayon::current_thread_index().unwrap_or(0) % self.scratch.len();
                    let mut scratch = lock(&self.scratch[slot]);
                    work(&mut scratch, i);
                });
            }),
            None => {
                let mut scratch = lock(&self.scratch[0]);
                for i in 0..count {
                    work(&mut scratch, i);
                }
            }
        }
    }

    /// Like [`run`](Self::run), collecting each invocation's result at its
    /// index.
    pub fn map<T, F>(&self, count: usize, work: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&mut S, usize) -> T + Sync,
    {
        let results: Vec<Mutex<Option<T>>> = (0..count).map(|_| Mutex::new(None)).collect();
        self.run(count, |scratch, i| {
            *lock(&results[i]) = Some(work(scratch, i));
        });
        results
            .into_iter()
            .filter_map(|slot| slot.into_inner().unwrap_or_else(|p| p.into_inner()))
            .collect()
    }
}
