//! Bounded FIFO worker pool.
//!
//! Tasks run to completion on a worker; there is no in-task suspension.
//! `submit()` fails once shutdown has begun, and `shutdown()` drains the
//! queue before joining the workers. The pool is shared behind an `Arc`
//! by its submitters; `shutdown` must not be called from a worker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::error::{KestrelResult, OpError};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    state: Mutex<PoolState>,
    work_available: Condvar,
}

struct PoolState {
    queue: VecDeque<Job>,
    shutdown: bool,
}

/// Fixed-size pool of named worker threads.
pub struct ThreadPool {
    name: String,
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawn `num_threads` workers named `<name>-<i>`.
    pub fn new(name: &str, num_threads: usize) -> Self {
        assert!(num_threads > 0, "pool needs at least one worker");
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            work_available: Condvar::new(),
        });

        let workers = (0..num_threads)
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        Self {
            name: name.to_string(),
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a task. Fails with `Unavailable` after shutdown.
    pub fn submit<F>(&self, job: F) -> KestrelResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(OpError::Unavailable(format!("pool {} shut down", self.name)).into());
        }
        state.queue.push_back(Box::new(job));
        drop(state);
        self.shared.work_available.notify_one();
        Ok(())
    }

    /// Number of queued (not yet started) tasks.
    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Stop accepting work, drain the queue, and join all workers.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.shared.work_available.notify_all();
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!(pool = %self.name, "pool worker panicked");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                if state.shutdown {
                    return;
                }
                shared.work_available.wait(&mut state);
            }
        };
        job();
    }
}
