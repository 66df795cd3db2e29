//! Bounded worker pool.
//!
//! Syscall execution runs on pool workers so the accept loop and session
//! readers never block inside the hosting runtime. Admission control is
//! strict: with every worker busy and the pool at its ceiling, `submit`
//! fails immediately and the caller answers try-again; a request is
//! never silently dropped and never queued unboundedly. Idle workers
//! above the configured reserve exit after an idle timeout.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use relay_log::Logger;
use thiserror::Error;

use crate::config::PoolConfig;

/// Why a job was not admitted.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Every worker is busy and the pool is at its ceiling.
    #[error("worker pool saturated")]
    Saturated,

    /// The pool is shutting down.
    #[error("worker pool terminated")]
    Terminated,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    idle: usize,
    live: usize,
    shutdown: bool,
}

/// A bounded pool of worker threads.
pub struct WorkerPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    wake: Condvar,
    log: Logger,
}

fn lock(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerPool {
    pub fn new(config: PoolConfig, log: Logger) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                idle: 0,
                live: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
            log,
        })
    }

    /// Admits a job: hands it to an idle worker, or starts a worker if
    /// the pool is below its ceiling, or refuses with
    /// [`PoolError::Saturated`].
    pub fn submit(self: &Arc<Self>, job: Job) -> Result<(), PoolError> {
        let mut state = lock(&self.state);
        if state.shutdown {
            return Err(PoolError::Terminated);
        }
        if state.idle == 0 {
            if state.live >= self.config.max_workers {
                return Err(PoolError::Saturated);
            }
            state.live += 1;
            let pool = Arc::clone(self);
            let spawned = std::thread::Builder::new()
                .name("relay-worker".to_string())
                .spawn(move || pool.worker_loop());
            if spawned.is_err() {
                state.live -= 1;
                self.log.warn("could not start a worker thread");
                return Err(PoolError::Saturated);
            }
        }
        state.queue.push_back(job);
        self.wake.notify_one();
        Ok(())
    }

    /// Stops accepting work; queued jobs still run, then workers exit.
    pub fn shutdown(&self) {
        lock(&self.state).shutdown = true;
        self.wake.notify_all();
    }

    /// Live worker count, for tests and introspection.
    pub fn live_workers(&self) -> usize {
        lock(&self.state).live
    }

    fn worker_loop(self: Arc<Self>) {
        let mut state = lock(&self.state);
        loop {
            if let Some(job) = state.queue.pop_front() {
                drop(state);
                job();
                state = lock(&self.state);
                continue;
            }
            if state.shutdown {
                state.live -= 1;
                return;
            }
            state.idle += 1;
            let (guard, timeout) = self
                .wake
                .wait_timeout(state, self.config.idle_timeout)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            state.idle -= 1;
            if timeout.timed_out()
                && state.queue.is_empty()
                && !state.shutdown
                && state.live > self.config.reserve_workers
            {
                state.live -= 1;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_log::MemorySink;
    use std::sync::mpsc;
    use std::time::Duration;

    fn test_pool(config: PoolConfig) -> Arc<WorkerPool> {
        WorkerPool::new(config, Logger::new("pool", Arc::new(MemorySink::new())))
    }

    #[test]
    fn test_jobs_execute() {
        let pool = test_pool(PoolConfig::default());
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            pool.submit(Box::new(move || tx.send(i).unwrap())).unwrap();
        }
        let mut seen: Vec<i32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        pool.shutdown();
    }

    #[test]
    fn test_saturated_pool_refuses_immediately() {
        let pool = test_pool(PoolConfig {
            max_workers: 1,
            reserve_workers: 0,
            idle_timeout: Duration::from_secs(5),
        });

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.submit(Box::new(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The only worker is busy and the ceiling is 1.
        let refused = pool.submit(Box::new(|| {}));
        assert_eq!(refused, Err(PoolError::Saturated));

        release_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_idle_workers_above_reserve_exit() {
        let pool = test_pool(PoolConfig {
            max_workers: 4,
            reserve_workers: 1,
            idle_timeout: Duration::from_millis(50),
        });

        let (tx, rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let go_rx = Arc::new(Mutex::new(go_rx));
        for _ in 0..3 {
            let tx = tx.clone();
            let go_rx = Arc::clone(&go_rx);
            pool.submit(Box::new(move || {
                tx.send(()).unwrap();
                go_rx.lock().unwrap().recv().unwrap();
            }))
            .unwrap();
        }
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(pool.live_workers(), 3);
        for _ in 0..3 {
            go_tx.send(()).unwrap();
        }

        // Idle reaping brings the pool back down to the reserve.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.live_workers() > 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.live_workers(), 1);
        pool.shutdown();
    }

    #[test]
    fn test_terminated_pool_refuses() {
        let pool = test_pool(PoolConfig::default());
        pool.shutdown();
        assert_eq!(pool.submit(Box::new(|| {})), Err(PoolError::Terminated));
    }
}
