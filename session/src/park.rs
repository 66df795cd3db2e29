//! Abstract blocking-wait substrate.
//!
//! The relay logic never blocks on a concrete primitive; it blocks on a
//! [`Signal`] produced by the session's [`WaitSubstrate`]. A signal is an
//! epoch counter: a waiter captures the epoch, re-checks its own
//! predicate, and parks until the epoch advances. Capturing the epoch
//! before the predicate check closes the lost-wakeup window without the
//! waiter ever holding the notifier's lock.
//!
//! Two substrates are provided:
//!
//! - [`ThreadSubstrate`]: native threads parked on a mutex and condition
//!   variable. The default.
//! - [`YieldSubstrate`]: cooperative scheduling; "parking" yields the
//!   thread back to the scheduler until the epoch moves. This is the
//!   single-process backend where blocking must not monopolize an OS
//!   thread's attention.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// An epoch-counted wakeup signal.
pub trait Signal: Send + Sync {
    /// Current epoch. Captured before checking the waiter's predicate.
    fn epoch(&self) -> u64;

    /// Parks until the epoch is no longer `seen`. Returns immediately if
    /// it already advanced.
    fn wait_from(&self, seen: u64);

    /// Advances the epoch and wakes every parked waiter.
    fn notify(&self);
}

/// Produces the signals a session parks its waiters on.
pub trait WaitSubstrate: Send + Sync {
    fn new_signal(&self) -> Arc<dyn Signal>;
}

/// The default substrate for the thread-based runtime.
pub struct ThreadSubstrate;

impl WaitSubstrate for ThreadSubstrate {
    fn new_signal(&self) -> Arc<dyn Signal> {
        Arc::new(ThreadSignal {
            epoch: Mutex::new(0),
            wake: Condvar::new(),
        })
    }
}

struct ThreadSignal {
    epoch: Mutex<u64>,
    wake: Condvar,
}

impl Signal for ThreadSignal {
    fn epoch(&self) -> u64 {
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_from(&self, seen: u64) {
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        while *epoch == seen {
            epoch = self
                .wake
                .wait(epoch)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn notify(&self) {
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch = epoch.wrapping_add(1);
        self.wake.notify_all();
    }
}

/// Cooperative substrate: waiters yield instead of parking.
pub struct YieldSubstrate;

impl WaitSubstrate for YieldSubstrate {
    fn new_signal(&self) -> Arc<dyn Signal> {
        Arc::new(YieldSignal {
            epoch: AtomicU64::new(0),
        })
    }
}

struct YieldSignal {
    epoch: AtomicU64,
}

impl Signal for YieldSignal {
    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn wait_from(&self, seen: u64) {
        while self.epoch.load(Ordering::Acquire) == seen {
            std::thread::yield_now();
        }
    }

    fn notify(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

/// The substrate used when a caller has no opinion.
pub fn default_substrate() -> Arc<dyn WaitSubstrate> {
    Arc::new(ThreadSubstrate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn exercise(substrate: &dyn WaitSubstrate) {
        let signal = substrate.new_signal();
        let seen = signal.epoch();

        let waiter = {
            let signal = Arc::clone(&signal);
            std::thread::spawn(move || signal.wait_from(seen))
        };

        std::thread::sleep(Duration::from_millis(20));
        signal.notify();
        waiter.join().unwrap();
        assert_ne!(signal.epoch(), seen);
    }

    #[test]
    fn test_thread_signal_wakes_waiter() {
        exercise(&ThreadSubstrate);
    }

    #[test]
    fn test_yield_signal_wakes_waiter() {
        exercise(&YieldSubstrate);
    }

    #[test]
    fn test_notify_before_wait_is_not_lost() {
        let signal = ThreadSubstrate.new_signal();
        let seen = signal.epoch();
        signal.notify();
        // The epoch already advanced; wait_from must return immediately.
        signal.wait_from(seen);
    }
}
