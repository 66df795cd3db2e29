//! Pending waits and the request-correlation table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use wire::ErrorCode;

use crate::park::Signal;

/// How an outstanding request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A matching response frame arrived; this is its body.
    Reply(Vec<u8>),
    /// A matching error frame arrived.
    Fault(ErrorCode),
    /// The connection died or the session generation moved on before a
    /// response arrived.
    Disconnected,
}

/// One outstanding request: the correlation number, the generation it was
/// issued under, and the signal its caller parks on.
///
/// At most one pending wait exists per outstanding request number; the
/// table removes it the instant its outcome is known.
pub struct PendingWait {
    request_no: u64,
    generation: u64,
    outcome: Mutex<Option<WaitOutcome>>,
    signal: Arc<dyn Signal>,
}

impl PendingWait {
    pub fn new(request_no: u64, generation: u64, signal: Arc<dyn Signal>) -> Self {
        Self {
            request_no,
            generation,
            outcome: Mutex::new(None),
            signal,
        }
    }

    pub fn request_no(&self) -> u64 {
        self.request_no
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Records the outcome and wakes the waiter. The first writer wins;
    /// a second completion (response racing a disconnect) is dropped.
    pub fn complete(&self, outcome: WaitOutcome) {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(outcome);
            drop(slot);
            self.signal.notify();
        }
    }

    /// Takes the outcome if one arrived.
    pub fn try_take(&self) -> Option<WaitOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_done(&self) -> bool {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Epoch of the waiter's signal; capture before re-checking
    /// [`PendingWait::is_done`] so a wakeup between the check and the
    /// park is not lost.
    pub fn signal_epoch(&self) -> u64 {
        self.signal.epoch()
    }

    /// Parks until the signal advances past `seen`.
    pub fn park_from(&self, seen: u64) {
        self.signal.wait_from(seen);
    }

    /// Wakes the waiter without recording an outcome, so it re-examines
    /// the session (used when the reader role frees up).
    pub fn nudge(&self) {
        self.signal.notify();
    }
}

/// Table of pending waits keyed by request number.
#[derive(Default)]
pub struct WaitTable {
    waits: HashMap<u64, Arc<PendingWait>>,
}

impl WaitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, wait: Arc<PendingWait>) {
        self.waits.insert(wait.request_no(), wait);
    }

    pub fn remove(&mut self, request_no: u64) -> Option<Arc<PendingWait>> {
        self.waits.remove(&request_no)
    }

    /// Removes every wait, for generation bumps and teardown.
    pub fn drain(&mut self) -> Vec<Arc<PendingWait>> {
        self.waits.drain().map(|(_, wait)| wait).collect()
    }

    /// Snapshot of the current waits, for reader-handoff nudges.
    pub fn snapshot(&self) -> Vec<Arc<PendingWait>> {
        self.waits.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.waits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }
}
