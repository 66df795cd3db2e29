//! Pre-fork records.
//!
//! A `Prefork` request forks the session's execution context before the
//! client performs its own OS-level fork. The forked context waits here,
//! keyed by a random token, until the child connects and claims it with
//! a `Fork` handshake. Claiming consumes the record; records are never
//! reaped otherwise unless a capacity bound is configured, in which case
//! the oldest record is evicted and its context handed back for release.

use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;
use wire::PreforkToken;

use crate::host::ContextId;

struct PreforkRecord {
    token: PreforkToken,
    context: ContextId,
}

/// Process-wide table of outstanding pre-fork records.
///
/// Mutated from both the handshake path and the syscall-dispatch path,
/// so it carries its own lock.
pub struct PreforkTable {
    capacity: Option<usize>,
    records: Mutex<Vec<PreforkRecord>>,
}

fn lock(records: &Mutex<Vec<PreforkRecord>>) -> MutexGuard<'_, Vec<PreforkRecord>> {
    records.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PreforkTable {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Stores a forked context under a fresh random token. Returns the
    /// token and, when the capacity bound evicted the oldest record, the
    /// evicted context for the caller to release.
    pub fn insert(&self, context: ContextId) -> (PreforkToken, Option<ContextId>) {
        let token = PreforkToken(Uuid::new_v4().into_bytes());
        let mut records = lock(&self.records);
        let evicted = match self.capacity {
            Some(capacity) if records.len() >= capacity && capacity > 0 => {
                Some(records.remove(0).context)
            }
            _ => None,
        };
        records.push(PreforkRecord { token, context });
        (token, evicted)
    }

    /// Consumes the record matching `token`, if any. A token matches at
    /// most once.
    pub fn claim(&self, token: &PreforkToken) -> Option<ContextId> {
        let mut records = lock(&self.records);
        let index = records.iter().position(|record| record.token == *token)?;
        Some(records.remove(index).context)
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.records).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_consumes_record_once() {
        let table = PreforkTable::new(None);
        let context = ContextId::new();
        let (token, evicted) = table.insert(context);
        assert!(evicted.is_none());

        assert_eq!(table.claim(&token), Some(context));
        assert_eq!(table.claim(&token), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_unknown_token_claims_nothing() {
        let table = PreforkTable::new(None);
        table.insert(ContextId::new());
        let bogus = PreforkToken([0u8; wire::TOKEN_LEN]);
        assert_eq!(table.claim(&bogus), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_tokens_are_unique() {
        let table = PreforkTable::new(None);
        let (first, _) = table.insert(ContextId::new());
        let (second, _) = table.insert(ContextId::new());
        assert_ne!(first, second);
    }

    #[test]
    fn test_unbounded_table_keeps_stale_records() {
        let table = PreforkTable::new(None);
        for _ in 0..100 {
            table.insert(ContextId::new());
        }
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let table = PreforkTable::new(Some(2));
        let first = ContextId::new();
        let (first_token, _) = table.insert(first);
        table.insert(ContextId::new());
        let (_, evicted) = table.insert(ContextId::new());
        assert_eq!(evicted, Some(first));
        assert_eq!(table.len(), 2);
        assert_eq!(table.claim(&first_token), None);
    }
}
