//! Session registry and per-session server state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use session::{Session, SessionId, Signal, WaitSubstrate};
use thiserror::Error;

use crate::host::ContextId;

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The session table is at its configured capacity
    #[error("session table full ({capacity} sessions)")]
    Full { capacity: usize },
}

/// Server-side state attached to one session: the bound execution
/// context, the in-exec flag, and the count of workers currently inside
/// the hosting runtime on this session's behalf.
pub struct ServerSession {
    session: Arc<Session>,
    context: Mutex<Option<ContextId>>,
    in_exec: AtomicBool,
    active_workers: Mutex<usize>,
    drained: Arc<dyn Signal>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServerSession {
    pub fn new(session: Arc<Session>, substrate: &dyn WaitSubstrate) -> Arc<Self> {
        Arc::new(Self {
            session,
            context: Mutex::new(None),
            in_exec: AtomicBool::new(false),
            active_workers: Mutex::new(0),
            drained: substrate.new_signal(),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn context(&self) -> Option<ContextId> {
        *lock(&self.context)
    }

    pub fn bind_context(&self, context: ContextId) {
        *lock(&self.context) = Some(context);
    }

    /// Detaches the context at teardown so the caller can release it.
    pub fn take_context(&self) -> Option<ContextId> {
        lock(&self.context).take()
    }

    pub fn in_exec(&self) -> bool {
        self.in_exec.load(Ordering::Acquire)
    }

    pub fn set_in_exec(&self, value: bool) {
        self.in_exec.store(value, Ordering::Release);
    }

    /// Marks a worker entering the hosting runtime for this session.
    pub fn worker_begin(&self) {
        *lock(&self.active_workers) += 1;
    }

    /// Marks a worker leaving; wakes an exec-continuation waiting for
    /// the context to drain.
    pub fn worker_end(&self) {
        let mut active = lock(&self.active_workers);
        *active -= 1;
        if *active == 0 {
            drop(active);
            self.drained.notify();
        }
    }

    pub fn active_workers(&self) -> usize {
        *lock(&self.active_workers)
    }

    /// Parks until no worker is inside the hosting runtime for this
    /// session.
    pub fn wait_workers_drained(&self) {
        loop {
            let seen = self.drained.epoch();
            if self.active_workers() == 0 {
                return;
            }
            self.drained.wait_from(seen);
        }
    }
}

/// Process-wide table of connected sessions with an explicit capacity.
pub struct SessionRegistry {
    capacity: usize,
    entries: Mutex<HashMap<SessionId, Arc<ServerSession>>>,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, entry: Arc<ServerSession>) -> Result<(), RegistryError> {
        let mut entries = lock(&self.entries);
        if entries.len() >= self.capacity {
            return Err(RegistryError::Full {
                capacity: self.capacity,
            });
        }
        entries.insert(entry.session().id(), entry);
        Ok(())
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<ServerSession>> {
        lock(&self.entries).get(&id).cloned()
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<ServerSession>> {
        lock(&self.entries).remove(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn at_capacity(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Empties the registry at shutdown, returning every entry for
    /// teardown.
    pub fn drain(&self) -> Vec<Arc<ServerSession>> {
        lock(&self.entries).drain().map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_log::{Logger, MemorySink};
    use session::default_substrate;
    use std::net::{TcpListener, TcpStream};
    use transport::RelayStream;

    fn test_entry() -> Arc<ServerSession> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let near = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let _far = listener.accept().unwrap();
        let substrate = default_substrate();
        let session = Session::with_stream(
            RelayStream::Tcp(near),
            substrate.clone(),
            None,
            Logger::new("test", Arc::new(MemorySink::new())),
        )
        .unwrap();
        ServerSession::new(session, substrate.as_ref())
    }

    #[test]
    fn test_capacity_is_enforced() {
        let registry = SessionRegistry::new(2);
        registry.insert(test_entry()).unwrap();
        registry.insert(test_entry()).unwrap();
        assert!(registry.at_capacity());
        assert_eq!(
            registry.insert(test_entry()),
            Err(RegistryError::Full { capacity: 2 })
        );
    }

    #[test]
    fn test_remove_frees_a_slot() {
        let registry = SessionRegistry::new(1);
        let entry = test_entry();
        let id = entry.session().id();
        registry.insert(entry).unwrap();
        assert!(registry.remove(id).is_some());
        assert!(registry.is_empty());
        registry.insert(test_entry()).unwrap();
    }

    #[test]
    fn test_context_binding() {
        let entry = test_entry();
        assert_eq!(entry.context(), None);
        let context = ContextId::new();
        entry.bind_context(context);
        assert_eq!(entry.context(), Some(context));
        assert_eq!(entry.take_context(), Some(context));
        assert_eq!(entry.context(), None);
    }

    #[test]
    fn test_drain_wait_completes_when_workers_leave() {
        let entry = test_entry();
        entry.worker_begin();
        entry.worker_begin();

        let waiter = {
            let entry = Arc::clone(&entry);
            std::thread::spawn(move || entry.wait_workers_drained())
        };

        entry.worker_end();
        std::thread::sleep(std::time::Duration::from_millis(20));
        entry.worker_end();
        waiter.join().unwrap();
        assert_eq!(entry.active_workers(), 0);
    }
}
