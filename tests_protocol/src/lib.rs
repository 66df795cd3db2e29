//! # Protocol Contract Tests
//!
//! End-to-end tests for the relay runtime over real sockets: a listening
//! server, a connected client, and the full handshake/syscall/callback
//! surface between them. This crate holds the shared test doubles; the
//! scenarios live under `tests/`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use relay_client::{BridgeFault, ClientConfig, MemoryBridge, RelayClient, RetryPolicy};
use relay_log::{Logger, MemorySink};
use relay_server::{
    ContextId, HostError, KernelHost, PoolConfig, RelayServer, RemoteMemory, ServerConfig,
};
use session::default_substrate;
use transport::Endpoint;
use wire::SyscallReply;

/// Logger that stays quiet unless a test inspects it.
pub fn quiet_logger() -> Logger {
    Logger::new("test", Arc::new(MemorySink::new()))
}

/// A server running on its own thread, bound to an ephemeral endpoint.
pub struct RunningServer {
    pub server: Arc<RelayServer>,
    pub endpoint: Endpoint,
    join: Option<JoinHandle<()>>,
}

impl RunningServer {
    /// Stops the accept loop and joins the server thread.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.server.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Starts a server for `host` on an ephemeral TCP port.
pub fn start_tcp_server(host: Arc<dyn KernelHost>, pool: PoolConfig) -> RunningServer {
    let config = ServerConfig::new(Endpoint::Tcp("127.0.0.1:0".to_string())).with_pool(pool);
    start_server(config, host)
}

/// Starts a server for `host` on an explicit configuration.
pub fn start_server(config: ServerConfig, host: Arc<dyn KernelHost>) -> RunningServer {
    let server = Arc::new(
        RelayServer::bind_with(config, host, default_substrate(), quiet_logger())
            .expect("bind test server"),
    );
    let endpoint = server.local_endpoint().expect("resolve bound endpoint");
    let join = {
        let server = Arc::clone(&server);
        std::thread::spawn(move || {
            server.run().expect("server run");
        })
    };
    RunningServer {
        server,
        endpoint,
        join: Some(join),
    }
}

/// Connects a client with the default (no-retry) policy.
pub fn connect_client(endpoint: &Endpoint, bridge: Arc<dyn MemoryBridge>) -> RelayClient {
    connect_client_with(ClientConfig::new(endpoint.clone(), "test"), bridge)
}

/// Connects a client with an explicit configuration.
pub fn connect_client_with(config: ClientConfig, bridge: Arc<dyn MemoryBridge>) -> RelayClient {
    RelayClient::connect_with(config, bridge, default_substrate(), quiet_logger())
        .expect("connect test client")
}

/// Retry policy tuned for tests: patient enough for a restart, fast
/// enough not to stall a failing run.
pub fn test_retry() -> RetryPolicy {
    RetryPolicy::Auto {
        give_up_after: Duration::from_secs(10),
        initial_backoff: Duration::from_millis(25),
        max_backoff: Duration::from_millis(200),
    }
}

/// Host whose dispatcher echoes the syscall arguments back as result
/// data, with the syscall number and argument length as return values.
pub struct EchoHost;

impl KernelHost for EchoHost {
    fn spawn_guest(&self, _program: &str) -> Result<ContextId, HostError> {
        Ok(ContextId::new())
    }

    fn fork_context(&self, _context: ContextId) -> Result<ContextId, HostError> {
        Ok(ContextId::new())
    }

    fn exec_notify(&self, _context: ContextId) {}

    fn release(&self, _context: ContextId) {}

    fn syscall(
        &self,
        _context: ContextId,
        number: u32,
        args: &[u8],
        _memory: &dyn RemoteMemory,
    ) -> SyscallReply {
        SyscallReply {
            error: 0,
            retvals: [number as u64, args.len() as u64],
            data: args.to_vec(),
        }
    }
}

/// Host that sleeps for `number` milliseconds before echoing, so later
/// calls complete before earlier ones.
pub struct SlowEchoHost;

impl KernelHost for SlowEchoHost {
    fn spawn_guest(&self, _program: &str) -> Result<ContextId, HostError> {
        Ok(ContextId::new())
    }

    fn fork_context(&self, _context: ContextId) -> Result<ContextId, HostError> {
        Ok(ContextId::new())
    }

    fn exec_notify(&self, _context: ContextId) {}

    fn release(&self, _context: ContextId) {}

    fn syscall(
        &self,
        _context: ContextId,
        number: u32,
        args: &[u8],
        _memory: &dyn RemoteMemory,
    ) -> SyscallReply {
        std::thread::sleep(Duration::from_millis(number as u64));
        SyscallReply {
            error: 0,
            retvals: [number as u64, 0],
            data: args.to_vec(),
        }
    }
}

/// Host whose syscalls reach back into the caller's address space. The
/// syscall number selects the callback exercised:
///
/// - 1: `copy_in(args-addr, args-len)`, echoed as result data
/// - 2: `copy_out(0x2000, args)` then an empty success
/// - 3: `anon_mmap(len from args)`, mapped address as a return value
/// - 4: `raise_signal(31)` then an empty success
pub struct CallbackHost;

pub const SYS_READ_BACK: u32 = 1;
pub const SYS_WRITE_OUT: u32 = 2;
pub const SYS_MAP_ANON: u32 = 3;
pub const SYS_SIGNAL: u32 = 4;

impl KernelHost for CallbackHost {
    fn spawn_guest(&self, _program: &str) -> Result<ContextId, HostError> {
        Ok(ContextId::new())
    }

    fn fork_context(&self, _context: ContextId) -> Result<ContextId, HostError> {
        Ok(ContextId::new())
    }

    fn exec_notify(&self, _context: ContextId) {}

    fn release(&self, _context: ContextId) {}

    fn syscall(
        &self,
        _context: ContextId,
        number: u32,
        args: &[u8],
        memory: &dyn RemoteMemory,
    ) -> SyscallReply {
        match number {
            SYS_READ_BACK => {
                let mut addr = [0u8; 8];
                addr.copy_from_slice(&args[..8]);
                let mut len = [0u8; 8];
                len.copy_from_slice(&args[8..16]);
                match memory.copy_in(u64::from_be_bytes(addr), u64::from_be_bytes(len)) {
                    Ok(data) => SyscallReply::ok(data),
                    Err(_) => SyscallReply::failed(14),
                }
            }
            SYS_WRITE_OUT => match memory.copy_out(0x2000, args) {
                Ok(()) => SyscallReply::ok(Vec::new()),
                Err(_) => SyscallReply::failed(14),
            },
            SYS_MAP_ANON => match memory.anon_mmap(4096) {
                Ok(addr) => SyscallReply {
                    error: 0,
                    retvals: [addr, 0],
                    data: Vec::new(),
                },
                Err(_) => SyscallReply::failed(12),
            },
            SYS_SIGNAL => match memory.raise_signal(31) {
                Ok(()) => SyscallReply::ok(Vec::new()),
                Err(_) => SyscallReply::failed(14),
            },
            _ => SyscallReply::failed(38),
        }
    }
}

/// Host whose syscalls park until released, for admission-control and
/// teardown tests.
pub struct GateHost {
    entered: Mutex<usize>,
    entered_wake: Condvar,
    released: Mutex<bool>,
    release_wake: Condvar,
}

impl GateHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Mutex::new(0),
            entered_wake: Condvar::new(),
            released: Mutex::new(false),
            release_wake: Condvar::new(),
        })
    }

    /// Blocks until `count` syscalls are inside the dispatcher.
    pub fn wait_entered(&self, count: usize, timeout: Duration) -> bool {
        let entered = self.entered.lock().unwrap();
        let (entered, result) = self
            .entered_wake
            .wait_timeout_while(entered, timeout, |entered| *entered < count)
            .unwrap();
        drop(entered);
        !result.timed_out()
    }

    /// Lets every parked syscall finish.
    pub fn release_all(&self) {
        *self.released.lock().unwrap() = true;
        self.release_wake.notify_all();
    }
}

impl KernelHost for GateHost {
    fn spawn_guest(&self, _program: &str) -> Result<ContextId, HostError> {
        Ok(ContextId::new())
    }

    fn fork_context(&self, _context: ContextId) -> Result<ContextId, HostError> {
        Ok(ContextId::new())
    }

    fn exec_notify(&self, _context: ContextId) {}

    fn release(&self, _context: ContextId) {}

    fn syscall(
        &self,
        _context: ContextId,
        number: u32,
        _args: &[u8],
        _memory: &dyn RemoteMemory,
    ) -> SyscallReply {
        {
            let mut entered = self.entered.lock().unwrap();
            *entered += 1;
            self.entered_wake.notify_all();
        }
        let released = self.released.lock().unwrap();
        let _released = self
            .release_wake
            .wait_while(released, |released| !*released)
            .unwrap();
        SyscallReply {
            error: 0,
            retvals: [number as u64, 0],
            data: Vec::new(),
        }
    }
}

/// Host that counts context lifecycle calls, for prefork bookkeeping
/// tests.
pub struct TrackingHost {
    pub spawned: AtomicUsize,
    pub forked: AtomicUsize,
    pub released: AtomicUsize,
    pub exec_notified: AtomicUsize,
}

impl TrackingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            spawned: AtomicUsize::new(0),
            forked: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            exec_notified: AtomicUsize::new(0),
        })
    }
}

impl KernelHost for TrackingHost {
    fn spawn_guest(&self, _program: &str) -> Result<ContextId, HostError> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(ContextId::new())
    }

    fn fork_context(&self, _context: ContextId) -> Result<ContextId, HostError> {
        self.forked.fetch_add(1, Ordering::SeqCst);
        Ok(ContextId::new())
    }

    fn exec_notify(&self, _context: ContextId) {
        self.exec_notified.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self, _context: ContextId) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn syscall(
        &self,
        _context: ContextId,
        number: u32,
        args: &[u8],
        _memory: &dyn RemoteMemory,
    ) -> SyscallReply {
        SyscallReply {
            error: 0,
            retvals: [number as u64, 0],
            data: args.to_vec(),
        }
    }
}

/// A simulated client address space: regions keyed by base address.
pub struct TableBridge {
    regions: Mutex<HashMap<u64, Vec<u8>>>,
    next_map: AtomicU64,
    pub signals: Mutex<Vec<u32>>,
}

impl TableBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            regions: Mutex::new(HashMap::new()),
            next_map: AtomicU64::new(0x7000_0000),
            signals: Mutex::new(Vec::new()),
        })
    }

    pub fn with_region(self: Arc<Self>, addr: u64, data: Vec<u8>) -> Arc<Self> {
        self.regions.lock().unwrap().insert(addr, data);
        self
    }

    pub fn region(&self, addr: u64) -> Option<Vec<u8>> {
        self.regions.lock().unwrap().get(&addr).cloned()
    }
}

impl MemoryBridge for TableBridge {
    fn copy_in(&self, addr: u64, len: u64) -> Result<Vec<u8>, BridgeFault> {
        let regions = self.regions.lock().unwrap();
        let region = regions
            .get(&addr)
            .ok_or_else(|| BridgeFault(format!("no region at {addr:#x}")))?;
        if (len as usize) > region.len() {
            return Err(BridgeFault(format!("short region at {addr:#x}")));
        }
        Ok(region[..len as usize].to_vec())
    }

    fn copy_in_string(&self, addr: u64) -> Result<Vec<u8>, BridgeFault> {
        let regions = self.regions.lock().unwrap();
        let region = regions
            .get(&addr)
            .ok_or_else(|| BridgeFault(format!("no region at {addr:#x}")))?;
        let end = region.iter().position(|byte| *byte == 0).unwrap_or(region.len());
        Ok(region[..end].to_vec())
    }

    fn copy_out(&self, addr: u64, data: &[u8]) -> Result<(), BridgeFault> {
        self.regions.lock().unwrap().insert(addr, data.to_vec());
        Ok(())
    }

    fn copy_out_string(&self, addr: u64, data: &[u8]) -> Result<(), BridgeFault> {
        self.copy_out(addr, data)
    }

    fn anon_mmap(&self, len: u64) -> Result<u64, BridgeFault> {
        let addr = self.next_map.fetch_add(len.max(4096), Ordering::SeqCst);
        self.regions.lock().unwrap().insert(addr, vec![0; len as usize]);
        Ok(addr)
    }

    fn raise_signal(&self, signo: u32) -> Result<(), BridgeFault> {
        self.signals.lock().unwrap().push(signo);
        Ok(())
    }
}
