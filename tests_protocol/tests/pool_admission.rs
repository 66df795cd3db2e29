//! Worker-pool admission control: a saturated pool answers try-again
//! instead of queueing or dropping, and recovers once a worker frees up.

use std::sync::Arc;
use std::time::Duration;

use relay_client::ClientError;
use relay_server::PoolConfig;
use tests_protocol::{connect_client, start_tcp_server, GateHost, TableBridge};
use wire::ErrorCode;

fn tiny_pool() -> PoolConfig {
    PoolConfig {
        max_workers: 1,
        reserve_workers: 1,
        idle_timeout: Duration::from_secs(10),
    }
}

#[test]
fn test_saturated_pool_answers_try_again() {
    let gate = GateHost::new();
    let run = start_tcp_server(gate.clone(), tiny_pool());
    let client = Arc::new(connect_client(&run.endpoint, TableBridge::new()));

    // Occupy the only worker.
    let busy = {
        let client = Arc::clone(&client);
        std::thread::spawn(move || client.execute_syscall(1, &[]))
    };
    assert!(gate.wait_entered(1, Duration::from_secs(5)));

    // The pool is at its ceiling with no idle worker: an immediate
    // try-again, not an indefinite block.
    let started = std::time::Instant::now();
    let refused = client.execute_syscall(2, &[]);
    assert!(started.elapsed() < Duration::from_secs(2));
    let error = refused.err().expect("saturated pool must refuse");
    assert!(
        matches!(error, ClientError::Remote(ErrorCode::TryAgain)),
        "expected try-again, got {error:?}"
    );

    // The session survived the refusal and recovers once the worker is
    // free again.
    gate.release_all();
    assert_eq!(busy.join().unwrap().unwrap().retvals[0], 1);
    let reply = client.execute_syscall(3, &[]).unwrap();
    assert_eq!(reply.retvals[0], 3);

    client.close();
    run.stop();
}
