//! Pre-fork token handoff: a parent reserves a forked execution context,
//! a child claims it over a fresh session, impostors are rejected, and a
//! failed fork retires the record.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use relay_client::{ClientConfig, ClientError, RelayClient};
use relay_server::PoolConfig;
use session::default_substrate;
use tests_protocol::{
    connect_client, quiet_logger, start_tcp_server, TableBridge, TrackingHost,
};
use wire::{ErrorCode, PreforkToken, TOKEN_LEN};

#[test]
fn test_child_claims_prefork_token_on_fresh_session() {
    let host = TrackingHost::new();
    let run = start_tcp_server(host.clone(), PoolConfig::default());
    let parent = connect_client(&run.endpoint, TableBridge::new());

    let token = parent.prefork_begin().unwrap();
    assert_eq!(host.forked.load(Ordering::SeqCst), 1);

    // The "child": a brand-new endpoint presenting the token instead of
    // a guest handshake.
    let child = RelayClient::connect_forked(
        ClientConfig::new(run.endpoint.clone(), "test-child"),
        TableBridge::new(),
        default_substrate(),
        quiet_logger(),
        token,
    )
    .unwrap();

    let reply = child.execute_syscall(3, b"hi").unwrap();
    assert_eq!(reply.error, 0);
    assert_eq!(reply.retvals[0], 3);

    // No second guest context was created for the child.
    assert_eq!(host.spawned.load(Ordering::SeqCst), 1);

    child.close();
    parent.close();
    run.stop();
}

#[test]
fn test_unknown_token_is_rejected() {
    let host = TrackingHost::new();
    let run = start_tcp_server(host.clone(), PoolConfig::default());
    let parent = connect_client(&run.endpoint, TableBridge::new());
    let _token = parent.prefork_begin().unwrap();

    let impostor = RelayClient::connect_forked(
        ClientConfig::new(run.endpoint.clone(), "impostor"),
        TableBridge::new(),
        default_substrate(),
        quiet_logger(),
        PreforkToken([0x42; TOKEN_LEN]),
    );
    let error = impostor.err().expect("impostor must be rejected");
    assert!(
        matches!(error, ClientError::Remote(ErrorCode::InvalidPreforkToken)),
        "expected invalid-prefork-token, got {error:?}"
    );

    parent.close();
    run.stop();
}

#[test]
fn test_token_claims_exactly_once() {
    let host = TrackingHost::new();
    let run = start_tcp_server(host.clone(), PoolConfig::default());
    let parent = connect_client(&run.endpoint, TableBridge::new());
    let token = parent.prefork_begin().unwrap();

    let first = RelayClient::connect_forked(
        ClientConfig::new(run.endpoint.clone(), "child"),
        TableBridge::new(),
        default_substrate(),
        quiet_logger(),
        token,
    );
    assert!(first.is_ok());

    let second = RelayClient::connect_forked(
        ClientConfig::new(run.endpoint.clone(), "child-again"),
        TableBridge::new(),
        default_substrate(),
        quiet_logger(),
        token,
    );
    let error = second.err().expect("a consumed token must not claim again");
    assert!(
        matches!(error, ClientError::Remote(ErrorCode::InvalidPreforkToken)),
        "expected invalid-prefork-token, got {error:?}"
    );

    parent.close();
    run.stop();
}

#[test]
fn test_fork_cancel_retires_record_and_releases_context() {
    let host = TrackingHost::new();
    let run = start_tcp_server(host.clone(), PoolConfig::default());
    let parent = connect_client(&run.endpoint, TableBridge::new());

    let token = parent.prefork_begin().unwrap();
    assert_eq!(host.released.load(Ordering::SeqCst), 0);

    // The OS-level fork failed; the record must not strand its context.
    parent.fork_cancel(token).unwrap();
    assert_eq!(host.released.load(Ordering::SeqCst), 1);

    // The token is gone.
    let late = RelayClient::connect_forked(
        ClientConfig::new(run.endpoint.clone(), "late-child"),
        TableBridge::new(),
        default_substrate(),
        quiet_logger(),
        token,
    );
    assert!(matches!(
        late,
        Err(ClientError::Remote(ErrorCode::InvalidPreforkToken))
    ));

    parent.close();
    run.stop();
}
