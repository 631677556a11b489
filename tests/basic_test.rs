// Copyright 2020 Joyent, Inc.

mod common;

use std::error::Error as StdError;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use poolroom::connection::Connection;
use poolroom::connection_pool::types::{ConnectionCount, ConnectionPoolOptions};
use poolroom::connection_pool::ConnectionPool;
use poolroom::error::Error;

use common::{
    endpoint, log_from_env, DummyBackend, DummyConnection, DummyError,
};

fn pool_options(max_connections: u32, claim_timeout: Option<u64>) -> ConnectionPoolOptions {
    ConnectionPoolOptions {
        max_connections: Some(max_connections),
        claim_timeout,
        log: Some(log_from_env()),
        connection_check_interval: None,
    }
}

#[test]
fn connection_pool_accounting() {
    let backend = DummyBackend::new();
    let pool = ConnectionPool::new(
        endpoint("accounting"),
        pool_options(3, Some(1000)),
        DummyConnection::creator(backend.clone()),
    );
    let max_connections: ConnectionCount = 3.into();

    // Connections are created lazily
    let starting_stats = pool.stats();
    assert_eq!(starting_stats.total_connections, 0.into());
    assert_eq!(starting_stats.idle_connections, 0.into());
    assert_eq!(backend.created(), 0);

    let conn1 = pool.connect().unwrap();
    let conn2 = pool.connect().unwrap();
    let conn3 = pool.connect().unwrap();

    let stats = pool.stats();
    assert_eq!(stats.total_connections, max_connections);
    assert_eq!(stats.idle_connections, 0.into());
    assert_eq!(stats.claimed_connections(), max_connections);

    drop(conn3);
    let stats = pool.stats();
    assert_eq!(stats.total_connections, max_connections);
    assert_eq!(stats.idle_connections, 1.into());

    drop(conn2);
    drop(conn1);
    let stats = pool.stats();
    assert_eq!(stats.total_connections, max_connections);
    assert_eq!(stats.idle_connections, max_connections);

    // Idle connections are reused rather than recreated
    let conn = pool.connect().unwrap();
    assert_eq!(backend.created(), 3);
    assert_eq!(pool.stats().idle_connections, 2.into());
    drop(conn);

    assert_eq!(pool.current_size(), 3);
    assert_eq!(backend.closed(), 0);
}

#[test]
fn connection_pool_claim_timeout() {
    let backend = DummyBackend::new();
    let pool = Arc::new(ConnectionPool::new(
        endpoint("claim"),
        pool_options(3, Some(1000)),
        DummyConnection::creator(backend.clone()),
    ));

    let barrier1 = Arc::new(Barrier::new(4));
    let barrier2 = Arc::new(Barrier::new(4));

    let threads: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            let barrier1 = barrier1.clone();
            let barrier2 = barrier2.clone();
            thread::spawn(move || {
                let conn_result = pool.connect();
                assert!(conn_result.is_ok());
                barrier1.wait();
                barrier2.wait();
            })
        })
        .collect();

    barrier1.wait();

    // This will time out after one second based on the claim_timeout
    // specified in the pool options
    match pool.connect() {
        Err(Error::ClaimTimeout(1000)) => (),
        other => panic!("expected a claim timeout, got {:?}", other),
    }
    assert_eq!(pool.current_size(), 3);

    barrier2.wait();
    for t in threads {
        t.join().unwrap();
    }

    assert!(pool.connect().is_ok());
    assert_eq!(backend.created(), 3);
}

#[test]
fn connection_pool_blocks_until_release() {
    let backend = DummyBackend::new();
    let pool = Arc::new(ConnectionPool::new(
        endpoint("blocking"),
        pool_options(1, None),
        DummyConnection::creator(backend.clone()),
    ));

    let conn = pool.connect().unwrap();
    let first_id = conn.id;

    let pool_clone = pool.clone();
    let waiter = thread::spawn(move || pool_clone.connect().map(|c| c.id));

    thread::sleep(Duration::from_millis(200));
    assert_eq!(pool.current_size(), 1);
    drop(conn);

    let claimed_id = waiter.join().unwrap().unwrap();
    assert_eq!(claimed_id, first_id);
    assert_eq!(backend.created(), 1);
}

#[test]
fn connection_pool_replaces_dead_idle_connection() {
    let backend = DummyBackend::new();
    let pool = ConnectionPool::new(
        endpoint("dead"),
        pool_options(3, None),
        DummyConnection::creator(backend.clone()),
    );

    let conn = pool.connect().unwrap();
    let dead_id = conn.id;
    drop(conn);
    assert_eq!(pool.stats().idle_connections, 1.into());

    // The idle connection fails its next probe; connections created afterwards
    // are healthy.
    backend.kill_all();

    let mut conn = pool.connect().unwrap();
    assert_ne!(conn.id, dead_id);
    assert!(conn.is_valid());
    assert_eq!(backend.created(), 2);
    assert_eq!(backend.closed(), 1);

    let stats = pool.stats();
    assert_eq!(stats.total_connections, 1.into());
    assert_eq!(stats.idle_connections, 0.into());
    assert_eq!(stats.claimed_connections(), 1.into());
}

#[test]
fn connection_pool_replaces_batch_of_dead_connections() {
    let backend = DummyBackend::new();
    let pool = ConnectionPool::new(
        endpoint("batch"),
        pool_options(5, None),
        DummyConnection::creator(backend.clone()),
    );

    let conns: Vec<_> = (0..3).map(|_| pool.connect().unwrap()).collect();
    drop(conns);
    backend.kill_all();

    let mut conn = pool.connect().unwrap();
    assert!(conn.is_valid());
    assert_eq!(backend.closed(), 3);
    assert_eq!(backend.created(), 4);
    assert_eq!(pool.current_size(), 1);
}

#[test]
fn connection_pool_returns_unprobed_connection_as_last_resort() {
    let backend = DummyBackend::new();
    let pool = ConnectionPool::new(
        endpoint("fallback"),
        pool_options(3, None),
        DummyConnection::creator(backend.clone()),
    );

    drop(pool.connect().unwrap());
    backend.kill_all();
    backend
        .dead_on_arrival
        .store(true, std::sync::atomic::Ordering::SeqCst);

    // Two probed attempts (twice the pool size) both find dead connections;
    // the final attempt hands out a connection without probing it.
    let mut conn = pool.connect().unwrap();
    assert!(!conn.is_valid());
    assert_eq!(backend.created(), 3);
    assert_eq!(backend.closed(), 2);
    assert_eq!(pool.current_size(), 1);
}

#[test]
fn connection_pool_construction_failure() {
    let backend = DummyBackend::new();
    backend
        .refuse_connections
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let pool = ConnectionPool::new(
        endpoint("refused"),
        pool_options(3, None),
        DummyConnection::creator(backend.clone()),
    );

    let err = match pool.connect() {
        Err(err) => err,
        Ok(conn) => panic!("expected a connection failure, got {:?}", conn),
    };
    match &err {
        Error::ConnectionFailure { endpoint, source } => {
            assert!(endpoint.contains("dummy://refused"));
            assert!(!endpoint.contains("secret"));
            assert!(source.to_string().contains("connection refused"));
        }
        other => panic!("expected a connection failure, got {:?}", other),
    }
    assert!(err.to_string().contains("connection refused"));

    // The driver error is kept as the source, not only as text
    let cause = err
        .source()
        .and_then(|e| e.downcast_ref::<DummyError>())
        .expect("driver error as source");
    assert!(cause.0.starts_with("connection refused"));
    assert_eq!(pool.current_size(), 0);

    // The reserved slot was released, so the pool recovers once the endpoint
    // accepts connections again.
    backend
        .refuse_connections
        .store(false, std::sync::atomic::Ordering::SeqCst);
    assert!(pool.connect().is_ok());
}

#[test]
fn connection_pool_construction_failure_after_dead_connections() {
    let backend = DummyBackend::new();
    let pool = ConnectionPool::new(
        endpoint("gone"),
        pool_options(3, None),
        DummyConnection::creator(backend.clone()),
    );

    drop(pool.connect().unwrap());
    backend.kill_all();
    backend
        .refuse_connections
        .store(true, std::sync::atomic::Ordering::SeqCst);

    assert!(matches!(
        pool.connect(),
        Err(Error::ConnectionFailure { .. })
    ));
    assert_eq!(pool.current_size(), 0);
    assert_eq!(backend.closed(), 1);
}

#[test]
fn connection_pool_drop_idle() {
    let backend = DummyBackend::new();
    let pool = ConnectionPool::new(
        endpoint("drain"),
        pool_options(10, None),
        DummyConnection::creator(backend.clone()),
    );

    let mut conns: Vec<_> = (0..6).map(|_| pool.connect().unwrap()).collect();
    let claimed: Vec<_> = conns.drain(..2).collect();
    drop(conns);

    let stats = pool.stats();
    assert_eq!(stats.idle_connections, 4.into());
    assert_eq!(stats.claimed_connections(), 2.into());

    // Keeping more than are idle discards nothing
    assert_eq!(pool.drop_idle(5), 0);

    assert_eq!(pool.drop_idle(1), 3);
    let stats = pool.stats();
    assert_eq!(stats.idle_connections, 1.into());
    assert_eq!(stats.claimed_connections(), 2.into());
    assert_eq!(backend.closed(), 3);

    assert_eq!(pool.drop_all_idle(), 1);
    assert_eq!(pool.current_size(), 2);

    // Claimed connections were untouched and still go back to the pool
    for mut conn in claimed {
        assert!(conn.is_valid());
    }
    assert_eq!(pool.stats().idle_connections, 2.into());
    assert_eq!(backend.closed(), 4);
}

#[test]
fn connection_pool_maximum_size() {
    let backend = DummyBackend::new();
    let pool = ConnectionPool::new(
        endpoint("maximum"),
        pool_options(2, Some(100)),
        DummyConnection::creator(backend.clone()),
    );
    assert_eq!(pool.maximum_size(), 2);

    let c1 = pool.connect().unwrap();
    let c2 = pool.connect().unwrap();
    assert!(pool.connect().is_err());

    pool.set_maximum_size(3);
    assert_eq!(pool.maximum_size(), 3);
    let c3 = pool.connect().unwrap();
    assert_eq!(pool.current_size(), 3);

    // Zero lifts the limit altogether
    pool.set_maximum_size(0);
    let extra: Vec<_> = (0..5).map(|_| pool.connect().unwrap()).collect();
    assert_eq!(pool.current_size(), 8);

    drop((c1, c2, c3, extra));
    assert_eq!(pool.stats().idle_connections, 8.into());
}
