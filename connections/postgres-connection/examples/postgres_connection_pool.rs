/*
 * Copyright 2020 Joyent, Inc.
 */

//! A basic example that demonstrates sharing a registry of PostgreSQL
//! connection pools between threads. Expects a server on localhost:5432 that
//! accepts the `postgres` user without a password.

use std::sync::{Arc, Mutex};
use std::thread;

use slog::{error, info, o, Drain, Logger};

use poolroom::connection_pool::types::ConnectionPoolOptions;
use poolroom::endpoint::Endpoint;
use poolroom::registry::PoolRegistry;
use poolroom_postgres_connection::{
    PostgresConnection, PostgresConnectionConfig, TlsConfig,
};

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let pg_config = PostgresConnectionConfig {
        database: Some("test".into()),
        application_name: Some("postgres-connection-pool".into()),
        tls_config: TlsConfig::disable(),
    };
    let connection_creator = PostgresConnection::connection_creator(pg_config);
    let pool_opts = ConnectionPoolOptions {
        max_connections: Some(5),
        claim_timeout: Some(5000),
        log: Some(log.clone()),
        connection_check_interval: Some(30),
    };

    let registry = Arc::new(PoolRegistry::new(pool_opts, connection_creator));
    let endpoint = Endpoint::new("localhost:5432", "postgres", "");

    let workers: Vec<_> = (0..10)
        .map(|i| {
            let registry = registry.clone();
            let endpoint = endpoint.clone();
            let log = log.clone();
            thread::spawn(move || {
                let mut conn = match registry.connect(&endpoint) {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(log, "worker {}: {}", i, e);
                        return;
                    }
                };
                match conn.query_one("SELECT $1::INT4 + 1", &[&(i as i32)]) {
                    Ok(row) => {
                        let n: i32 = row.get(0);
                        info!(log, "worker {}: got {}", i, n);
                    }
                    Err(e) => error!(log, "worker {}: query failed: {}", i, e),
                }
            })
        })
        .collect();

    for worker in workers {
        let _ = worker.join();
    }

    info!(
        log,
        "{} connections to {}",
        registry.current_size_of(&endpoint),
        endpoint
    );
    registry.drop_endpoint(&endpoint, 0);
}
