// Copyright 2020 Joyent, Inc.

//! Share a small pool of TCP connections to two local echo servers between
//! several threads.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use slog::{info, o, Drain, Logger};

use poolroom::connection_pool::types::ConnectionPoolOptions;
use poolroom::endpoint::Endpoint;
use poolroom::registry::PoolRegistry;
use poolroom_tcp_stream_connection::TcpStreamConnection;

fn echo(mut stream: TcpStream) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stream.write_all(&buf[..n]).is_err() {
                    return;
                }
            }
        }
    }
}

fn start_echo_server() -> std::io::Result<Endpoint> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            thread::spawn(move || echo(stream));
        }
    });
    Ok(Endpoint::new(addr.to_string(), "demo", ""))
}

fn main() -> std::io::Result<()> {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let endpoints = vec![start_echo_server()?, start_echo_server()?];

    let pool_opts = ConnectionPoolOptions {
        max_connections: Some(3),
        claim_timeout: Some(5000),
        log: Some(log.clone()),
        connection_check_interval: Some(10),
    };
    let registry = Arc::new(PoolRegistry::new(
        pool_opts,
        TcpStreamConnection::connection_creator(Some(Duration::from_secs(1))),
    ));

    let workers: Vec<_> = (0..10)
        .map(|i| {
            let registry = registry.clone();
            let endpoint = endpoints[i % endpoints.len()].clone();
            let log = log.clone();
            thread::spawn(move || {
                let mut conn = match registry.connect(&endpoint) {
                    Ok(conn) => conn,
                    Err(e) => {
                        info!(log, "worker {} got no connection: {}", i, e);
                        return;
                    }
                };
                let msg = format!("hello from worker {}", i);
                let mut reply = vec![0u8; msg.len()];
                let result = conn
                    .write_all(msg.as_bytes())
                    .and_then(|_| conn.read_exact(&mut reply));
                match result {
                    Ok(()) => info!(
                        log,
                        "worker {} echoed {:?}",
                        i,
                        String::from_utf8_lossy(&reply)
                    ),
                    Err(e) => info!(log, "worker {} failed: {}", i, e),
                }
            })
        })
        .collect();

    for worker in workers {
        let _ = worker.join();
    }

    for endpoint in endpoints.iter() {
        info!(
            log,
            "{}: {} connections",
            endpoint,
            registry.current_size_of(endpoint)
        );
    }
    info!(log, "dropped {} idle connections", registry.drop_all());

    Ok(())
}
