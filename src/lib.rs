// Copyright 2020 Joyent, Inc.

//! Connection pools for database endpoints
//!
//! Poolroom keeps a *room* of connection pools: one bounded pool of reusable
//! connections for every distinct database endpoint an application talks to.
//! Establishing a database session is expensive, so connections are created
//! lazily, handed out to callers, and returned to their pool when the caller
//! is done with them. Connections that have gone stale while idle (server
//! restarts, network resets, idle timeouts on the server side) are detected
//! with a liveness probe and replaced without the caller noticing.
//!
//! Poolroom relies on one trait, [`Connection`](connection/trait.Connection.html),
//! and a *connection creator* function supplied by the application.
//!
//! ## Endpoints
//!
//! An [`Endpoint`](endpoint/struct.Endpoint.html) is the identity of a pool:
//! a url (or other driver-specific connection string), a user name, and a
//! password. Two endpoints share a pool only if all three are equal.
//!
//! ## Connections
//!
//! In poolroom a *connection* is anything that can be connected, probed, and
//! closed. The pool never looks at what a connection can do beyond that. The
//! connection creator has the following trait bounds:
//!
//! ```rust,ignore
//! Fn(&Endpoint) -> C + Send + Sync + 'static
//! where C: Connection
//! ```
//!
//! It captures whatever application configuration a connection needs (a
//! database name, TLS settings) and returns an unconnected
//! [`Connection`](connection/trait.Connection.html) for the endpoint. The pool
//! then calls `Connection::connect` to establish the session.
//!
//! ## Acquisition
//!
//! Each claimed connection is probed with `Connection::is_valid` before it is
//! handed out. A connection that fails the probe is closed and the pool tries
//! again, at most twice as many times as the pool has connections. When all
//! of those attempts fail, one last connection is handed out without a probe:
//! the caller then sees the real error on first use. An error is only returned
//! when no connection can be established at all, or when the pool is saturated
//! and the optional claim timeout expires.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::{Arc, Mutex};
//! use std::thread;
//!
//! use slog::{o, Drain, Logger};
//!
//! use poolroom::connection_pool::types::ConnectionPoolOptions;
//! use poolroom::endpoint::Endpoint;
//! use poolroom::registry::PoolRegistry;
//! use poolroom_tcp_stream_connection::TcpStreamConnection;
//!
//! let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//! let log = Logger::root(
//!     Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
//!     o!("build-id" => "0.1.0"),
//! );
//!
//! let pool_opts = ConnectionPoolOptions {
//!     max_connections: Some(5),
//!     claim_timeout: Some(1000),
//!     log: Some(log),
//!     connection_check_interval: None,
//! };
//!
//! let registry = Arc::new(PoolRegistry::new(
//!     pool_opts,
//!     TcpStreamConnection::connection_creator(None),
//! ));
//! let endpoint = Endpoint::new("127.0.0.1:5432", "postgres", "");
//!
//! for _ in 0..10 {
//!     let registry = registry.clone();
//!     let endpoint = endpoint.clone();
//!     thread::spawn(move || {
//!         if let Ok(conn) = registry.connect(&endpoint) {
//!             // Do stuff here
//!             // The connection is returned to the pool when it falls out of
//!             // scope.
//!         }
//!     });
//! }
//! ```
//!
//! Implementations of the [`Connection`](connection/trait.Connection.html)
//! trait live in separate crates:
//!
//! * `poolroom-tcp-stream-connection`
//! * `poolroom-postgres-connection`

#![allow(missing_docs)]

pub mod connection;
pub mod connection_pool;
pub mod endpoint;
pub mod error;
pub mod registry;
