// Copyright 2020 Joyent, Inc.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

use crate::connection::Connection;
use crate::endpoint::EndpointKey;

/// The connection counts for the connection pool
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ConnectionPoolStats {
    /// The total number of connections, idle and claimed
    pub total_connections: ConnectionCount,
    /// The count of idle connections in the pool
    pub idle_connections: ConnectionCount,
}

impl ConnectionPoolStats {
    /// Create a new instance of `ConnectionPoolStats`
    pub fn new() -> Self {
        ConnectionPoolStats {
            total_connections: ConnectionCount::from(0),
            idle_connections: ConnectionCount::from(0),
        }
    }

    /// The number of connections currently held by callers
    pub fn claimed_connections(&self) -> ConnectionCount {
        self.total_connections - self.idle_connections
    }
}

impl Default for ConnectionPoolStats {
    fn default() -> Self {
        Self::new()
    }
}

/// The configuration options for a poolroom connection pool. A
/// [`PoolRegistry`](../../registry/struct.PoolRegistry.html) uses the same
/// options as the template for every pool it creates.
#[derive(Clone, Debug, Default)]
pub struct ConnectionPoolOptions {
    /// An optional maximum number of connections, idle plus claimed, to
    /// maintain in the connection pool. A value of zero means the pool is
    /// unbounded. If not specified the default is 10.
    pub max_connections: Option<u32>,
    /// An optional timeout in milliseconds for a `connect` call that has to
    /// wait for a connection because the pool is at its maximum. If not
    /// specified the call blocks until a connection is released.
    pub claim_timeout: Option<u64>,
    /// An optional `slog` logger instance. If none is provided then the logging
    /// will fall back to using the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain which is essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
    /// Optional connection check interval in seconds. When set, idle
    /// connections reporting `has_broken` are removed from the pool once per
    /// interval. If not specified no periodic check is run.
    pub connection_check_interval: Option<u64>,
}

// This type wraps a pair that associates an `EndpointKey` with a connection of
// type `C`. The second member of the pair is an Option type to facilitate
// ownership issues when the connection is handed back by a `PoolConnection`.
#[doc(hidden)]
#[derive(Debug)]
pub struct ConnectionKeyPair<C>(pub (EndpointKey, Option<C>));

impl<C> From<(EndpointKey, C)> for ConnectionKeyPair<C>
where
    C: Connection,
{
    fn from(pair: (EndpointKey, C)) -> Self {
        ConnectionKeyPair((pair.0, Some(pair.1)))
    }
}

impl<C> From<(EndpointKey, Option<C>)> for ConnectionKeyPair<C>
where
    C: Connection,
{
    fn from(pair: (EndpointKey, Option<C>)) -> Self {
        ConnectionKeyPair((pair.0, pair.1))
    }
}

impl<C> Into<(EndpointKey, Option<C>)> for ConnectionKeyPair<C>
where
    C: Connection,
{
    fn into(self) -> (EndpointKey, Option<C>) {
        ((self.0).0, (self.0).1)
    }
}

/// A newtype wrapper around u32 used for counts of connections maintained by
/// the connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

// The internal data structures used to manage the connection pool.
#[doc(hidden)]
#[derive(Debug)]
pub struct ConnectionData<C> {
    pub connections: VecDeque<ConnectionKeyPair<C>>,
    pub stats: ConnectionPoolStats,
    pub max_connections: ConnectionCount,
    pub state: ConnectionPoolState,
}

impl<C> ConnectionData<C>
where
    C: Connection,
{
    #[doc(hidden)]
    pub fn new(max_connections: u32) -> Self {
        ConnectionData {
            connections: VecDeque::with_capacity(max_connections as usize),
            stats: ConnectionPoolStats::new(),
            max_connections: max_connections.into(),
            state: ConnectionPoolState::Running,
        }
    }

    // Whether a new connection may be created without exceeding the maximum.
    // A maximum of zero means the pool is unbounded.
    pub fn has_capacity(&self) -> bool {
        self.max_connections == 0.into()
            || self.stats.total_connections < self.max_connections
    }

    // The number of idle connections that may be kept without the pool
    // exceeding its maximum.
    pub fn idle_allowance(&self) -> ConnectionCount {
        if self.max_connections == 0.into() {
            return self.stats.idle_connections;
        }
        let claimed = self.stats.claimed_connections();
        if claimed >= self.max_connections {
            0.into()
        } else {
            self.max_connections - claimed
        }
    }
}

// Protected access to the internal connection pool data structures
#[doc(hidden)]
#[derive(Debug)]
pub struct ProtectedData<C>(Arc<(Mutex<ConnectionData<C>>, Condvar)>);

impl<C> ProtectedData<C>
where
    C: Connection,
{
    pub fn new(connection_data: ConnectionData<C>) -> Self {
        ProtectedData(Arc::new((Mutex::new(connection_data), Condvar::new())))
    }

    // Every critical section leaves the bookkeeping consistent, so a lock
    // poisoned by a panicking caller is still safe to use.
    pub fn connection_data_lock(&self) -> MutexGuard<ConnectionData<C>> {
        (self.0).0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn condvar_wait<'a>(
        &self,
        g: MutexGuard<'a, ConnectionData<C>>,
        m_timeout: Option<Duration>,
    ) -> (MutexGuard<'a, ConnectionData<C>>, bool) {
        match m_timeout {
            Some(timeout) => {
                let (guard, wait_result) = (self.0)
                    .1
                    .wait_timeout(g, timeout)
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, wait_result.timed_out())
            }
            None => (
                (self.0)
                    .1
                    .wait(g)
                    .unwrap_or_else(PoisonError::into_inner),
                false,
            ),
        }
    }

    pub fn condvar_notify(&self) {
        (self.0).1.notify_one()
    }

    pub fn condvar_notify_all(&self) {
        (self.0).1.notify_all()
    }
}

impl<C> Clone for ProtectedData<C>
where
    C: Connection,
{
    fn clone(&self) -> ProtectedData<C> {
        ProtectedData(Arc::clone(&self.0))
    }
}

/// Sum type representing the current state of the connection pool.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ConnectionPoolState {
    /// The pool is running and able to service connection requests.
    Running,
    /// The pool has been torn down. Connections released into a stopped pool
    /// are closed rather than kept.
    Stopped,
}

impl fmt::Display for ConnectionPoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionPoolState::Running => String::from("running").fmt(fmt),
            ConnectionPoolState::Stopped => String::from("stopped").fmt(fmt),
        }
    }
}
