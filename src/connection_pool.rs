// Copyright 2020 Joyent, Inc.

pub mod types;

use std::cmp;
use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use slog::{debug, error, info, o, trace, warn, Drain, Logger};
use timer::Guard;

use crate::connection::Connection;
use crate::connection_pool::types::{
    ConnectionCount, ConnectionData, ConnectionKeyPair, ConnectionPoolOptions,
    ConnectionPoolState, ConnectionPoolStats, ProtectedData,
};
use crate::endpoint::{endpoint_key, Endpoint, EndpointKey};
use crate::error::Error;

// Default number of maximum pool connections
pub(crate) const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// A pool of connections to a single endpoint
///
/// Connections are created lazily by `connect` up to the configured maximum
/// and are returned to the pool when the [`PoolConnection`] handle goes out of
/// scope. Every connection is probed with
/// [`Connection::is_valid`](../connection/trait.Connection.html#tymethod.is_valid)
/// before it is handed out; dead connections are closed and replaced.
///
/// The pool is `Sync`; wrap it in an `Arc` to share it between threads.
pub struct ConnectionPool<C, F>
where
    C: Connection,
    F: Fn(&Endpoint) -> C + Send + Sync + 'static,
{
    endpoint: Endpoint,
    endpoint_key: EndpointKey,
    protected_data: ProtectedData<C>,
    create_connection: Arc<F>,
    claim_timeout: Option<u64>,
    log: Logger,
    connection_check_timer: Option<timer::Timer>,
    _connection_check_timer_guard: Option<Guard>,
}

impl<C: Debug, F> Debug for ConnectionPool<C, F>
where
    C: Connection,
    F: Fn(&Endpoint) -> C + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.endpoint)
            .field("endpoint_key", &self.endpoint_key)
            .field("protected_data", &self.protected_data)
            .field("claim_timeout", &self.claim_timeout)
            .field("log", &self.log)
            .finish()
    }
}

impl<C, F> ConnectionPool<C, F>
where
    C: Connection,
    F: Fn(&Endpoint) -> C + Send + Sync + 'static,
{
    /// Create a pool for `endpoint`. `create_connection` builds an unconnected
    /// connection for the endpoint; the pool calls `Connection::connect` on it.
    /// No connection is established until the first call to `connect`.
    pub fn new(
        endpoint: Endpoint,
        cpo: ConnectionPoolOptions,
        create_connection: F,
    ) -> Self {
        Self::with_shared_creator(endpoint, cpo, Arc::new(create_connection))
    }

    pub(crate) fn with_shared_creator(
        endpoint: Endpoint,
        cpo: ConnectionPoolOptions,
        create_connection: Arc<F>,
    ) -> Self {
        let max_connections =
            cpo.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let key = endpoint_key(&endpoint);
        let logger = cpo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!(
                "url" => endpoint.url().to_string(),
                "user" => endpoint.username().to_string(),
                "key" => key.to_string()
            ));

        let protected_data =
            ProtectedData::new(ConnectionData::new(max_connections));

        let (connection_check_timer, connection_check_timer_guard) =
            match cpo.connection_check_interval {
                Some(interval) => {
                    let timer = timer::Timer::new();
                    let guard = start_connection_check(
                        &timer,
                        interval,
                        protected_data.clone(),
                        logger.clone(),
                    );
                    (Some(timer), Some(guard))
                }
                None => (None, None),
            };

        debug!(logger, "created connection pool, max {}", max_connections);

        ConnectionPool {
            endpoint,
            endpoint_key: key,
            protected_data,
            create_connection,
            claim_timeout: cpo.claim_timeout,
            log: logger,
            connection_check_timer,
            _connection_check_timer_guard: connection_check_timer_guard,
        }
    }

    /// Acquire a live connection to the pool's endpoint.
    ///
    /// Up to twice the pool's current size, an idle connection is reused (or a
    /// new one created while below the maximum) and probed; connections that
    /// fail the probe are closed and another is tried. If every probed attempt
    /// fails, one last connection is claimed and returned *without* a probe,
    /// so the caller meets any remaining failure on first use.
    ///
    /// When the pool is at its maximum with no idle connections this call
    /// blocks until a connection is released, failing with
    /// `Error::ClaimTimeout` if a claim timeout is configured and expires.
    /// `Error::ConnectionFailure` is returned only when the final attempt
    /// cannot establish a connection.
    pub fn connect(&self) -> Result<PoolConnection<C>, Error> {
        let current_size = self.current_size();
        debug!(
            self.log,
            "connect: current pool size {} max {}",
            current_size,
            self.maximum_size()
        );

        let max_attempts = current_size * 2;
        for attempt in 0..max_attempts {
            let mut conn = match self.claim() {
                Ok(conn) => conn,
                Err(Error::ConnectionFailure { source, .. }) => {
                    warn!(
                        self.log,
                        "connection attempt {} of {} failed: {}",
                        attempt + 1,
                        max_attempts,
                        source
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            if conn.is_valid() {
                return Ok(conn);
            }

            // A dead connection is closed here and never put back into the
            // idle set.
            warn!(self.log, "drop dead connection from pool");
            conn.discard();
        }

        debug!(self.log, "connect: returning unprobed connection");
        self.claim()
    }

    /// Close idle connections until at most `keep` remain idle. Claimed
    /// connections are not touched. If the maximum has been lowered below the
    /// current size, idle connections are also closed until the pool fits
    /// within its maximum again. Returns the number of connections closed.
    pub fn drop_idle(&self, keep: u32) -> u32 {
        let mut connection_data = self.protected_data.connection_data_lock();
        let keep =
            cmp::min(ConnectionCount::from(keep), connection_data.idle_allowance());

        let mut dropped = Vec::new();
        while connection_data.stats.idle_connections > keep {
            match connection_data.connections.pop_front() {
                Some(ConnectionKeyPair((key, m_conn))) => {
                    connection_data.stats.idle_connections -= 1.into();
                    connection_data.stats.total_connections -= 1.into();
                    if let Some(conn) = m_conn {
                        dropped.push((key, conn));
                    }
                }
                None => {
                    // Idle count and queue disagree; trust the queue
                    warn!(self.log, "idle connection count out of sync");
                    let idle = connection_data.stats.idle_connections;
                    connection_data.stats.total_connections -= idle;
                    connection_data.stats.idle_connections = 0.into();
                }
            }
        }

        debug!(
            self.log,
            "drop_idle({}): {} dropped, {} remaining",
            keep,
            dropped.len(),
            connection_data.stats.total_connections
        );
        drop(connection_data);

        let count = dropped.len() as u32;
        for (key, conn) in dropped {
            close_connection(&self.log, &key, conn);
        }
        if count > 0 {
            self.protected_data.condvar_notify_all();
        }
        count
    }

    /// Close every idle connection. Equivalent to `drop_idle(0)`.
    pub fn drop_all_idle(&self) -> u32 {
        self.drop_idle(0)
    }

    /// The number of connections owned by the pool, idle and claimed.
    pub fn current_size(&self) -> u32 {
        self.protected_data
            .connection_data_lock()
            .stats
            .total_connections
            .into()
    }

    pub fn maximum_size(&self) -> u32 {
        self.protected_data
            .connection_data_lock()
            .max_connections
            .into()
    }

    /// Change the maximum number of connections. A lower maximum is applied
    /// as connections are released or drained; claimed connections are never
    /// closed because of it.
    pub fn set_maximum_size(&self, max_connections: u32) {
        let mut connection_data = self.protected_data.connection_data_lock();
        connection_data.max_connections = max_connections.into();
        drop(connection_data);

        debug!(self.log, "maximum pool size set to {}", max_connections);
        // Blocked claimers re-check against the new maximum
        self.protected_data.condvar_notify_all();
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        self.protected_data.connection_data_lock().stats
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    // Obtain a candidate connection: the oldest idle connection if there is
    // one, otherwise a new connection if the pool is below its maximum,
    // otherwise wait for either to become possible.
    fn claim(&self) -> Result<PoolConnection<C>, Error> {
        let deadline = self
            .claim_timeout
            .map(|ms| (ms, Instant::now() + Duration::from_millis(ms)));

        let mut connection_data = self.protected_data.connection_data_lock();
        loop {
            match connection_data.connections.pop_front() {
                Some(ConnectionKeyPair((key, Some(conn)))) => {
                    connection_data.stats.idle_connections -= 1.into();
                    trace!(self.log, "claimed idle connection");
                    return Ok(self.pool_connection(key, conn));
                }
                Some(ConnectionKeyPair((_key, None))) => {
                    // Should never happen
                    warn!(self.log, "Found endpoint key with no connection");
                    connection_data.stats.idle_connections -= 1.into();
                    connection_data.stats.total_connections -= 1.into();
                    continue;
                }
                None => (),
            }

            if connection_data.has_capacity() {
                // Reserve the slot before leaving the lock so concurrent
                // claimers cannot overshoot the maximum.
                connection_data.stats.total_connections += 1.into();
                drop(connection_data);
                return self.establish_connection();
            }

            let timeout = match deadline {
                Some((timeout_ms, deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(self.log, "claim timed out after {} ms", timeout_ms);
                        return Err(Error::ClaimTimeout(timeout_ms));
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            trace!(self.log, "pool saturated, waiting for a connection");
            let (guard, _timed_out) =
                self.protected_data.condvar_wait(connection_data, timeout);
            connection_data = guard;
        }
    }

    // Create and connect a new connection. The caller must already have
    // counted the connection in `total_connections`.
    fn establish_connection(&self) -> Result<PoolConnection<C>, Error> {
        debug!(self.log, "create new connection");
        let mut conn = (self.create_connection)(&self.endpoint);
        match conn.connect() {
            Ok(()) => {
                info!(self.log, "established new connection");
                Ok(self.pool_connection(self.endpoint_key.clone(), conn))
            }
            Err(e) => {
                error!(self.log, "failed to establish connection: {}", e);
                let mut connection_data =
                    self.protected_data.connection_data_lock();
                connection_data.stats.total_connections -= 1.into();
                drop(connection_data);
                self.protected_data.condvar_notify();

                Err(Error::ConnectionFailure {
                    endpoint: self.endpoint.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    fn pool_connection(&self, key: EndpointKey, conn: C) -> PoolConnection<C> {
        PoolConnection {
            protected_data: self.protected_data.clone(),
            log: self.log.clone(),
            connection_pair: (key, conn).into(),
        }
    }

    // Close all idle connections and mark the pool stopped so that claimed
    // connections are closed when they are released.
    fn stop(&mut self) {
        if self.connection_check_timer.is_some() {
            let _guard = self._connection_check_timer_guard.take();
            let _timer = self.connection_check_timer.take();
        }

        let mut connection_data = self.protected_data.connection_data_lock();
        connection_data.state = ConnectionPoolState::Stopped;

        let idle: Vec<ConnectionKeyPair<C>> =
            connection_data.connections.drain(..).collect();
        let idle_count = connection_data.stats.idle_connections;
        connection_data.stats.total_connections -= idle_count;
        connection_data.stats.idle_connections = 0.into();
        let claimed = connection_data.stats.total_connections;
        drop(connection_data);

        info!(
            self.log,
            "stopping connection pool: closing {} idle connections, {} still claimed",
            idle.len(),
            claimed
        );
        for ConnectionKeyPair((key, m_conn)) in idle {
            if let Some(conn) = m_conn {
                close_connection(&self.log, &key, conn);
            }
        }
        self.protected_data.condvar_notify_all();
    }
}

impl<C, F> Drop for ConnectionPool<C, F>
where
    C: Connection,
    F: Fn(&Endpoint) -> C + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

/// A connection claimed from a [`ConnectionPool`]
///
/// The handle has exclusive use of the underlying connection and dereferences
/// to it. When the handle goes out of scope the connection is returned to the
/// idle set of the pool it was claimed from, unless it reports `has_broken`,
/// the pool is above its maximum, or the pool has been torn down, in which case
/// the connection is closed.
#[derive(Debug)]
pub struct PoolConnection<C>
where
    C: Connection,
{
    protected_data: ProtectedData<C>,
    log: Logger,
    connection_pair: ConnectionKeyPair<C>,
}

impl<C> PoolConnection<C>
where
    C: Connection,
{
    /// The key of the endpoint this connection was created for.
    pub fn endpoint_key(&self) -> &EndpointKey {
        &(self.connection_pair.0).0
    }

    // Close the connection instead of returning it to the pool.
    fn discard(mut self) {
        let ConnectionKeyPair((key, m_conn)) = &mut self.connection_pair;
        if let Some(conn) = m_conn.take() {
            let mut connection_data = self.protected_data.connection_data_lock();
            connection_data.stats.total_connections -= 1.into();
            drop(connection_data);

            close_connection(&self.log, key, conn);
            self.protected_data.condvar_notify();
        }
    }
}

impl<C> Drop for PoolConnection<C>
where
    C: Connection,
{
    fn drop(&mut self) {
        let ConnectionKeyPair((key, m_conn)) = &mut self.connection_pair;
        match m_conn.take() {
            Some(conn) => {
                replace(&self.protected_data, &self.log, key.clone(), conn)
            }
            None => {
                // Discarded connections have already been accounted for
                trace!(self.log, "connection for {} already released", key);
            }
        }
    }
}

impl<C> Deref for PoolConnection<C>
where
    C: Connection,
{
    type Target = C;

    fn deref(&self) -> &C {
        // The connection is only taken out when the handle is consumed
        (self.connection_pair.0)
            .1
            .as_ref()
            .expect("pool connection used after release")
    }
}

impl<C> DerefMut for PoolConnection<C>
where
    C: Connection,
{
    fn deref_mut(&mut self) -> &mut C {
        (self.connection_pair.0)
            .1
            .as_mut()
            .expect("pool connection used after release")
    }
}

// Return a released connection to the idle set, or close it if it must not be
// reused.
fn replace<C>(
    protected_data: &ProtectedData<C>,
    log: &Logger,
    key: EndpointKey,
    conn: C,
) where
    C: Connection,
{
    let mut connection_data = protected_data.connection_data_lock();

    let reason = if connection_data.state == ConnectionPoolState::Stopped {
        Some("connection pool stopped")
    } else if conn.has_broken() {
        Some("connection is broken")
    } else if connection_data.max_connections != 0.into()
        && connection_data.stats.total_connections
            > connection_data.max_connections
    {
        Some("connection pool above maximum size")
    } else {
        None
    };

    match reason {
        Some(reason) => {
            connection_data.stats.total_connections -= 1.into();
            drop(connection_data);
            warn!(log, "not returning connection to the pool: {}", reason);
            close_connection(log, &key, conn);
        }
        None => {
            connection_data.connections.push_back((key, conn).into());
            connection_data.stats.idle_connections += 1.into();
            drop(connection_data);
            trace!(log, "connection returned to the pool");
        }
    }
    protected_data.condvar_notify();
}

fn close_connection<C>(log: &Logger, key: &EndpointKey, mut conn: C)
where
    C: Connection,
{
    debug!(log, "Closing connection for endpoint {}", key);
    if let Err(err) = conn.close() {
        warn!(
            log,
            "Failed to properly close \
             connection for endpoint {}. Reason: {}",
            key,
            err
        );
    }
}

/// Start a thread to run periodic health checks on the idle connections
fn start_connection_check<C>(
    timer: &timer::Timer,
    conn_check_interval: u64,
    protected_data: ProtectedData<C>,
    log: Logger,
) -> Guard
where
    C: Connection,
{
    debug!(
        log,
        "starting connection health task, interval {} seconds",
        conn_check_interval
    );
    timer.schedule_repeating(
        ChronoDuration::seconds(conn_check_interval as i64),
        move || check_pool_connections(&protected_data, &log),
    )
}

fn check_pool_connections<C>(protected_data: &ProtectedData<C>, log: &Logger)
where
    C: Connection,
{
    let mut connection_data = protected_data.connection_data_lock();
    let len = connection_data.connections.len();
    if len == 0 {
        return;
    }

    debug!(log, "Performing connection check on {} connections", len);

    let connections: Vec<ConnectionKeyPair<C>> =
        connection_data.connections.drain(..).collect();
    let mut broken = Vec::new();
    let mut removed = 0u32;
    for pair in connections {
        match pair {
            ConnectionKeyPair((key, Some(conn))) => {
                if conn.has_broken() {
                    warn!(log, "found broken connection!");
                    removed += 1;
                    broken.push((key, conn));
                } else {
                    connection_data.connections.push_back((key, conn).into());
                }
            }
            ConnectionKeyPair((_key, None)) => {
                warn!(log, "found malformed connection");
                removed += 1;
            }
        }
    }

    if removed > 0 {
        connection_data.stats.idle_connections -= removed.into();
        connection_data.stats.total_connections -= removed.into();
        debug!(
            log,
            "idle_connections now: {}, total_connections now: {}",
            connection_data.stats.idle_connections,
            connection_data.stats.total_connections
        );
    }
    drop(connection_data);

    for (key, conn) in broken {
        close_connection(log, &key, conn);
    }
    if removed > 0 {
        protected_data.condvar_notify_all();
    }
}
