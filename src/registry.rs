// Copyright 2020 Joyent, Inc.

//! A registry of connection pools keyed by endpoint
//!
//! [`PoolRegistry`] multiplexes connection requests across any number of
//! endpoints. The first request for an [`Endpoint`] creates a
//! [`ConnectionPool`] for it; later requests for an equal endpoint reuse that
//! pool. Pools are removed again when a targeted drain leaves them empty or
//! when the registry itself is dropped.

use std::collections::HashMap;
use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use slog::{debug, info, o, trace, Drain, Logger};

use crate::connection::Connection;
use crate::connection_pool::types::ConnectionPoolOptions;
use crate::connection_pool::{
    ConnectionPool, PoolConnection, DEFAULT_MAX_CONNECTIONS,
};
use crate::endpoint::Endpoint;
use crate::error::Error;

// The pool mapping together with the maximum size applied to new pools.
struct RegistryData<C, F>
where
    C: Connection,
    F: Fn(&Endpoint) -> C + Send + Sync + 'static,
{
    pools: HashMap<Endpoint, Arc<ConnectionPool<C, F>>>,
    max_connections: u32,
}

/// A set of connection pools, one per distinct endpoint
///
/// All pools share one connection creator function and the
/// [`ConnectionPoolOptions`] the registry was created with. The registry lock
/// only guards the endpoint to pool mapping; establishing and probing
/// connections happens outside of it, so a slow endpoint never delays
/// requests for other endpoints.
///
/// Dropping the registry drops every pool, closing all idle connections.
/// Connections still claimed at that time stay usable and are closed when
/// released.
pub struct PoolRegistry<C, F>
where
    C: Connection,
    F: Fn(&Endpoint) -> C + Send + Sync + 'static,
{
    data: Mutex<RegistryData<C, F>>,
    pool_options: ConnectionPoolOptions,
    create_connection: Arc<F>,
    log: Logger,
}

impl<C, F> Debug for PoolRegistry<C, F>
where
    C: Connection,
    F: Fn(&Endpoint) -> C + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let data = self.data_lock();
        f.debug_struct("PoolRegistry")
            .field("endpoints", &data.pools.keys().collect::<Vec<_>>())
            .field("max_connections", &data.max_connections)
            .field("pool_options", &self.pool_options)
            .finish()
    }
}

impl<C, F> PoolRegistry<C, F>
where
    C: Connection,
    F: Fn(&Endpoint) -> C + Send + Sync + 'static,
{
    /// Create an empty registry. `cpo` is the template for every pool the
    /// registry creates; its `max_connections` is the initial default maximum.
    pub fn new(cpo: ConnectionPoolOptions, create_connection: F) -> Self {
        let log = cpo
            .log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let max_connections =
            cpo.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);

        PoolRegistry {
            data: Mutex::new(RegistryData {
                pools: HashMap::new(),
                max_connections,
            }),
            pool_options: ConnectionPoolOptions {
                log: Some(log.clone()),
                ..cpo
            },
            create_connection: Arc::new(create_connection),
            log,
        }
    }

    /// Claim a live connection to `endpoint`, creating the endpoint's pool if
    /// this is the first request for it. See
    /// [`ConnectionPool::connect`](../connection_pool/struct.ConnectionPool.html#method.connect).
    pub fn connect(&self, endpoint: &Endpoint) -> Result<PoolConnection<C>, Error> {
        trace!(self.log, "connect({})", endpoint);

        let pool = {
            let mut data = self.data_lock();
            let max_connections = data.max_connections;
            match data.pools.get(endpoint) {
                Some(pool) => {
                    trace!(self.log, "pool for {} found", endpoint);
                    Arc::clone(pool)
                }
                None => {
                    info!(
                        self.log,
                        "create pool for {} with {} connections",
                        endpoint,
                        max_connections
                    );
                    let pool = Arc::new(ConnectionPool::with_shared_creator(
                        endpoint.clone(),
                        ConnectionPoolOptions {
                            max_connections: Some(max_connections),
                            ..self.pool_options.clone()
                        },
                        Arc::clone(&self.create_connection),
                    ));
                    data.pools.insert(endpoint.clone(), Arc::clone(&pool));
                    pool
                }
            }
        };

        pool.connect()
    }

    /// Close the idle connections of every pool. Pools are kept even if they
    /// end up empty. Returns the number of connections closed.
    pub fn drop_all(&self) -> u32 {
        let pools: Vec<Arc<ConnectionPool<C, F>>> =
            self.data_lock().pools.values().cloned().collect();

        let mut drop_count = 0;
        for pool in pools {
            debug!(
                self.log,
                "pool {}; current size {}",
                pool.endpoint(),
                pool.current_size()
            );
            drop_count += pool.drop_all_idle();
            debug!(
                self.log,
                "connections released, {} kept",
                pool.current_size()
            );
        }

        drop_count
    }

    /// Close idle connections of the pool for `endpoint` until at most `keep`
    /// remain idle. If the pool is empty afterwards it is removed from the
    /// registry. Returns the number of connections closed, zero if there is no
    /// pool for the endpoint.
    ///
    /// A `connect` for the same endpoint that looked the pool up just before
    /// it was removed still claims from the removed pool. That connection is
    /// not counted by the registry and is closed when it is released.
    pub fn drop_endpoint(&self, endpoint: &Endpoint, keep: u32) -> u32 {
        let mut data = self.data_lock();

        let (drop_count, empty) = match data.pools.get(endpoint) {
            Some(pool) => {
                debug!(
                    self.log,
                    "pool {} found; current size {}",
                    endpoint,
                    pool.current_size()
                );
                let drop_count = pool.drop_idle(keep);
                let remaining = pool.current_size();
                debug!(
                    self.log,
                    "{} connections released, {} kept", drop_count, remaining
                );
                (drop_count, remaining == 0)
            }
            None => {
                debug!(self.log, "pool for {} not found", endpoint);
                return 0;
            }
        };

        if empty {
            info!(self.log, "delete connection pool for {}", endpoint);
            let pool = data.pools.remove(endpoint);
            drop(data);
            drop(pool);
        }

        drop_count
    }

    /// The number of connections, idle and claimed, across all pools.
    pub fn current_size(&self) -> u32 {
        self.data_lock()
            .pools
            .values()
            .map(|pool| pool.current_size())
            .sum()
    }

    /// The number of connections in the pool for `endpoint`, zero if there is
    /// no such pool.
    pub fn current_size_of(&self, endpoint: &Endpoint) -> u32 {
        self.data_lock()
            .pools
            .get(endpoint)
            .map_or(0, |pool| pool.current_size())
    }

    /// Set the maximum size of every existing pool and of pools created from
    /// now on.
    pub fn set_maximum_size(&self, max_connections: u32) {
        let mut data = self.data_lock();
        data.max_connections = max_connections;
        for pool in data.pools.values() {
            pool.set_maximum_size(max_connections);
        }
        debug!(
            self.log,
            "maximum size set to {} for {} pools",
            max_connections,
            data.pools.len()
        );
    }

    /// The maximum size new pools are created with.
    pub fn maximum_size(&self) -> u32 {
        self.data_lock().max_connections
    }

    pub fn maximum_size_of(&self, endpoint: &Endpoint) -> Option<u32> {
        self.data_lock()
            .pools
            .get(endpoint)
            .map(|pool| pool.maximum_size())
    }

    pub fn pool_count(&self) -> usize {
        self.data_lock().pools.len()
    }

    fn data_lock(&self) -> MutexGuard<RegistryData<C, F>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C, F> Drop for PoolRegistry<C, F>
where
    C: Connection,
    F: Fn(&Endpoint) -> C + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let data = self.data.get_mut().unwrap_or_else(PoisonError::into_inner);
        info!(self.log, "destroying {} connection pools", data.pools.len());
        data.pools.clear();
    }
}
