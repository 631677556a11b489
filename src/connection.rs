// Copyright 2020 Joyent, Inc.

use std::error;

/// Poolroom connection
///
/// The `Connection` trait defines the interface that must be implemented in
/// order to participate in a poolroom connection pool. A connection need not
/// be limited to a TCP socket, but could be any logical notion of a session
/// with a database that implements the `Connection` trait.
///
/// Connection values are produced by a *connection creator* function supplied
/// to the pool (`Fn(&Endpoint) -> C`). The creator only captures the
/// configuration required to reach the endpoint; the session itself is
/// established by `connect`. The pool may invoke the creator and `connect`
/// from several threads at once.
pub trait Connection: Send + Sized + 'static {
    /// The error type returned by the `connect` or `close` functions. Each
    /// implementation may choose the concrete error type relevant to its
    /// backend; the only constraint is that it implements
    /// [Error](https://doc.rust-lang.org/std/error/trait.Error.html) and can
    /// be handed to another thread as the source of a pool error.
    type Error: error::Error + Send + Sync + 'static;
    /// Attempt to establish the session with the endpoint. Returns an error if
    /// the endpoint is unreachable or rejects the credentials.
    fn connect(&mut self) -> Result<(), Self::Error>;
    /// Liveness probe. Perform a cheap round-trip with the backend and report
    /// whether the session is still usable. Must return `false` rather than
    /// panic when the backend cannot be reached.
    fn is_valid(&mut self) -> bool;
    /// A local, non-blocking check for a session already known to be
    /// unusable. Connections reporting `true` are closed instead of being
    /// returned to the idle set.
    fn has_broken(&self) -> bool {
        false
    }
    /// Close the session.
    fn close(&mut self) -> Result<(), Self::Error>;
}
