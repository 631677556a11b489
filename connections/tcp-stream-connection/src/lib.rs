// Copyright 2020 Joyent, Inc.

//! A poolroom `Connection` over a plain `TcpStream`
//!
//! The endpoint url is the `host:port` address of the server. The user name
//! and password of the endpoint only take part in pool identity; nothing is
//! sent over the socket when connecting.

use std::io::{Error as IOError, ErrorKind};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use poolroom::connection::Connection;
use poolroom::endpoint::Endpoint;

#[derive(Debug)]
pub struct TcpStreamConnection {
    pub stream: Option<TcpStream>,
    addr: String,
    connect_timeout: Option<Duration>,
}

impl TcpStreamConnection {
    pub fn new(endpoint: &Endpoint) -> Self {
        TcpStreamConnection {
            stream: None,
            addr: endpoint.url().to_string(),
            connect_timeout: None,
        }
    }

    /// Return a connection creator for use with a `ConnectionPool` or a
    /// `PoolRegistry`. When `connect_timeout` is given each resolved address
    /// is tried for at most that long.
    pub fn connection_creator(
        connect_timeout: Option<Duration>,
    ) -> impl Fn(&Endpoint) -> TcpStreamConnection + Send + Sync + 'static {
        move |endpoint: &Endpoint| TcpStreamConnection {
            connect_timeout,
            ..TcpStreamConnection::new(endpoint)
        }
    }

    fn connect_addrs(&self) -> Result<TcpStream, IOError> {
        let addrs: Vec<SocketAddr> = self.addr.to_socket_addrs()?.collect();
        let timeout = match self.connect_timeout {
            Some(timeout) => timeout,
            None => return TcpStream::connect(&addrs[..]),
        };

        let mut last_err = None;
        for addr in addrs.iter() {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            IOError::new(
                ErrorKind::AddrNotAvailable,
                format!("{} did not resolve to any address", self.addr),
            )
        }))
    }
}

impl Connection for TcpStreamConnection {
    type Error = IOError;

    fn connect(&mut self) -> Result<(), Self::Error> {
        let stream = self.connect_addrs()?;
        self.stream = Some(stream);
        Ok(())
    }

    // Peek without blocking: a closed peer reads as end of stream, a live
    // quiet peer as `WouldBlock`.
    fn is_valid(&mut self) -> bool {
        let stream = match self.stream.as_ref() {
            Some(stream) => stream,
            None => return false,
        };
        if stream.set_nonblocking(true).is_err() {
            return false;
        }

        let mut buf = [0u8; 1];
        let alive = match stream.peek(&mut buf) {
            Ok(0) => false,
            Ok(_) => true,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(_) => false,
        };

        stream.set_nonblocking(false).is_ok() && alive
    }

    fn has_broken(&self) -> bool {
        match &self.stream {
            Some(stream) => match stream.take_error() {
                Ok(None) => false,
                Ok(Some(_)) | Err(_) => true,
            },
            None => true,
        }
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.stream = None;
        Ok(())
    }
}

impl Deref for TcpStreamConnection {
    type Target = TcpStream;

    fn deref(&self) -> &TcpStream {
        self.stream.as_ref().expect("tcp stream is not connected")
    }
}

impl DerefMut for TcpStreamConnection {
    fn deref_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("tcp stream is not connected")
    }
}
