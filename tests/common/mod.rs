// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::env;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use slog::{o, Drain, Level, LevelFilter, Logger};

use poolroom::connection::Connection;
use poolroom::endpoint::Endpoint;

pub const DEFAULT_LOG_LEVEL: Level = Level::Warning;
pub const LOG_LEVEL_ENV_VAR: &str = "POOLROOM_LOG_LEVEL";

pub fn parse_log_level(s: &str) -> Level {
    match s.to_lowercase().as_str() {
        "trace" => Level::Trace,
        "debug" => Level::Debug,
        "info" => Level::Info,
        "warning" => Level::Warning,
        "error" => Level::Error,
        "critical" => Level::Critical,
        _ => panic!("invalid log level {}", s),
    }
}

pub fn log_from_env() -> Logger {
    let level = env::var(LOG_LEVEL_ENV_VAR)
        .map(|l| parse_log_level(&l))
        .unwrap_or(DEFAULT_LOG_LEVEL);

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

#[derive(Debug)]
pub struct DummyError(pub String);

impl fmt::Display for DummyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for DummyError {}

/// Shared state behind the dummy connection creator. Lets a test make
/// connection attempts fail, make new connections dead on arrival, kill
/// existing connections, and count what the pool did.
#[derive(Debug, Default)]
pub struct DummyBackend {
    pub created: AtomicUsize,
    pub connected: AtomicUsize,
    pub closed: AtomicUsize,
    pub refuse_connections: AtomicBool,
    pub dead_on_arrival: AtomicBool,
    liveness: Mutex<Vec<Arc<AtomicBool>>>,
    gate: Mutex<Option<ConnectGate>>,
}

// Holds the next `connect` to one endpoint url between two barriers.
#[derive(Debug)]
struct ConnectGate {
    url: String,
    entered: Arc<Barrier>,
    release: Arc<Barrier>,
}

impl DummyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(DummyBackend::default())
    }

    /// Make every connection created so far fail its liveness probe.
    pub fn kill_all(&self) {
        let liveness = self.liveness.lock().unwrap();
        liveness.iter().for_each(|alive| alive.store(false, Ordering::SeqCst));
    }

    /// Make the next `connect` to `endpoint` wait: it meets `entered` once
    /// it has started and then blocks until `release` is met as well. Both
    /// barriers must be sized for two parties.
    pub fn hold_next_connect(
        &self,
        endpoint: &Endpoint,
        entered: Arc<Barrier>,
        release: Arc<Barrier>,
    ) {
        *self.gate.lock().unwrap() = Some(ConnectGate {
            url: endpoint.url().to_string(),
            entered,
            release,
        });
    }

    fn take_gate(&self, endpoint: &Endpoint) -> Option<ConnectGate> {
        let mut gate = self.gate.lock().unwrap();
        match gate.as_ref() {
            Some(g) if g.url == endpoint.url() => gate.take(),
            _ => None,
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct DummyConnection {
    pub endpoint: Endpoint,
    pub id: usize,
    alive: Arc<AtomicBool>,
    connected: bool,
    backend: Arc<DummyBackend>,
}

impl DummyConnection {
    pub fn creator(
        backend: Arc<DummyBackend>,
    ) -> impl Fn(&Endpoint) -> DummyConnection + Send + Sync + 'static {
        move |endpoint: &Endpoint| {
            let id = backend.created.fetch_add(1, Ordering::SeqCst);
            let alive = Arc::new(AtomicBool::new(
                !backend.dead_on_arrival.load(Ordering::SeqCst),
            ));
            backend.liveness.lock().unwrap().push(alive.clone());
            DummyConnection {
                endpoint: endpoint.clone(),
                id,
                alive,
                connected: false,
                backend: backend.clone(),
            }
        }
    }
}

impl Connection for DummyConnection {
    type Error = DummyError;

    fn connect(&mut self) -> Result<(), DummyError> {
        if let Some(gate) = self.backend.take_gate(&self.endpoint) {
            gate.entered.wait();
            gate.release.wait();
        }
        if self.backend.refuse_connections.load(Ordering::SeqCst) {
            return Err(DummyError(format!(
                "connection refused by {}",
                self.endpoint
            )));
        }
        self.backend.connected.fetch_add(1, Ordering::SeqCst);
        self.connected = true;
        Ok(())
    }

    fn is_valid(&mut self) -> bool {
        self.connected && self.alive.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> Result<(), DummyError> {
        self.backend.closed.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
        Ok(())
    }
}

pub fn endpoint(name: &str) -> Endpoint {
    Endpoint::new(format!("dummy://{}", name), "postgres", "secret")
}
