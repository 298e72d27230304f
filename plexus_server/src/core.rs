//! Server core: binds drivers, accepts clients, tears everything down.
//!
//! The `ServerCore` struct is the main entry point of the server. It owns
//! the device registry (through its dispatcher), the listening socket and
//! the set of live client connections.

use parking_lot::Mutex;
use plexus_common::config::{ConfigError, ConfigLoader};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::binder::{self, BindReport, ServerConfig};
use crate::client;
use crate::device_registry::DeviceRegistry;
use crate::dispatcher::Dispatcher;
use crate::driver_registry::DriverRegistry;

/// Accept-loop poll period while no client is connecting.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Binary-level errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `run()` called before `init()`.
    #[error("Server not initialized")]
    NotInitialized,
}

struct Connection {
    stream: TcpStream,
    thread: JoinHandle<()>,
}

/// Server core managing drivers and client connections.
pub struct ServerCore {
    config: ServerConfig,
    drivers: DriverRegistry,
    dispatcher: Dispatcher,
    listener: Option<TcpListener>,
    /// Running flag for the accept loop
    running: Arc<AtomicBool>,
    connections: Mutex<Vec<(u64, Connection)>>,
    next_conn: AtomicU64,
    report: BindReport,
}

impl ServerCore {
    /// Create a server for `config`, building drivers from `drivers`.
    ///
    /// # Errors
    /// Returns error if configuration validation fails.
    pub fn new(config: ServerConfig, drivers: DriverRegistry) -> Result<Self, ServerError> {
        config.validate()?;
        let registry = Arc::new(DeviceRegistry::new(config.server.match_policy));

        info!(
            "ServerCore created with {} driver stanza(s), match_policy={:?}",
            config.drivers.len(),
            config.server.match_policy
        );

        Ok(Self {
            config,
            drivers,
            dispatcher: Dispatcher::new(registry),
            listener: None,
            running: Arc::new(AtomicBool::new(false)),
            connections: Mutex::new(Vec::new()),
            next_conn: AtomicU64::new(0),
            report: BindReport::default(),
        })
    }

    /// Load server configuration from a TOML file.
    pub fn load_config(config_path: &Path) -> Result<ServerConfig, ServerError> {
        info!("Loading configuration from {:?}", config_path);
        let config = ServerConfig::load(config_path)?;
        info!(
            "Loaded config: port={}, {} driver stanza(s)",
            config.server.port,
            config.drivers.len()
        );
        Ok(config)
    }

    /// Bind every configured driver and open the listening socket.
    ///
    /// Stanza failures are logged and kept in [`bind_report`](Self::bind_report);
    /// only a socket failure is fatal.
    pub fn init(&mut self) -> Result<(), ServerError> {
        info!("Initializing ServerCore...");
        self.report = binder::bind(&self.config, &self.drivers, &self.dispatcher);
        if !self.report.is_clean() {
            warn!(
                "{} driver stanza(s) failed to bind; continuing without them",
                self.report.errors.len()
            );
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.server.port))?;
        listener.set_nonblocking(true)?;
        info!("Listening on {}", listener.local_addr()?);
        self.listener = Some(listener);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Address the server is listening on (after `init`).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn bind_report(&self) -> &BindReport {
        &self.report
    }

    /// Get the running flag for signal handlers.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Accept clients until the running flag is cleared.
    ///
    /// The flag is raised by `init`, so a stop requested in between is
    /// honoured.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let listener = self.listener.as_ref().ok_or(ServerError::NotInitialized)?;
        info!("Accepting clients");

        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.spawn_client(stream) {
                        warn!(peer = %peer, "Failed to start client session: {}", e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => error!("Accept error: {}", e),
            }
            self.reap_finished();
        }

        info!("Accept loop stopped");
        Ok(())
    }

    fn spawn_client(&self, stream: TcpStream) -> io::Result<()> {
        // Accepted sockets inherit non-blocking mode on some platforms.
        stream.set_nonblocking(false)?;
        let control = stream.try_clone()?;
        let dispatcher = self.dispatcher.clone();
        let capacity = self.config.server.queue_capacity;
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);

        let thread = thread::Builder::new()
            .name(format!("session-{id}"))
            .spawn(move || match client::serve(stream, dispatcher, capacity) {
                Ok(end) => debug!(session = id, "Session ended: {:?}", end),
                Err(e) => warn!(session = id, "Session failed: {}", e),
            })?;

        self.connections.lock().push((
            id,
            Connection {
                stream: control,
                thread,
            },
        ));
        Ok(())
    }

    fn reap_finished(&self) {
        let finished: Vec<Connection> = {
            let mut conns = self.connections.lock();
            let (done, live): (Vec<_>, Vec<_>) = std::mem::take(&mut *conns)
                .into_iter()
                .partition(|(_, c)| c.thread.is_finished());
            *conns = live;
            done.into_iter().map(|(_, c)| c).collect()
        };
        for conn in finished {
            let _ = conn.thread.join();
        }
    }

    /// Stop accepting, disconnect every client, and destroy all drivers.
    pub fn shutdown(&mut self) -> Result<(), ServerError> {
        info!("Shutdown requested");
        self.running.store(false, Ordering::SeqCst);
        self.listener = None;

        let conns: Vec<(u64, Connection)> = std::mem::take(&mut *self.connections.lock());
        info!("Closing {} client connection(s)", conns.len());
        for (id, conn) in conns {
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
            if conn.thread.join().is_err() {
                warn!(session = id, "Session thread panicked");
            }
        }

        self.dispatcher.registry().unregister_all();
        info!("ServerCore shut down");
        Ok(())
    }
}
