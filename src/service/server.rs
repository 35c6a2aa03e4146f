//! # Remote Server
//!
//! Hosts a root object for any number of TCP peers.
//!
//! ## Lifecycle
//! - [`RemoteServer::new`] binds immediately, so the port is known before
//!   serving starts (port `0` picks a free one).
//! - [`RemoteServer::serve`] announces the port, then runs the accept loop on
//!   a multi-threaded tokio runtime until stopped.
//! - [`ServerStopper::stop`] flags the loop inactive and wakes it. Each
//!   connection finishes its current request, then closes; the loop waits
//!   for handlers up to the shutdown timeout and removes the port file.
//!
//! ## Accept strategies
//! - **Threaded**: every connection is served on its own blocking worker
//! - **SingleConnection**: one connection is served to completion before
//!   the next is accepted

use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use futures::future::join_all;
use tokio::sync::Notify;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{AcceptStrategy, ServerConfig};
use crate::error::{Fault, Result};
use crate::protocol::connection::{Connection, ConnectionSettings};
use crate::service::host::HostService;
use crate::service::HostedRoot;
use crate::utils::metrics::global_metrics;

/// Gate run on every accepted stream before a session starts.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, stream: &TcpStream) -> Result<()>;
}

impl<F> Authenticator for F
where
    F: Fn(&TcpStream) -> Result<()> + Send + Sync,
{
    fn authenticate(&self, stream: &TcpStream) -> Result<()> {
        self(stream)
    }
}

/// Clonable handle that stops a server.
#[derive(Clone)]
pub struct ServerStopper {
    active: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl ServerStopper {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(true)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn stop(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            // the permit is kept when the loop is not waiting yet
            self.wake.notify_one();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Default for ServerStopper {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServerStopper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStopper")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Everything a connection worker needs, detached from the server.
#[derive(Clone)]
struct Worker {
    root: HostedRoot,
    config: Arc<ServerConfig>,
    stopper: ServerStopper,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl Worker {
    fn serve_connection(&self, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        if let Some(authenticator) = &self.authenticator {
            if let Err(fault) = authenticator.authenticate(&stream) {
                warn!(peer = ?peer, error = %fault, "Connection refused by authenticator");
                return;
            }
        }

        let mut service = HostService::new(self.root.resolve(), &self.config.protocol);
        if self.config.allow_remote_stop {
            service = service.with_stopper(self.stopper.clone());
        }
        let settings = ConnectionSettings::new(&self.config.protocol)
            .with_timeout(self.config.timeout)
            .with_poll_interval(self.config.poll_interval);
        let conn = match Connection::new(stream, Box::new(service), settings) {
            Ok(conn) => conn,
            Err(fault) => {
                error!(peer = ?peer, error = %fault, "Failed to set up connection");
                global_metrics().connection_error();
                return;
            }
        };

        let metrics = global_metrics();
        metrics.connection_established();
        info!(conn_id = conn.id(), peer = ?peer, "New connection established");

        conn.service().on_connect(&conn);
        let stopper = self.stopper.clone();
        if let Err(fault) = conn.serve_until(|| stopper.is_active()) {
            warn!(conn_id = conn.id(), error = %fault, "Connection ended with an error");
        }
        conn.service().on_disconnect(&conn);
        conn.close();

        metrics.connection_closed();
        info!(conn_id = conn.id(), peer = ?peer, "Connection closed");
    }
}

pub struct RemoteServer {
    root: HostedRoot,
    config: Arc<ServerConfig>,
    address: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    stopper: ServerStopper,
    authenticator: Option<Arc<dyn Authenticator>>,
    port_writer: Mutex<Option<Box<dyn Write + Send>>>,
}

impl RemoteServer {
    /// Validate `config` and bind the listening socket.
    pub fn new(root: impl Into<HostedRoot>, config: ServerConfig) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(Fault::Config(errors.join("; ")));
        }

        let listener = bind(config.host.as_deref(), config.port, config.ipv6)?;
        let address = listener.local_addr()?;
        info!(address = %address, "Server bound");

        Ok(Self {
            root: root.into(),
            config: Arc::new(config),
            address,
            listener: Mutex::new(Some(listener)),
            stopper: ServerStopper::new(),
            authenticator: None,
            port_writer: Mutex::new(None),
        })
    }

    pub fn with_authenticator<A>(mut self, authenticator: A) -> Self
    where
        A: Authenticator + 'static,
    {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Announce the port on `writer` once serving starts. The writer is
    /// kept open afterwards.
    pub fn with_port_writer<W>(self, writer: W) -> Self
    where
        W: Write + Send + 'static,
    {
        if let Ok(mut slot) = self.port_writer.lock() {
            *slot = Some(Box::new(writer));
        }
        self
    }

    pub fn server_address(&self) -> SocketAddr {
        self.address
    }

    pub fn server_port(&self) -> u16 {
        self.address.port()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stopper(&self) -> ServerStopper {
        self.stopper.clone()
    }

    pub fn stop(&self) {
        self.stopper.stop();
    }

    /// Serve when the configuration asks for auto-start; otherwise return
    /// at once and leave serving to [`RemoteServer::serve`].
    pub fn start(&self) -> Result<()> {
        if self.config.auto_start {
            self.serve()
        } else {
            Ok(())
        }
    }

    /// Serve on a background thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let address = self.address;
        let stopper = self.stopper.clone();
        let thread = std::thread::Builder::new()
            .name(String::from("remote-object-server"))
            .spawn(move || self.serve())?;
        Ok(ServerHandle {
            address,
            stopper,
            thread: Some(thread),
        })
    }

    /// Block until the server is stopped.
    #[instrument(skip(self), fields(address = %self.address))]
    pub fn serve(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()?
            .take()
            .ok_or_else(|| Fault::Config(String::from("Server can only be served once")))?;

        self.announce_port()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("remote-object-worker")
            .build()?;
        let outcome = runtime.block_on(self.accept_loop(listener));
        runtime.shutdown_timeout(self.config.shutdown_timeout);
        self.remove_port_file();
        info!("Server stopped");
        outcome
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        let mut incoming = TcpListenerStream::new(tokio::net::TcpListener::from_std(listener)?);
        let worker = Worker {
            root: self.root.clone(),
            config: self.config.clone(),
            stopper: self.stopper.clone(),
            authenticator: self.authenticator.clone(),
        };
        let mut handlers = Vec::new();
        info!(address = %self.address, strategy = ?self.config.accept_strategy, "Accepting connections");

        while self.stopper.is_active() {
            tokio::select! {
                _ = self.stopper.wake.notified() => {
                    debug!("Stop requested");
                }
                accepted = incoming.next() => match accepted {
                    Some(Ok(stream)) => {
                        let stream = match into_blocking(stream) {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!(error = %e, "Failed to prepare accepted stream");
                                continue;
                            }
                        };
                        let worker = worker.clone();
                        let handle = tokio::task::spawn_blocking(move || worker.serve_connection(stream));
                        match self.config.accept_strategy {
                            AcceptStrategy::Threaded => handlers.push(handle),
                            AcceptStrategy::SingleConnection => {
                                if let Err(e) = handle.await {
                                    error!(error = %e, "Connection handler failed");
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Error accepting connection");
                        global_metrics().connection_error();
                    }
                    None => break,
                }
            }
            handlers.retain(|handle| !handle.is_finished());
        }

        info!(connections = handlers.len(), "Shutting down server. Waiting for connections to close...");
        if tokio::time::timeout(self.config.shutdown_timeout, join_all(handlers))
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached, forcing exit");
        }
        Ok(())
    }

    fn announce_port(&self) -> Result<()> {
        let port = self.server_port();
        if let Some(writer) = self.port_writer.lock()?.as_mut() {
            writeln!(writer, "{port}")?;
            writer.flush()?;
        }
        if let Some(path) = &self.config.port_file {
            std::fs::write(path, port.to_string())?;
            info!(path = %path.display(), port, "Port file written");
        }
        Ok(())
    }

    fn remove_port_file(&self) {
        let Some(path) = &self.config.port_file else {
            return;
        };
        match std::fs::remove_file(path) {
            Ok(()) => info!(path = %path.display(), "Removed port file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!(error = %e, path = %path.display(), "Failed to remove port file"),
        }
    }
}

fn into_blocking(stream: tokio::net::TcpStream) -> std::io::Result<TcpStream> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    Ok(stream)
}

fn bind(host: Option<&str>, port: u16, ipv6: bool) -> Result<TcpListener> {
    let host = host.unwrap_or(if ipv6 { "::" } else { "0.0.0.0" });
    let candidates: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    let preferred: Vec<SocketAddr> = candidates
        .iter()
        .copied()
        .filter(|addr| addr.is_ipv6() == ipv6)
        .collect();
    let addrs = if preferred.is_empty() { candidates } else { preferred };

    let mut last_error = None;
    for addr in addrs {
        match TcpListener::bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_error = Some(e),
        }
    }
    Err(match last_error {
        Some(e) => Fault::Io(e),
        None => Fault::Config(format!("Host '{host}' did not resolve to any address")),
    })
}

/// A server running on its own thread. Dropping the handle stops the server
/// and waits for it.
pub struct ServerHandle {
    address: SocketAddr,
    stopper: ServerStopper,
    thread: Option<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    pub fn stopper(&self) -> ServerStopper {
        self.stopper.clone()
    }

    pub fn stop(&self) {
        self.stopper.stop();
    }

    /// Wait for the server thread to finish.
    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| Fault::connection("server thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.stopper.stop();
            let _ = thread.join();
        }
    }
}
