//! # Remote Client
//!
//! Facade over one connection to a [`RemoteServer`].
//!
//! Every request issued through the facade redirects the server's
//! stdout/stderr to the calling thread's streams for its duration, so output
//! produced by hosted code shows up on the client side.
//!
//! ## Example
//! ```rust,no_run
//! use remote_object::config::ClientConfig;
//! use remote_object::core::value::{Args, Value};
//! use remote_object::service::client::RemoteClient;
//!
//! # fn main() -> remote_object::error::Result<()> {
//! let client = RemoteClient::connect(ClientConfig::default())?;
//! let sum = client.call("add", Args::new(vec![2.into(), 3.into()]))?;
//! assert_eq!(sum, Value::Int(5));
//! client.close();
//! # Ok(())
//! # }
//! ```
//!
//! [`RemoteServer`]: crate::service::server::RemoteServer

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, instrument};

use crate::config::ClientConfig;
use crate::core::value::{Args, ObjectRef, Value};
use crate::error::constants::ERR_NOT_CONNECTED;
use crate::error::{Fault, Result};
use crate::protocol::capability::{self, CapabilityCache};
use crate::protocol::connection::{Connection, ConnectionSettings};
use crate::protocol::message::{Request, Target};
use crate::service::ClientService;
use crate::utils::metrics::Metrics;

/// Operations the facade provides itself, on top of the remote ones.
pub const LOCAL_OPERATIONS: [&str; 3] = ["remote_eval", "remote_execute", "stop_remote_server"];

const FACADE_NAME: &str = "RemoteClient";

pub struct RemoteClient {
    conn: Connection,
    config: ClientConfig,
    connected: AtomicBool,
    capabilities: CapabilityCache,
}

impl RemoteClient {
    #[instrument(skip(config), fields(peer = %config.peer, port = config.port))]
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(Fault::Config(errors.join("; ")));
        }

        let addr = resolve(&config.peer, config.port, config.ipv6)?;
        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout)
            .map_err(|e| Fault::connection(format!("{addr}: {e}")))?;
        let settings = ConnectionSettings::new(&config.protocol)
            .with_timeout(config.timeout)
            .with_redirected_output(true);
        let conn = Connection::new(stream, Box::new(ClientService), settings)?;
        info!(conn_id = conn.id(), address = %addr, "Connected to remote server");

        Ok(Self {
            conn,
            config,
            connected: AtomicBool::new(true),
            capabilities: CapabilityCache::new(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn metrics(&self) -> &Metrics {
        self.conn.metrics()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.conn.is_closed()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Fault::connection(ERR_NOT_CONNECTED))
        }
    }

    fn is_marker(&self, name: &str) -> bool {
        let prefix = &self.config.protocol.metadata_prefix;
        !prefix.is_empty() && name.starts_with(prefix.as_str())
    }

    /// Look `name` up on the remote root.
    ///
    /// Callables come back as call-through proxies and metadata markers as
    /// their values. Private names, plain data attributes and markers asked
    /// for while disconnected are attribute faults. Execution faults raised
    /// by the lookup keep their classification.
    pub fn get_attr(&self, name: &str) -> Result<Value> {
        if capability::is_private(name) {
            return Err(Fault::attribute(FACADE_NAME, name));
        }
        let marker = self.is_marker(name);
        if marker && !self.is_connected() {
            return Err(Fault::attribute(FACADE_NAME, name));
        }
        self.ensure_connected()?;

        let value = match self.conn.request(Request::GetAttr {
            target: Target::Root,
            name: name.to_string(),
        }) {
            Err(Fault::Attribute { .. }) => return Err(Fault::attribute(FACADE_NAME, name)),
            other => other?,
        };
        if marker || value.is_callable() {
            Ok(value)
        } else {
            Err(Fault::attribute(FACADE_NAME, name))
        }
    }

    /// Invoke the operation `name` with `args`.
    pub fn call(&self, name: &str, args: Args) -> Result<Value> {
        match name {
            "remote_eval" => self.remote_eval(args.str(0, "code")?),
            "remote_execute" => self.remote_execute(args.str(0, "code")?).map(|()| Value::None),
            "stop_remote_server" => self.stop_remote_server().map(|()| Value::None),
            _ if capability::is_private(name) => Err(Fault::attribute(FACADE_NAME, name)),
            _ => {
                self.ensure_connected()?;
                let (args, kwargs) = self.conn.boxer().box_args(&args)?;
                self.conn.request(Request::Invoke {
                    target: Target::Root,
                    name: name.to_string(),
                    args,
                    kwargs,
                })
            }
        }
    }

    /// Remote operations joined with the facade's own, sorted and
    /// deduplicated; fetched once per client.
    pub fn list_capabilities(&self) -> Result<Vec<String>> {
        self.capabilities.get_or_compute(|| {
            self.ensure_connected()?;
            let names = self.conn.request(Request::Capabilities {
                target: Target::Root,
            })?;
            let remote = names
                .as_tuple()
                .unwrap_or_default()
                .iter()
                .filter_map(|name| name.as_str().map(str::to_string))
                .collect();
            Ok(capability::union_with_local(remote, &LOCAL_OPERATIONS))
        })
    }

    /// Documentation string of the hosted object.
    pub fn doc(&self) -> Result<Option<String>> {
        self.ensure_connected()?;
        let doc = self.conn.request(Request::Doc {
            target: Target::Root,
        })?;
        Ok(doc.as_str().map(str::to_string))
    }

    pub fn remote_eval(&self, code: &str) -> Result<Value> {
        self.ensure_connected()?;
        self.conn.request(Request::Evaluate {
            code: code.to_string(),
        })
    }

    pub fn remote_execute(&self, code: &str) -> Result<()> {
        self.ensure_connected()?;
        self.conn
            .request(Request::Execute {
                code: code.to_string(),
            })
            .map(drop)
    }

    /// The hosted object itself, as a proxy.
    pub fn library(&self) -> Result<ObjectRef> {
        self.ensure_connected()?;
        self.conn.root()
    }

    /// Ask the server to stop, then disconnect. A refused stop leaves the
    /// client connected.
    pub fn stop_remote_server(&self) -> Result<()> {
        self.ensure_connected()?;
        self.conn.request(Request::Stop)?;
        info!(conn_id = self.conn.id(), "Remote server stopped");
        self.disconnect();
        Ok(())
    }

    /// Ask the server to stop if it permits remote stop, then disconnect.
    /// A refused stop is not an error; the transport is released either way.
    pub fn close(&self) {
        if self.is_connected() {
            match self.conn.request(Request::Stop) {
                Ok(_) => info!(conn_id = self.conn.id(), "Remote server stopped"),
                Err(fault) if fault.is_attribute() => {
                    debug!(conn_id = self.conn.id(), "Remote stop not permitted")
                }
                Err(fault) => debug!(error = %fault, "Remote stop failed on close"),
            }
        }
        self.disconnect();
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            // give back what the server lent us before the transport goes
            if let Err(fault) = self.conn.flush_decrefs() {
                debug!(error = %fault, "Failed to flush decrefs on close");
            }
            self.conn.close();
            info!(conn_id = self.conn.id(), "Client closed");
        }
    }
}

/// Dropping a client releases the transport without asking the server to stop.
impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("peer", &self.config.peer)
            .field("port", &self.config.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn resolve(peer: &str, port: u16, ipv6: bool) -> Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = (peer, port).to_socket_addrs()?.collect();
    candidates
        .iter()
        .find(|addr| addr.is_ipv6() == ipv6)
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| Fault::connection(format!("'{peer}' did not resolve to any address")))
}
