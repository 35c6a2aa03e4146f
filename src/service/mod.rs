//! # Services
//!
//! The endpoint side of a connection: what answers requests aimed at the
//! connection root, and the server/client built on top of it.
//!
//! ## Components
//! - **Service**: per-connection root handler trait
//! - **Host**: server root exposing a hosted library, with stream interception
//! - **Redirect**: thread-scoped stdin/stdout/stderr multiplexer
//! - **Script**: connection-private namespace for `execute`/`evaluate`
//! - **Server**: accept loop, port announcement, stop
//! - **Client**: facade over one client connection

pub mod client;
pub mod host;
pub mod redirect;
pub mod script;
pub mod server;

use std::sync::Arc;

use crate::core::value::{Args, ObjectRef, Value};
use crate::error::constants::ERR_NO_ROOT;
use crate::error::{Fault, Result};
use crate::protocol::connection::Connection;

/// Handler for requests aimed at a connection's root.
///
/// One service instance serves exactly one connection. Every operation has a
/// default that refuses it, so a peer without a root (a plain client)
/// implements nothing.
pub trait Service: Send + Sync {
    /// Type name reported in attribute faults about the root.
    fn name(&self) -> &str;

    fn on_connect(&self, _conn: &Connection) {}

    fn on_disconnect(&self, _conn: &Connection) {}

    fn root(&self) -> Result<ObjectRef> {
        Err(Fault::Protocol(ERR_NO_ROOT.to_string()))
    }

    fn get_attribute(&self, name: &str) -> Result<Value> {
        Err(Fault::attribute(self.name(), name))
    }

    fn set_attribute(&self, name: &str, _value: Value) -> Result<()> {
        Err(Fault::attribute(self.name(), name))
    }

    fn delete_attribute(&self, name: &str) -> Result<()> {
        Err(Fault::attribute(self.name(), name))
    }

    fn invoke(&self, name: &str, _args: Args) -> Result<Value> {
        Err(Fault::attribute(self.name(), name))
    }

    fn list_capabilities(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn doc(&self) -> Result<Option<String>> {
        Ok(None)
    }

    fn execute(&self, _code: &str) -> Result<()> {
        Err(Fault::attribute(self.name(), "execute"))
    }

    fn evaluate(&self, _code: &str) -> Result<Value> {
        Err(Fault::attribute(self.name(), "eval"))
    }

    fn stop(&self) -> Result<()> {
        Err(Fault::attribute(self.name(), "stop_remote_server"))
    }
}

/// Root handler of a client connection: hosts nothing, but still answers
/// operations on objects the client handed out by reference.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientService;

impl Service for ClientService {
    fn name(&self) -> &str {
        "ClientService"
    }
}

type RootFactory = Arc<dyn Fn() -> ObjectRef + Send + Sync>;

/// Root sharing policy of a server; fixed for the server's lifetime.
#[derive(Clone)]
pub enum HostedRoot {
    /// Every connection sees the same object
    Shared(ObjectRef),
    /// Every connection gets a freshly built object
    PerConnection(RootFactory),
}

impl HostedRoot {
    pub fn shared(obj: ObjectRef) -> Self {
        HostedRoot::Shared(obj)
    }

    pub fn per_connection<F>(factory: F) -> Self
    where
        F: Fn() -> ObjectRef + Send + Sync + 'static,
    {
        HostedRoot::PerConnection(Arc::new(factory))
    }

    /// Root object for a new connection.
    pub fn resolve(&self) -> ObjectRef {
        match self {
            HostedRoot::Shared(obj) => obj.clone(),
            HostedRoot::PerConnection(factory) => factory(),
        }
    }
}

impl From<ObjectRef> for HostedRoot {
    fn from(obj: ObjectRef) -> Self {
        HostedRoot::Shared(obj)
    }
}

impl std::fmt::Debug for HostedRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostedRoot::Shared(obj) => write!(f, "Shared(<{}>)", obj.type_name()),
            HostedRoot::PerConnection(_) => f.write_str("PerConnection(..)"),
        }
    }
}
