//! # remote-object
//!
//! A remote-object call protocol runtime. A client invokes operations on an
//! object hosted by another process as if it were local.
//!
//! ## Features
//! - Values cross by copy (scalars, tuples) or by reference (objects)
//! - Transparent proxies with per-connection identity and reference counting
//! - Dynamic capability discovery from explicit capability tables
//! - Attribute faults kept distinct from execution faults across the wire
//! - Per-thread stdin/stdout/stderr redirection for concurrent sessions
//! - Nested calls: either side can call back while a request is pending
//!
//! ## Quick Start
//! ```rust,no_run
//! use remote_object::prelude::*;
//!
//! struct Calculator;
//!
//! # fn main() -> remote_object::Result<()> {
//! let class = Class::<Calculator>::builder("demo.Calculator")
//!     .method("add", |_, args: Args| Ok(Value::Int(args.int(0, "a")? + args.int(1, "b")?)))
//!     .build();
//! let server = RemoteServer::new(Instance::new(class, Calculator) as ObjectRef, ServerConfig::default())?;
//! let handle = server.spawn()?;
//!
//! let client = RemoteClient::connect(ClientConfig {
//!     port: handle.port(),
//!     ..ClientConfig::default()
//! })?;
//! assert_eq!(client.call("add", Args::new(vec![2.into(), 3.into()]))?, Value::Int(5));
//! client.stop_remote_server()?;
//! handle.join()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//! - [`core`]: framing, values, hosted objects, identity
//! - [`protocol`]: boxing, reference registry, connection, dispatcher
//! - [`service`]: server, client facade, redirection, scripting
//! - [`config`]: TOML/env configuration
//! - [`utils`]: compression, logging, metrics, timing

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod utils;

pub use error::{Fault, Phase, Result};

pub mod prelude {
    pub use crate::config::{ClientConfig, ProtocolConfig, RemoteConfig, ServerConfig};
    pub use crate::core::object::{Class, Function, Instance, RemoteObject};
    pub use crate::core::value::{Args, ObjectRef, Value};
    pub use crate::error::{Fault, Phase, Result};
    pub use crate::protocol::connection::{Connection, ConnectionSettings};
    pub use crate::service::client::RemoteClient;
    pub use crate::service::redirect;
    pub use crate::service::server::{RemoteServer, ServerHandle, ServerStopper};
    pub use crate::service::HostedRoot;
}
