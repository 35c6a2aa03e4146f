//! Server-side root of one connection.
//!
//! Attribute operations on the root forward to the hosted library, except
//! for the reserved stream names, which read and write this thread's
//! redirection overrides instead.

use tracing::{debug, info};

use crate::config::ProtocolConfig;
use crate::core::value::{Args, ObjectRef, Value};
use crate::error::{Fault, Phase, Result};
use crate::protocol::capability::{self, CapabilityCache};
use crate::protocol::connection::Connection;
use crate::service::redirect::{self, StreamKind};
use crate::service::script::{Interpreter, Namespace};
use crate::service::server::ServerStopper;
use crate::service::Service;

pub struct HostService {
    library: ObjectRef,
    interpreter: Interpreter,
    capabilities: CapabilityCache,
    metadata_prefix: String,
    stopper: Option<ServerStopper>,
}

impl HostService {
    pub fn new(library: ObjectRef, protocol: &ProtocolConfig) -> Self {
        Self {
            interpreter: Interpreter::new(Namespace::with_library(library.clone())),
            library,
            capabilities: CapabilityCache::new(),
            metadata_prefix: protocol.metadata_prefix.clone(),
            stopper: None,
        }
    }

    /// Permit peers to stop the server through this connection.
    pub fn with_stopper(mut self, stopper: ServerStopper) -> Self {
        self.stopper = Some(stopper);
        self
    }

    pub fn library(&self) -> &ObjectRef {
        &self.library
    }
}

impl Service for HostService {
    fn name(&self) -> &str {
        self.library.type_name()
    }

    fn on_connect(&self, conn: &Connection) {
        debug!(conn_id = conn.id(), library = self.name(), "session started");
    }

    fn on_disconnect(&self, conn: &Connection) {
        redirect::clear_all();
        debug!(conn_id = conn.id(), "session ended, stream overrides cleared");
    }

    fn root(&self) -> Result<ObjectRef> {
        Ok(self.library.clone())
    }

    fn get_attribute(&self, name: &str) -> Result<Value> {
        match StreamKind::from_name(name) {
            Some(kind) => Ok(redirect::override_object(kind)
                .map(Value::Object)
                .unwrap_or_default()),
            None => self.library.get_attr(name),
        }
    }

    fn set_attribute(&self, name: &str, value: Value) -> Result<()> {
        let Some(kind) = StreamKind::from_name(name) else {
            return self.library.set_attr(name, value);
        };
        match value {
            Value::None => redirect::clear(kind),
            Value::Object(obj) => redirect::install_object(kind, obj),
            other => {
                return Err(Fault::raised(
                    Phase::Call,
                    "TypeError",
                    format!("{} must be a stream object, not {}", kind.name(), other.type_label()),
                ))
            }
        }
        Ok(())
    }

    fn delete_attribute(&self, name: &str) -> Result<()> {
        match StreamKind::from_name(name) {
            Some(kind) => {
                redirect::clear(kind);
                Ok(())
            }
            None => self.library.del_attr(name),
        }
    }

    fn invoke(&self, name: &str, args: Args) -> Result<Value> {
        self.library.invoke(name, args)
    }

    fn list_capabilities(&self) -> Result<Vec<String>> {
        self.capabilities.get_or_compute(|| {
            Ok(capability::enumerate(
                self.library.as_ref(),
                &self.metadata_prefix,
            ))
        })
    }

    fn doc(&self) -> Result<Option<String>> {
        Ok(self.library.doc())
    }

    fn execute(&self, code: &str) -> Result<()> {
        self.interpreter.execute(code)
    }

    fn evaluate(&self, code: &str) -> Result<Value> {
        self.interpreter.evaluate(code)
    }

    fn stop(&self) -> Result<()> {
        match &self.stopper {
            Some(stopper) => {
                info!("Remote stop requested");
                stopper.stop();
                Ok(())
            }
            None => Err(Fault::attribute(self.name(), "stop_remote_server")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::object::{Class, Instance};
    use crate::service::redirect::{CaptureStream, StreamObject};
    use std::sync::Arc;

    struct Lib;

    fn host() -> HostService {
        let class = Class::<Lib>::builder("test.Provider")
            .doc("Provides answers")
            .method("get_answer", |_, _| Ok(Value::Int(42)))
            .build();
        HostService::new(Instance::new(class, Lib), &ProtocolConfig::default())
    }

    #[test]
    fn test_stream_names_route_to_thread_overrides() {
        let host = host();
        assert!(host.get_attribute("stdout").unwrap().is_none());

        let stream: ObjectRef =
            Arc::new(StreamObject::new(StreamKind::Stdout, CaptureStream::new()));
        host.set_attribute("stdout", Value::Object(stream)).unwrap();
        assert!(host.get_attribute("stdout").unwrap().as_object().is_some());

        host.set_attribute("stdout", Value::None).unwrap();
        assert!(host.get_attribute("stdout").unwrap().is_none());
        assert!(host.set_attribute("stderr", Value::Int(1)).unwrap_err().is_execution());
        host.delete_attribute("stderr").unwrap();
    }

    #[test]
    fn test_other_names_forward_to_library() {
        let host = host();
        assert_eq!(host.invoke("get_answer", Args::default()).unwrap(), Value::Int(42));
        assert!(host.get_attribute("missing").unwrap_err().is_attribute());
        assert_eq!(host.doc().unwrap().as_deref(), Some("Provides answers"));
        assert_eq!(host.list_capabilities().unwrap(), vec!["get_answer"]);
    }

    #[test]
    fn test_stop_refused_without_stopper() {
        let fault = host().stop().unwrap_err();
        assert!(matches!(fault, Fault::Attribute { ref name, .. } if name == "stop_remote_server"));
    }

    #[test]
    fn test_stop_flags_server_inactive() {
        let stopper = ServerStopper::new();
        let host = host().with_stopper(stopper.clone());
        host.stop().unwrap();
        assert!(!stopper.is_active());
    }

    #[test]
    fn test_eval_sees_library() {
        let host = host();
        host.execute("answer = library.get_answer()").unwrap();
        assert_eq!(host.evaluate("answer").unwrap(), Value::Int(42));
    }
}
