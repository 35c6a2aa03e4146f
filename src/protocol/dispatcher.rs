//! Request routing on the serving side of a connection.
//!
//! Requests aimed at [`Target::Root`] go to the connection's [`Service`];
//! requests aimed at [`Target::Object`] run directly against the local object
//! table entry. Every failure, including a panic in hosted code, comes back
//! as a [`Fault`] so the serve loop never goes down with the call.
//!
//! [`Service`]: crate::service::Service

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::warn;

use crate::config::ProtocolConfig;
use crate::core::value::Value;
use crate::error::constants::ERR_PANICKED;
use crate::error::{Fault, Phase, Result};
use crate::protocol::capability;
use crate::protocol::connection::Connection;
use crate::protocol::message::{Request, Target};

/// Execute one incoming request.
pub(crate) fn dispatch(conn: &Connection, request: Request) -> Result<Value> {
    let kind = request.kind();
    match panic::catch_unwind(AssertUnwindSafe(|| route(conn, request))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(conn_id = conn.id(), kind, panic = %message, "hosted code panicked");
            Err(Fault::raised(
                Phase::Call,
                "Panic",
                format!("{ERR_PANICKED}: {message}"),
            ))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}

fn route(conn: &Connection, request: Request) -> Result<Value> {
    let service = conn.service();
    let protocol = &conn.settings().protocol;
    let policy = AttrPolicy::new(protocol);

    match request {
        Request::Root => service.root().map(Value::Object),

        Request::GetAttr { target, name } => match target {
            Target::Root => {
                policy.with_name(service.name(), &name, AttrOp::Get, |n| service.get_attribute(n))
            }
            Target::Object(id_pack) => {
                let obj = conn.local_objects().get(&id_pack)?;
                policy.with_name(obj.type_name(), &name, AttrOp::Get, |n| obj.get_attr(n))
            }
        },

        Request::SetAttr {
            target,
            name,
            value,
        } => {
            let value = conn.boxer().unbox(value)?;
            match target {
                Target::Root => policy.with_name(service.name(), &name, AttrOp::Set, |n| {
                    service.set_attribute(n, value.clone())
                }),
                Target::Object(id_pack) => {
                    let obj = conn.local_objects().get(&id_pack)?;
                    policy.with_name(obj.type_name(), &name, AttrOp::Set, |n| {
                        obj.set_attr(n, value.clone())
                    })
                }
            }
            .map(|()| Value::None)
        }

        Request::DelAttr { target, name } => match target {
            Target::Root => policy.with_name(service.name(), &name, AttrOp::Delete, |n| {
                service.delete_attribute(n)
            }),
            Target::Object(id_pack) => {
                let obj = conn.local_objects().get(&id_pack)?;
                policy.with_name(obj.type_name(), &name, AttrOp::Delete, |n| obj.del_attr(n))
            }
        }
        .map(|()| Value::None),

        Request::Call {
            target,
            args,
            kwargs,
        } => {
            let args = conn.boxer().unbox_args(args, kwargs)?;
            match target {
                Target::Root => service.root()?.call(args),
                Target::Object(id_pack) => conn.local_objects().get(&id_pack)?.call(args),
            }
        }

        Request::Invoke {
            target,
            name,
            args,
            kwargs,
        } => {
            let args = conn.boxer().unbox_args(args, kwargs)?;
            match target {
                Target::Root => policy.with_name(service.name(), &name, AttrOp::Get, |n| {
                    service.invoke(n, args.clone())
                }),
                Target::Object(id_pack) => {
                    let obj = conn.local_objects().get(&id_pack)?;
                    policy.with_name(obj.type_name(), &name, AttrOp::Get, |n| {
                        obj.invoke(n, args.clone())
                    })
                }
            }
        }

        Request::Capabilities { target } => {
            let names = match target {
                Target::Root => service.list_capabilities()?,
                Target::Object(id_pack) => {
                    let obj = conn.local_objects().get(&id_pack)?;
                    capability::enumerate(obj.as_ref(), &protocol.metadata_prefix)
                }
            };
            Ok(Value::Tuple(names.into_iter().map(Value::Str).collect()))
        }

        Request::Doc { target } => {
            let doc = match target {
                Target::Root => service.doc()?,
                Target::Object(id_pack) => conn.local_objects().get(&id_pack)?.doc(),
            };
            Ok(Value::from(doc))
        }

        Request::Execute { code } => service.execute(&code).map(|()| Value::None),
        Request::Evaluate { code } => service.evaluate(&code),
        Request::Stop => service.stop().map(|()| Value::None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrOp {
    Get,
    Set,
    Delete,
}

/// Attribute access gates of the protocol configuration.
///
/// Servers run with merged options, where every gate is open. The refusing
/// branches apply to connections built with
/// [`ConnectionSettings::with_protocol`].
///
/// [`ConnectionSettings::with_protocol`]: crate::protocol::connection::ConnectionSettings::with_protocol
struct AttrPolicy<'a> {
    protocol: &'a ProtocolConfig,
}

impl<'a> AttrPolicy<'a> {
    fn new(protocol: &'a ProtocolConfig) -> Self {
        Self { protocol }
    }

    fn allows(&self, op: AttrOp) -> bool {
        match op {
            AttrOp::Get => self.protocol.allow_getattr,
            AttrOp::Set => self.protocol.allow_setattr,
            AttrOp::Delete => self.protocol.allow_delattr,
        }
    }

    /// Run `resolve` with the name the policy permits for `name`.
    ///
    /// With exposed attributes enabled the prefixed name is tried first; the
    /// plain name is only a fallback when all attributes are allowed.
    fn with_name<T, F>(&self, type_name: &str, name: &str, op: AttrOp, resolve: F) -> Result<T>
    where
        F: Fn(&str) -> Result<T>,
    {
        let refuse = || Fault::attribute(type_name, name);
        if !self.allows(op) {
            return Err(refuse());
        }
        if !self.protocol.allow_all_attrs && capability::is_private(name) {
            return Err(refuse());
        }
        if self.protocol.allow_exposed_attrs && !self.protocol.exposed_prefix.is_empty() {
            let exposed = format!("{}{name}", self.protocol.exposed_prefix);
            match resolve(&exposed) {
                Err(fault) if fault.is_attribute() => {}
                other => return other,
            }
            if !self.protocol.allow_all_attrs {
                return Err(refuse());
            }
        }
        resolve(name)
    }
}
