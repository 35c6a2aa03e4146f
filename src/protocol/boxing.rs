//! # Boxing Protocol
//!
//! Converts between [`Value`]s and their wire form [`Boxed`].
//!
//! ## Rules
//! - Scalars box as `VALUE`, tuples as `TUPLE` with each item boxed.
//! - A proxy of this connection boxes as `LOCAL_REF`: the peer owns it.
//! - Any other object, including a proxy of a different connection, is
//!   registered in the local object table and boxes as `REMOTE_REF`.
//!
//! Unboxing validates the label against the body. An unknown label, a
//! mismatched shape, or a `LOCAL_REF` naming nothing in the table fails that
//! decode with [`Fault::Protocol`] and leaves the connection usable. The
//! other items of a failed sequence are still unboxed and dropped, so every
//! `REMOTE_REF` it carried is released again.

use tracing::warn;

use crate::core::identity::compute_id_pack;
use crate::core::value::{Args, ObjectRef, Value};
use crate::error::constants::{ERR_LABEL_SHAPE, ERR_UNKNOWN_LABEL};
use crate::error::{Fault, Result};
use crate::protocol::message::{label, Body, Boxed, RefBody, Scalar};
use crate::protocol::registry::{LocalObjectTable, ProxyRegistry};
use crate::utils::metrics::Metrics;

/// Boxing context of one connection.
pub struct Boxer<'a> {
    local: &'a LocalObjectTable,
    proxies: &'a ProxyRegistry,
    metrics: &'a Metrics,
}

impl<'a> Boxer<'a> {
    pub fn new(local: &'a LocalObjectTable, proxies: &'a ProxyRegistry, metrics: &'a Metrics) -> Self {
        Self {
            local,
            proxies,
            metrics,
        }
    }

    pub fn box_value(&self, value: &Value) -> Result<Boxed> {
        match value {
            Value::None => Ok(Boxed::scalar(Scalar::None)),
            Value::Bool(b) => Ok(Boxed::scalar(Scalar::Bool(*b))),
            Value::Int(i) => Ok(Boxed::scalar(Scalar::Int(*i))),
            Value::Float(f) => Ok(Boxed::scalar(Scalar::Float(*f))),
            Value::Str(s) => Ok(Boxed::scalar(Scalar::Str(s.clone()))),
            Value::Bytes(b) => Ok(Boxed::scalar(Scalar::Bytes(b.clone()))),
            Value::Tuple(items) => Ok(Boxed {
                label: label::TUPLE,
                body: Body::Items(
                    items
                        .iter()
                        .map(|item| self.box_value(item))
                        .collect::<Result<_>>()?,
                ),
            }),
            Value::Object(obj) => self.box_object(obj),
        }
    }

    fn box_object(&self, obj: &ObjectRef) -> Result<Boxed> {
        if let Some(proxy) = obj.as_proxy() {
            if proxy.conn_id() == self.proxies.conn_id() {
                return Ok(Boxed {
                    label: label::LOCAL_REF,
                    body: Body::Ref(RefBody {
                        id_pack: compute_id_pack(obj),
                        callable: obj.is_callable(),
                    }),
                });
            }
        }
        let id_pack = self.local.register(obj)?;
        Ok(Boxed {
            label: label::REMOTE_REF,
            body: Body::Ref(RefBody {
                id_pack,
                callable: obj.is_callable(),
            }),
        })
    }

    pub fn box_args(&self, args: &Args) -> Result<(Vec<Boxed>, Vec<(String, Boxed)>)> {
        let positional = args
            .positional
            .iter()
            .map(|v| self.box_value(v))
            .collect::<Result<_>>()?;
        let keyword = args
            .keyword
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.box_value(v)?)))
            .collect::<Result<_>>()?;
        Ok((positional, keyword))
    }

    pub fn unbox(&self, boxed: Boxed) -> Result<Value> {
        match (boxed.label, boxed.body) {
            (label::VALUE, Body::Scalar(scalar)) => Ok(match scalar {
                Scalar::None => Value::None,
                Scalar::Bool(b) => Value::Bool(b),
                Scalar::Int(i) => Value::Int(i),
                Scalar::Float(f) => Value::Float(f),
                Scalar::Str(s) => Value::Str(s),
                Scalar::Bytes(b) => Value::Bytes(b),
            }),
            (label::TUPLE, Body::Items(items)) => self.unbox_all(items).map(Value::Tuple),
            (label::LOCAL_REF, Body::Ref(reference)) => {
                Ok(Value::Object(self.local.get(&reference.id_pack)?))
            }
            (label::REMOTE_REF, Body::Ref(reference)) => {
                let (proxy, created) = self
                    .proxies
                    .get_or_create(reference.id_pack, reference.callable)?;
                if created {
                    self.metrics.proxy_created();
                }
                Ok(Value::Object(proxy as ObjectRef))
            }
            (unknown, _) if unknown > label::REMOTE_REF => {
                Err(Fault::Protocol(format!("{ERR_UNKNOWN_LABEL}: {unknown}")))
            }
            (known, _) => Err(Fault::Protocol(format!("{ERR_LABEL_SHAPE}: {known}"))),
        }
    }

    pub fn unbox_args(&self, args: Vec<Boxed>, kwargs: Vec<(String, Boxed)>) -> Result<Args> {
        let (names, boxed): (Vec<String>, Vec<Boxed>) = kwargs.into_iter().unzip();
        let positional = self.unbox_all(args);
        let keyword = self.unbox_all(boxed);
        let positional = positional?;
        let keyword = names.into_iter().zip(keyword?).collect();
        Ok(Args::with_kwargs(positional, keyword))
    }

    /// Unbox every item; the first fault wins once all of them are done.
    fn unbox_all(&self, items: Vec<Boxed>) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(items.len());
        let mut failure = None;
        for item in items {
            match self.unbox(item) {
                Ok(value) if failure.is_none() => values.push(value),
                // dropped right away, which releases what it carried
                Ok(_) => {}
                Err(fault) => {
                    failure.get_or_insert(fault);
                }
            }
        }
        match failure {
            Some(fault) => Err(fault),
            None => Ok(values),
        }
    }

    /// Undo the registrations made while boxing a value that never reached
    /// the peer.
    pub fn release_unsent(&self, boxed: &Boxed) {
        match &boxed.body {
            Body::Ref(reference) if boxed.label == label::REMOTE_REF => {
                if let Err(fault) = self.local.release(&reference.id_pack, 1) {
                    warn!(id_pack = %reference.id_pack, error = %fault, "release of unsent reference failed");
                }
            }
            Body::Items(items) => items.iter().for_each(|item| self.release_unsent(item)),
            _ => {}
        }
    }
}
