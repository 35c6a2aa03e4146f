//! Wire messages.
//!
//! Every packet payload is one bincode-encoded [`Message`]. Values inside a
//! message are [`Boxed`]: an explicit label byte plus a body, so a label that
//! does not match its body can be detected and rejected per decode.

use serde::{Deserialize, Serialize};

use crate::core::identity::IdPack;
use crate::error::{Fault, Result};

/// Boxing labels.
pub mod label {
    /// Scalar that decodes unchanged
    pub const VALUE: u8 = 0;
    /// Ordered sequence of boxed items
    pub const TUPLE: u8 = 1;
    /// Object owned by the receiver of the message
    pub const LOCAL_REF: u8 = 2;
    /// Object owned by the sender of the message
    pub const REMOTE_REF: u8 = 3;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefBody {
    pub id_pack: IdPack,
    pub callable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Scalar(Scalar),
    Items(Vec<Boxed>),
    Ref(RefBody),
}

/// A `(label, payload)` pair as it crosses the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boxed {
    pub label: u8,
    pub body: Body,
}

impl Boxed {
    pub fn scalar(value: Scalar) -> Self {
        Self {
            label: label::VALUE,
            body: Body::Scalar(value),
        }
    }

    pub fn none() -> Self {
        Self::scalar(Scalar::None)
    }
}

/// Object a request operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// The service root of the receiving peer
    Root,
    /// An entry of the receiver's local object table
    Object(IdPack),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Fetch the hosted root object by reference
    Root,
    GetAttr {
        target: Target,
        name: String,
    },
    SetAttr {
        target: Target,
        name: String,
        value: Boxed,
    },
    DelAttr {
        target: Target,
        name: String,
    },
    Call {
        target: Target,
        args: Vec<Boxed>,
        kwargs: Vec<(String, Boxed)>,
    },
    /// Resolve `name` on the target and call it in one round trip
    Invoke {
        target: Target,
        name: String,
        args: Vec<Boxed>,
        kwargs: Vec<(String, Boxed)>,
    },
    Capabilities {
        target: Target,
    },
    Doc {
        target: Target,
    },
    Execute {
        code: String,
    },
    Evaluate {
        code: String,
    },
    Stop,
}

impl Request {
    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Root => "root",
            Request::GetAttr { .. } => "getattr",
            Request::SetAttr { .. } => "setattr",
            Request::DelAttr { .. } => "delattr",
            Request::Call { .. } => "call",
            Request::Invoke { .. } => "invoke",
            Request::Capabilities { .. } => "capabilities",
            Request::Doc { .. } => "doc",
            Request::Execute { .. } => "execute",
            Request::Evaluate { .. } => "evaluate",
            Request::Stop => "stop",
        }
    }

    /// Boxed values the request carries.
    pub fn carried(&self) -> Vec<&Boxed> {
        match self {
            Request::SetAttr { value, .. } => vec![value],
            Request::Call { args, kwargs, .. } | Request::Invoke { args, kwargs, .. } => args
                .iter()
                .chain(kwargs.iter().map(|(_, boxed)| boxed))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Request {
        seq: u32,
        request: Request,
    },
    Reply {
        seq: u32,
        outcome: std::result::Result<Boxed, Fault>,
    },
    /// Fire-and-forget release of remote references; never answered
    Decref {
        refs: Vec<(IdPack, u32)>,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Fault::Protocol(format!("undecodable message: {e}")))
    }

    /// Boxed values carried by a request or a successful reply.
    pub fn carried(&self) -> Vec<&Boxed> {
        match self {
            Message::Request { request, .. } => request.carried(),
            Message::Reply {
                outcome: Ok(boxed), ..
            } => vec![boxed],
            _ => Vec::new(),
        }
    }

    /// Sequence number of a request whose payload failed to decode, when the
    /// frame is recognisably a request.
    pub fn recover_request_seq(bytes: &[u8]) -> Option<u32> {
        // bincode lays out the variant index, then the first field
        let variant = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
        if variant != 0 {
            return None;
        }
        Some(u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?))
    }
}
