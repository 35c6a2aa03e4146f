//! # Stream Redirection
//!
//! Thread-scoped stdin/stdout/stderr.
//!
//! Hosted code writes through [`stdout()`] and [`stderr()`] (and reads
//! through [`stdin()`]). Each handle looks up the calling thread's override
//! first and falls back to the process default held by the
//! [`StreamRegistry`]. Every connection is served on its own thread, so two
//! sessions redirecting at the same time never see each other's streams.
//!
//! ## Client scope
//! Around each outgoing request a client with redirected output snapshots
//! the peer's `stdout`/`stderr`, installs its own streams by reference,
//! runs the call and restores the snapshot on every exit path. A
//! per-connection depth counter makes nested calls install only once.

use std::cell::RefCell;
use std::io::{self, BufRead, Write};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tracing::{debug, error};

use crate::core::object::{Function, MemberInfo, MemberKind, RemoteObject};
use crate::core::value::{Args, ObjectRef, Value};
use crate::error::constants::ERR_REDIRECT_UNDERFLOW;
use crate::error::{Fault, Phase, Result};
use crate::protocol::connection::Connection;
use crate::protocol::message::{Request, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Stdin, StreamKind::Stdout, StreamKind::Stderr];

    /// Reserved attribute name of the stream.
    pub fn name(self) -> &'static str {
        match self {
            StreamKind::Stdin => "stdin",
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "stdin" => Some(StreamKind::Stdin),
            "stdout" => Some(StreamKind::Stdout),
            "stderr" => Some(StreamKind::Stderr),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            StreamKind::Stdin => 0,
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }
}

/// Text sink or source behind one of the standard streams.
pub trait TextStream: Send + Sync {
    fn write_str(&self, text: &str) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// One line including its terminator; empty at end of input.
    fn read_line(&self) -> Result<String> {
        Err(Fault::raised(
            Phase::Call,
            "UnsupportedOperation",
            "stream is not readable",
        ))
    }
}

struct ProcessStdin;
struct ProcessStdout;
struct ProcessStderr;

impl TextStream for ProcessStdin {
    fn write_str(&self, _text: &str) -> Result<()> {
        Err(Fault::raised(
            Phase::Call,
            "UnsupportedOperation",
            "stdin is not writable",
        ))
    }

    fn read_line(&self) -> Result<String> {
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line)
    }
}

impl TextStream for ProcessStdout {
    fn write_str(&self, text: &str) -> Result<()> {
        io::stdout().lock().write_all(text.as_bytes())?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        io::stdout().lock().flush()?;
        Ok(())
    }
}

impl TextStream for ProcessStderr {
    fn write_str(&self, text: &str) -> Result<()> {
        io::stderr().lock().write_all(text.as_bytes())?;
        Ok(())
    }
}

/// Process-wide default streams, one per kind.
pub struct StreamRegistry {
    defaults: [Arc<dyn TextStream>; 3],
}

impl StreamRegistry {
    fn new() -> Self {
        Self {
            defaults: [
                Arc::new(ProcessStdin),
                Arc::new(ProcessStdout),
                Arc::new(ProcessStderr),
            ],
        }
    }

    pub fn default_stream(&self, kind: StreamKind) -> Arc<dyn TextStream> {
        self.defaults[kind.index()].clone()
    }
}

static REGISTRY: Lazy<StreamRegistry> = Lazy::new(StreamRegistry::new);

pub fn registry() -> &'static StreamRegistry {
    &REGISTRY
}

#[derive(Clone)]
struct Override {
    object: ObjectRef,
    stream: Arc<dyn TextStream>,
}

thread_local! {
    static OVERRIDES: RefCell<[Option<Override>; 3]> = const { RefCell::new([None, None, None]) };
}

fn replace(kind: StreamKind, value: Option<Override>) {
    let previous = OVERRIDES.with(|cell| std::mem::replace(&mut cell.borrow_mut()[kind.index()], value));
    // released after the borrow ends; dropping a proxy may queue a decref
    drop(previous);
}

/// Redirect `kind` on this thread to a local stream.
pub fn install_stream(kind: StreamKind, stream: Arc<dyn TextStream>) {
    let object: ObjectRef = Arc::new(StreamObject::new(kind, stream.clone()));
    replace(kind, Some(Override { object, stream }));
}

/// Redirect `kind` on this thread to a stream-like object, usually a proxy
/// of a peer's stream.
pub fn install_object(kind: StreamKind, object: ObjectRef) {
    let stream: Arc<dyn TextStream> = Arc::new(ObjectStream::new(object.clone()));
    replace(kind, Some(Override { object, stream }));
}

/// Object installed for `kind` on this thread, if any.
pub fn override_object(kind: StreamKind) -> Option<ObjectRef> {
    OVERRIDES.with(|cell| cell.borrow()[kind.index()].as_ref().map(|o| o.object.clone()))
}

pub fn is_redirected(kind: StreamKind) -> bool {
    OVERRIDES.with(|cell| cell.borrow()[kind.index()].is_some())
}

pub fn clear(kind: StreamKind) {
    replace(kind, None);
}

/// Drop every override of this thread.
pub fn clear_all() {
    for kind in StreamKind::ALL {
        clear(kind);
    }
}

/// The stream `kind` resolves to on this thread.
pub fn current(kind: StreamKind) -> Arc<dyn TextStream> {
    OVERRIDES
        .with(|cell| cell.borrow()[kind.index()].as_ref().map(|o| o.stream.clone()))
        .unwrap_or_else(|| registry().default_stream(kind))
}

/// `io::Write` handle resolving its target on every write.
#[derive(Debug, Clone, Copy)]
pub struct OutputHandle {
    kind: StreamKind,
}

pub fn stdout() -> OutputHandle {
    OutputHandle {
        kind: StreamKind::Stdout,
    }
}

pub fn stderr() -> OutputHandle {
    OutputHandle {
        kind: StreamKind::Stderr,
    }
}

impl Write for OutputHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        current(self.kind)
            .write_str(&String::from_utf8_lossy(buf))
            .map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        current(self.kind).flush().map_err(io::Error::other)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InputHandle;

pub fn stdin() -> InputHandle {
    InputHandle
}

impl InputHandle {
    pub fn read_line(&self) -> Result<String> {
        current(StreamKind::Stdin).read_line()
    }
}

/// In-memory stream collecting everything written to it.
#[derive(Debug, Default)]
pub struct CaptureStream {
    buf: Mutex<String>,
}

impl CaptureStream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contents(&self) -> String {
        self.buf.lock().map(|buf| buf.clone()).unwrap_or_default()
    }

    /// Contents so far, leaving the buffer empty.
    pub fn take(&self) -> String {
        self.buf
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }
}

impl TextStream for CaptureStream {
    fn write_str(&self, text: &str) -> Result<()> {
        self.buf.lock()?.push_str(text);
        Ok(())
    }
}

/// A [`TextStream`] hosted as an object, so a peer can write to it.
pub struct StreamObject {
    kind: StreamKind,
    stream: Arc<dyn TextStream>,
}

impl StreamObject {
    pub fn new(kind: StreamKind, stream: Arc<dyn TextStream>) -> Self {
        Self { kind, stream }
    }

    fn run(&self, name: &str, args: &Args) -> Result<Value> {
        match name {
            "write" => {
                let text = args.str(0, "text")?;
                self.stream.write_str(text)?;
                Ok(Value::Int(text.len() as i64))
            }
            "flush" => self.stream.flush().map(|()| Value::None),
            "readline" => self.stream.read_line().map(Value::Str),
            _ => Err(Fault::attribute(self.type_name(), name)),
        }
    }
}

const STREAM_METHODS: [&str; 3] = ["write", "flush", "readline"];

impl RemoteObject for StreamObject {
    fn type_name(&self) -> &str {
        "remote_object.Stream"
    }

    fn get_attr(&self, name: &str) -> Result<Value> {
        match name {
            "name" => Ok(Value::Str(format!("<{}>", self.kind.name()))),
            method if STREAM_METHODS.contains(&method) => {
                let stream = StreamObject::new(self.kind, self.stream.clone());
                let method = method.to_string();
                Ok(Value::Object(Function::new(method.clone(), move |args| {
                    stream.run(&method, &args)
                })))
            }
            _ => Err(Fault::attribute(self.type_name(), name)),
        }
    }

    fn invoke(&self, name: &str, args: Args) -> Result<Value> {
        self.run(name, &args)
    }

    fn members(&self) -> Vec<MemberInfo> {
        STREAM_METHODS
            .iter()
            .map(|name| MemberInfo {
                name: name.to_string(),
                kind: MemberKind::Method,
                capability: true,
            })
            .collect()
    }
}

/// Adapter writing to any object with `write`/`flush`/`readline` methods.
pub struct ObjectStream {
    object: ObjectRef,
}

impl ObjectStream {
    pub fn new(object: ObjectRef) -> Self {
        Self { object }
    }
}

impl TextStream for ObjectStream {
    fn write_str(&self, text: &str) -> Result<()> {
        self.object
            .invoke("write", Args::new(vec![Value::from(text)]))
            .map(drop)
    }

    fn flush(&self) -> Result<()> {
        match self.object.invoke("flush", Args::default()) {
            Err(fault) if fault.is_attribute() => Ok(()),
            other => other.map(drop),
        }
    }

    fn read_line(&self) -> Result<String> {
        match self.object.invoke("readline", Args::default())? {
            Value::Str(line) => Ok(line),
            Value::Bytes(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            other => Err(Fault::raised(
                Phase::Call,
                "TypeError",
                format!("readline returned {}", other.type_label()),
            )),
        }
    }
}

struct PeerStreams {
    stdout: Value,
    stderr: Value,
}

fn get_peer_stream(conn: &Connection, kind: StreamKind) -> Result<Value> {
    conn.request_raw(Request::GetAttr {
        target: Target::Root,
        name: kind.name().to_string(),
    })
}

fn set_peer_stream(conn: &Connection, kind: StreamKind, value: &Value) -> Result<()> {
    conn.request_raw(set_stream_request(conn, kind, value)?).map(drop)
}

fn set_stream_request(conn: &Connection, kind: StreamKind, value: &Value) -> Result<Request> {
    Ok(Request::SetAttr {
        target: Target::Root,
        name: kind.name().to_string(),
        value: conn.boxer().box_value(value)?,
    })
}

/// Put the saved streams back. After an abandoned call the peer is still
/// busy with it, so the restores are queued behind it instead of awaited.
fn restore_peer(conn: &Connection, saved: &PeerStreams, wait: bool) {
    for (kind, value) in [
        (StreamKind::Stdout, &saved.stdout),
        (StreamKind::Stderr, &saved.stderr),
    ] {
        let restored = if wait {
            set_peer_stream(conn, kind, value)
        } else {
            set_stream_request(conn, kind, value).and_then(|req| conn.request_detached(req))
        };
        if let Err(fault) = restored {
            debug!(conn_id = conn.id(), stream = kind.name(), error = %fault, "restore failed");
        }
    }
}

fn install_on_peer(conn: &Connection) -> Result<PeerStreams> {
    let saved = PeerStreams {
        stdout: get_peer_stream(conn, StreamKind::Stdout)?,
        stderr: get_peer_stream(conn, StreamKind::Stderr)?,
    };
    for kind in [StreamKind::Stdout, StreamKind::Stderr] {
        let ours = Value::object(StreamObject::new(kind, current(kind)));
        if let Err(fault) = set_peer_stream(conn, kind, &ours) {
            let abandoned = matches!(fault, Fault::Timeout(_));
            restore_peer(conn, &saved, !abandoned);
            return Err(fault);
        }
    }
    conn.metrics().redirection_installed();
    Ok(saved)
}

/// Run `call` with the peer's stdout/stderr pointing at this thread's
/// streams. Only the outermost scope of a connection installs and restores.
pub(crate) fn with_redirected_output<T, F>(conn: &Connection, call: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let depth = conn.redirect_depth();
    let outermost = depth.fetch_add(1, Ordering::AcqRel) == 0;

    let saved = if outermost && !conn.is_closed() {
        match install_on_peer(conn) {
            Ok(saved) => Some(saved),
            Err(fault) => {
                debug!(conn_id = conn.id(), error = %fault, "peer refused output redirection");
                None
            }
        }
    } else {
        None
    };

    let outcome = call();

    if let Some(saved) = saved {
        if !conn.is_closed() {
            let abandoned = matches!(outcome, Err(Fault::Timeout(_)));
            restore_peer(conn, &saved, !abandoned);
        }
    }

    if depth
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
        .is_err()
    {
        error!(conn_id = conn.id(), "redirection depth underflow");
        conn.close();
        return Err(Fault::Redirection(ERR_REDIRECT_UNDERFLOW.to_string()));
    }
    outcome
}
