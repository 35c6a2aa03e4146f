//! # Connection
//!
//! One session over a blocking TCP stream, symmetric for both peers.
//!
//! ## Request flow
//! A caller sends a [`Request`] and blocks until its reply arrives. While it
//! waits it serves whatever else comes in, so the peer can call back into
//! this side (nested calls) before answering. Only one thread reads the
//! stream at a time; replies meant for another waiter are parked in a reply
//! table and the waiter is woken.
//!
//! ## Failure scope
//! - Undecodable messages are answered with a protocol fault when their
//!   request sequence can be recovered; the connection continues.
//! - Framing and transport errors close the connection; every pending call
//!   then fails with [`Fault::Connection`].
//! - A reply that arrives after its caller timed out is discarded, and any
//!   references it carried are released.

use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, TryLockError};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, trace, warn};

use crate::config::{ProtocolConfig, MAX_PAYLOAD_SIZE};
use crate::core::codec::PacketCodec;
use crate::core::packet::{Packet, FLAG_COMPRESSED, HEADER_SIZE};
use crate::core::value::{ObjectRef, Value};
use crate::error::constants::{ERR_CONNECTION_CLOSED, ERR_CONNECTION_LOST, ERR_LOCK_POISONED};
use crate::error::{Fault, Result};
use crate::protocol::boxing::Boxer;
use crate::protocol::dispatcher;
use crate::protocol::message::{Boxed, Message, Request};
use crate::protocol::registry::{LocalObjectTable, ProxyRegistry};
use crate::service::{redirect, Service};
use crate::utils::compression::{self, CompressionKind};
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::timeout::{POLL_INTERVAL, REPLY_POLL_SLICE};

const READ_CHUNK: usize = 8 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Protocol options; merged with the required gates unless set through
    /// [`ConnectionSettings::with_protocol`]
    pub protocol: ProtocolConfig,
    /// Timeout of each synchronous request; `None` waits forever
    pub timeout: Option<Duration>,
    /// Read timeout of one idle serve-loop tick
    pub poll_interval: Duration,
    /// Redirect the peer's stdout/stderr here around every request
    pub redirect_output: bool,
}

impl ConnectionSettings {
    pub fn new(protocol: &ProtocolConfig) -> Self {
        Self {
            protocol: protocol.merged(),
            timeout: None,
            poll_interval: POLL_INTERVAL,
            redirect_output: false,
        }
    }

    /// Use `protocol` as given, without merging the required attribute
    /// gates. Lets an embedder serve a connection with private names or
    /// attribute operations refused.
    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_redirected_output(mut self, redirect_output: bool) -> Self {
        self.redirect_output = redirect_output;
        self
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::new(&ProtocolConfig::default())
    }
}

enum ReadOutcome {
    Packet(Packet),
    Idle,
    Closed,
}

struct FrameReader {
    stream: TcpStream,
    buf: BytesMut,
    codec: PacketCodec,
}

impl FrameReader {
    /// Read until one packet is complete, the stream stays silent for
    /// `wait`, or the peer closes. Partial frames stay buffered.
    fn read_packet(&mut self, wait: Duration) -> Result<ReadOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(packet) = self.codec.decode(&mut self.buf)? {
                return Ok(ReadOutcome::Packet(packet));
            }
            self.stream
                .set_read_timeout(Some(wait.max(Duration::from_millis(1))))?;
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(ReadOutcome::Idle)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionReset
                            | ErrorKind::ConnectionAborted
                            | ErrorKind::BrokenPipe
                            | ErrorKind::UnexpectedEof
                    ) =>
                {
                    return Ok(ReadOutcome::Closed)
                }
                Err(e) => return Err(Fault::Io(e)),
            }
        }
    }
}

#[derive(Default)]
struct ReplyTable {
    pending: HashSet<u32>,
    ready: HashMap<u32, std::result::Result<Boxed, Fault>>,
}

pub(crate) struct ConnInner {
    id: u64,
    peer: Option<SocketAddr>,
    reader: Mutex<FrameReader>,
    writer: Mutex<TcpStream>,
    replies: Mutex<ReplyTable>,
    reply_ready: Condvar,
    next_seq: AtomicU32,
    closed: AtomicBool,
    pub(crate) local: LocalObjectTable,
    pub(crate) proxies: ProxyRegistry,
    service: Box<dyn Service>,
    settings: ConnectionSettings,
    redirect_depth: AtomicUsize,
    metrics: Metrics,
}

/// Shared handle to one session; clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        service: Box<dyn Service>,
        settings: ConnectionSettings,
    ) -> Result<Self> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let peer = stream.peer_addr().ok();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new_cyclic(|weak| ConnInner {
            id,
            peer,
            reader: Mutex::new(FrameReader {
                stream: reader,
                buf: BytesMut::with_capacity(READ_CHUNK),
                codec: PacketCodec,
            }),
            writer: Mutex::new(stream),
            replies: Mutex::new(ReplyTable::default()),
            reply_ready: Condvar::new(),
            next_seq: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            local: LocalObjectTable::new(),
            proxies: ProxyRegistry::new(id, weak.clone()),
            service,
            settings,
            redirect_depth: AtomicUsize::new(0),
            metrics: Metrics::new(),
        });
        debug!(conn_id = id, peer = ?peer, "connection opened");
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ConnInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn local_objects(&self) -> &LocalObjectTable {
        &self.inner.local
    }

    pub fn proxies(&self) -> &ProxyRegistry {
        &self.inner.proxies
    }

    pub(crate) fn service(&self) -> &dyn Service {
        self.inner.service.as_ref()
    }

    pub(crate) fn redirect_depth(&self) -> &AtomicUsize {
        &self.inner.redirect_depth
    }

    pub fn boxer(&self) -> Boxer<'_> {
        Boxer::new(&self.inner.local, &self.inner.proxies, &self.inner.metrics)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Send `request` and wait for its outcome.
    ///
    /// With redirected output enabled, the peer's stdout/stderr point at this
    /// side for the duration of the outermost request.
    pub fn request(&self, request: Request) -> Result<Value> {
        if self.inner.settings.redirect_output && !matches!(request, Request::Stop) {
            redirect::with_redirected_output(self, || self.request_raw(request))
        } else {
            self.request_raw(request)
        }
    }

    /// [`Connection::request`] without the redirection scope.
    pub(crate) fn request_raw(&self, request: Request) -> Result<Value> {
        let inner = &self.inner;
        let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let kind = request.kind();
        inner.replies.lock()?.pending.insert(seq);

        if let Err(fault) = self.send(&Message::Request { seq, request }) {
            self.forget_pending(seq);
            return Err(fault);
        }
        inner.metrics.request_sent();
        trace!(conn_id = inner.id, seq, kind, "request sent");

        let outcome = self.wait_reply(seq)?;
        self.boxer().unbox(outcome?)
    }

    /// Send `request` without waiting for it. The reply arrives unclaimed
    /// and is discarded like any late reply.
    pub(crate) fn request_detached(&self, request: Request) -> Result<()> {
        let inner = &self.inner;
        let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let kind = request.kind();
        self.send(&Message::Request { seq, request })?;
        inner.metrics.request_sent();
        trace!(conn_id = inner.id, seq, kind, "detached request sent");
        Ok(())
    }

    /// The peer's root object.
    pub fn root(&self) -> Result<ObjectRef> {
        match self.request(Request::Root)? {
            Value::Object(obj) => Ok(obj),
            other => Err(Fault::Protocol(format!(
                "peer root is not an object: {other:?}"
            ))),
        }
    }

    /// Serve incoming requests until `keep_serving` turns false or the peer
    /// disconnects. A request in progress always completes first.
    pub fn serve_until<F>(&self, keep_serving: F) -> Result<()>
    where
        F: Fn() -> bool,
    {
        let poll = self.inner.settings.poll_interval;
        while keep_serving() && !self.is_closed() {
            self.flush_decrefs()?;
            let outcome = {
                let mut reader = self.inner.reader.lock()?;
                reader.read_packet(poll)
            };
            self.inner.reply_ready.notify_all();
            self.handle_read(outcome)?;
        }
        Ok(())
    }

    /// Close the transport. Pending calls fail and local references are
    /// released.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(writer) = self.inner.writer.lock() {
            let _ = writer.shutdown(Shutdown::Both);
        }
        self.inner.reply_ready.notify_all();
        self.inner.local.clear();
        debug!(conn_id = self.inner.id, "connection closed");
    }

    /// Send queued decrefs as one fire-and-forget message.
    pub fn flush_decrefs(&self) -> Result<()> {
        let refs = self.inner.proxies.drain_decrefs();
        if refs.is_empty() || self.is_closed() {
            return Ok(());
        }
        self.inner.metrics.decrefs_sent(refs.len() as u64);
        trace!(conn_id = self.inner.id, count = refs.len(), "sending decrefs");
        self.write_message(&Message::Decref { refs })
    }

    fn wait_reply(&self, seq: u32) -> Result<std::result::Result<Boxed, Fault>> {
        let inner = &self.inner;
        let deadline = inner.settings.timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(outcome) = self.take_reply(seq)? {
                return Ok(outcome);
            }
            if self.is_closed() {
                self.forget_pending(seq);
                return Err(Fault::connection(ERR_CONNECTION_LOST));
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.forget_pending(seq);
                        let timeout_ms = inner
                            .settings
                            .timeout
                            .map(|t| t.as_millis() as u64)
                            .unwrap_or_default();
                        warn!(conn_id = inner.id, seq, timeout_ms, "request timed out");
                        return Err(Fault::Timeout(timeout_ms));
                    }
                    (deadline - now).min(REPLY_POLL_SLICE)
                }
                None => REPLY_POLL_SLICE,
            };

            match inner.reader.try_lock() {
                Ok(mut reader) => {
                    let outcome = reader.read_packet(slice);
                    drop(reader);
                    inner.reply_ready.notify_all();
                    self.handle_read(outcome)?;
                }
                Err(TryLockError::WouldBlock) => {
                    let table = inner.replies.lock()?;
                    if !table.ready.contains_key(&seq) && !self.is_closed() {
                        let _ = inner.reply_ready.wait_timeout(table, slice)?;
                    }
                }
                Err(TryLockError::Poisoned(_)) => {
                    return Err(Fault::connection(ERR_LOCK_POISONED))
                }
            }
        }
    }

    fn take_reply(&self, seq: u32) -> Result<Option<std::result::Result<Boxed, Fault>>> {
        let mut table = self.inner.replies.lock()?;
        let outcome = table.ready.remove(&seq);
        if outcome.is_some() {
            table.pending.remove(&seq);
        }
        Ok(outcome)
    }

    fn forget_pending(&self, seq: u32) {
        if let Ok(mut table) = self.inner.replies.lock() {
            table.pending.remove(&seq);
            table.ready.remove(&seq);
        }
    }

    fn handle_read(&self, outcome: Result<ReadOutcome>) -> Result<()> {
        match outcome {
            Ok(ReadOutcome::Packet(packet)) => self.process_packet(packet),
            Ok(ReadOutcome::Idle) => Ok(()),
            Ok(ReadOutcome::Closed) => {
                debug!(conn_id = self.inner.id, "peer closed the connection");
                self.close();
                Ok(())
            }
            Err(fault) => {
                error!(conn_id = self.inner.id, error = %fault, "transport failure");
                self.inner.metrics.connection_error();
                self.close();
                Err(Fault::connection(fault.to_string()))
            }
        }
    }

    fn process_packet(&self, packet: Packet) -> Result<()> {
        let inner = &self.inner;
        inner
            .metrics
            .bytes_received((HEADER_SIZE + packet.payload.len()) as u64);

        let payload = match self.unframe(packet) {
            Ok(payload) => payload,
            Err(fault) => {
                inner.metrics.protocol_error();
                warn!(conn_id = inner.id, error = %fault, "dropping unreadable packet");
                return Ok(());
            }
        };

        match Message::decode(&payload) {
            Ok(Message::Reply { seq, outcome }) => self.accept_reply(seq, outcome),
            Ok(Message::Request { seq, request }) => self.serve_request(seq, request),
            Ok(Message::Decref { refs }) => {
                self.apply_decrefs(refs);
                Ok(())
            }
            Err(fault) => {
                inner.metrics.protocol_error();
                warn!(conn_id = inner.id, error = %fault, "undecodable message");
                match Message::recover_request_seq(&payload) {
                    Some(seq) => self.send_reply(seq, Err(fault)),
                    None => Ok(()),
                }
            }
        }
    }

    fn accept_reply(&self, seq: u32, outcome: std::result::Result<Boxed, Fault>) -> Result<()> {
        let late = {
            let mut table = self.inner.replies.lock()?;
            if table.pending.contains(&seq) {
                table.ready.insert(seq, outcome);
                None
            } else {
                Some(outcome)
            }
        };
        self.inner.reply_ready.notify_all();

        if let Some(outcome) = late {
            debug!(conn_id = self.inner.id, seq, "discarding late reply");
            if let Ok(boxed) = outcome {
                // unboxing then dropping releases the references it carried
                drop(self.boxer().unbox(boxed));
            }
        }
        Ok(())
    }

    fn serve_request(&self, seq: u32, request: Request) -> Result<()> {
        let inner = &self.inner;
        let kind = request.kind();
        let _timer = Timer::start(kind);
        inner.metrics.request_served();
        trace!(conn_id = inner.id, seq, kind, "serving request");

        let outcome = dispatcher::dispatch(self, request)
            .and_then(|value| self.boxer().box_value(&value))
            .map_err(|fault| {
                inner.metrics.fault_returned();
                debug!(conn_id = inner.id, seq, kind, error = %fault, "request failed");
                fault.into_wire()
            });
        self.send_reply(seq, outcome)
    }

    fn send_reply(&self, seq: u32, outcome: std::result::Result<Boxed, Fault>) -> Result<()> {
        match self.send(&Message::Reply { seq, outcome }) {
            // an oversized or unencodable reply still gets an answer
            Err(Fault::Protocol(message)) => self.send(&Message::Reply {
                seq,
                outcome: Err(Fault::Protocol(message)),
            }),
            Err(Fault::Serialization(e)) => self.send(&Message::Reply {
                seq,
                outcome: Err(Fault::Protocol(e.to_string())),
            }),
            other => other,
        }
    }

    fn apply_decrefs(&self, refs: Vec<(crate::core::identity::IdPack, u32)>) {
        let inner = &self.inner;
        inner.metrics.decrefs_received(refs.len() as u64);
        for (id_pack, count) in refs {
            match inner.local.release(&id_pack, count) {
                Ok(true) => trace!(conn_id = inner.id, %id_pack, "local object released"),
                Ok(false) => {}
                Err(fault) => warn!(conn_id = inner.id, error = %fault, "decref failed"),
            }
        }
    }

    /// Write `message`. When it is refused before reaching the wire, the
    /// references boxed into it are released again.
    fn send(&self, message: &Message) -> Result<()> {
        self.flush_decrefs()?;
        match self.write_message(message) {
            Err(fault @ (Fault::Protocol(_) | Fault::Serialization(_))) => {
                let boxer = self.boxer();
                for boxed in message.carried() {
                    boxer.release_unsent(boxed);
                }
                Err(fault)
            }
            other => other,
        }
    }

    fn write_message(&self, message: &Message) -> Result<()> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(Fault::connection(ERR_CONNECTION_CLOSED));
        }
        let packet = self.frame(message.encode()?)?;
        if packet.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Fault::Protocol(format!(
                "Packet too large: {} bytes",
                packet.payload.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + packet.payload.len());
        PacketCodec.encode(packet, &mut buf)?;

        let mut writer = inner.writer.lock()?;
        if let Err(e) = writer.write_all(&buf).and_then(|_| writer.flush()) {
            drop(writer);
            error!(conn_id = inner.id, error = %e, "write failed");
            inner.metrics.connection_error();
            self.close();
            return Err(Fault::connection(e.to_string()));
        }
        inner.metrics.bytes_sent(buf.len() as u64);
        Ok(())
    }

    fn frame(&self, payload: Vec<u8>) -> Result<Packet> {
        let protocol = &self.inner.settings.protocol;
        let Some(kind) = protocol.compression else {
            return Ok(Packet::new(payload));
        };
        let (payload, compressed) =
            compression::maybe_compress(payload, kind, protocol.compression_threshold)?;
        let mut packet = Packet::new(payload);
        if compressed {
            packet.flags |= FLAG_COMPRESSED;
            self.inner.metrics.compression_applied();
        }
        Ok(packet)
    }

    fn unframe(&self, packet: Packet) -> Result<Vec<u8>> {
        if !packet.is_compressed() {
            return Ok(packet.payload);
        }
        let kind = self
            .inner
            .settings
            .protocol
            .compression
            .unwrap_or(CompressionKind::Lz4);
        compression::decompress(&packet.payload, kind)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
