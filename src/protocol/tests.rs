// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::config::ProtocolConfig;
use crate::core::codec::PacketCodec;
use crate::core::object::{Class, Function, Instance, RemoteObject};
use crate::core::packet::Packet;
use crate::core::value::{Args, ObjectRef, Value};
use crate::error::{Fault, Phase};
use crate::protocol::connection::{Connection, ConnectionSettings};
use crate::protocol::message::{Message, Request, Target};
use crate::service::host::HostService;
use crate::service::redirect::{self, StreamKind, StreamObject};
use crate::service::ClientService;

struct Lib;

fn library() -> ObjectRef {
    let class = Class::<Lib>::builder("tests.Provider")
        .doc("Test provider")
        .method("add", |_, args| Ok(Value::Int(args.int(0, "a")? + args.int(1, "b")?)))
        .method("divide", |_, args| {
            let b = args.int(1, "b")?;
            if b == 0 {
                return Err(Fault::raised(Phase::Call, "ZeroDivisionError", "division by zero"));
            }
            Ok(Value::Int(args.int(0, "a")? / b))
        })
        .method("apply", |_, args| match args.get(0) {
            Some(Value::Object(f)) => f.call(Args::new(args.positional[1..].to_vec())),
            _ => Err(Fault::runtime("expected a callable")),
        })
        .method("echo", |_, args| Ok(args.get(0).cloned().unwrap_or_default()))
        .method("sleep", |_, args| {
            std::thread::sleep(Duration::from_millis(args.int(0, "ms")? as u64));
            Ok(Value::None)
        })
        .method("explode", |_, _| panic!("hosted code exploded"))
        .method("bloat", |_, _| {
            let kept: ObjectRef = Function::new("kept", |_| Ok(Value::None));
            Ok(Value::Tuple(vec![
                Value::Object(kept),
                Value::Bytes(vec![0u8; 17 * 1024 * 1024]),
            ]))
        })
        .property("broken", |_| Err(Fault::raised(Phase::Lookup, "ValueError", "getter raised")))
        .constant("answer", 42)
        .build();
    Instance::new(class, Lib)
}

struct Pair {
    client: Connection,
    server: Connection,
    running: Arc<AtomicBool>,
    serve: Option<JoinHandle<()>>,
}

impl Drop for Pair {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.client.close();
        if let Some(serve) = self.serve.take() {
            let _ = serve.join();
        }
    }
}

fn pair_with(client_settings: ConnectionSettings) -> Pair {
    let protocol = ProtocolConfig::default();
    pair_between(
        client_settings,
        ConnectionSettings::new(&protocol).with_poll_interval(Duration::from_millis(20)),
    )
}

fn pair_between(client_settings: ConnectionSettings, server_settings: ConnectionSettings) -> Pair {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client_stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server_stream, _) = listener.accept().unwrap();

    let server = Connection::new(
        server_stream,
        Box::new(HostService::new(library(), &server_settings.protocol)),
        server_settings,
    )
    .unwrap();
    let client = Connection::new(client_stream, Box::new(ClientService), client_settings).unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let serve = {
        let server = server.clone();
        let running = running.clone();
        std::thread::spawn(move || {
            let _ = server.serve_until(|| running.load(Ordering::Acquire));
            server.close();
        })
    };
    Pair {
        client,
        server,
        running,
        serve: Some(serve),
    }
}

fn pair() -> Pair {
    pair_with(ConnectionSettings::default())
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn peer_stream(conn: &Connection, kind: StreamKind) -> Value {
    conn.request_raw(Request::GetAttr {
        target: Target::Root,
        name: kind.name().into(),
    })
    .unwrap()
}

fn ints(values: &[i64]) -> Args {
    Args::new(values.iter().copied().map(Value::Int).collect())
}

#[test]
fn test_invoke_through_root_proxy() {
    let pair = pair();
    let root = pair.client.root().unwrap();
    assert_eq!(root.type_name(), "tests.Provider");
    assert_eq!(root.invoke("add", ints(&[2, 3])).unwrap(), Value::Int(5));
    assert_eq!(root.get_attr("answer").unwrap(), Value::Int(42));
    assert_eq!(root.doc().as_deref(), Some("Test provider"));
}

#[test]
fn test_scalars_and_tuples_round_trip() {
    let pair = pair();
    let root = pair.client.root().unwrap();
    let tuple = Value::Tuple(vec![Value::Int(1), Value::Str("two".into()), Value::Float(3.5)]);
    for value in [Value::Int(7), Value::Str("text".into()), tuple] {
        assert_eq!(root.invoke("echo", Args::new(vec![value.clone()])).unwrap(), value);
    }
}

#[test]
fn test_fault_classification_survives_the_wire() {
    let pair = pair();
    let root = pair.client.root().unwrap();

    let missing = root.get_attr("missing").unwrap_err();
    assert!(missing.is_attribute());

    let raising = root.get_attr("broken").unwrap_err();
    assert!(matches!(raising, Fault::Execution { phase: Phase::Lookup, ref kind, .. } if kind == "ValueError"));

    let division = root.invoke("divide", ints(&[1, 0])).unwrap_err();
    assert!(matches!(
        division,
        Fault::Execution { phase: Phase::Call, ref message, .. } if message == "division by zero"
    ));

    // the connection stays usable
    assert_eq!(root.invoke("divide", ints(&[9, 3])).unwrap(), Value::Int(3));
}

#[test]
fn test_panic_is_returned_as_fault() {
    let pair = pair();
    let root = pair.client.root().unwrap();
    let fault = root.invoke("explode", Args::default()).unwrap_err();
    assert!(matches!(fault, Fault::Execution { ref message, .. } if message.contains("hosted code exploded")));
    assert_eq!(root.invoke("add", ints(&[1, 1])).unwrap(), Value::Int(2));
}

#[test]
fn test_same_reference_yields_same_proxy() {
    let pair = pair();
    let first = pair.client.root().unwrap();
    let second = pair.client.root().unwrap();
    let (a, b) = (first.as_proxy().unwrap(), second.as_proxy().unwrap());
    assert!(std::ptr::eq(a, b));
    assert_eq!(a.refcount(), 2);
    assert_eq!(pair.client.proxies().live_count(), 1);
    assert_eq!(pair.server.local_objects().refs(a.id_pack()), Some(2));
}

#[test]
fn test_released_proxy_removes_peer_entry_once() {
    let pair = pair();
    let root = pair.client.root().unwrap();
    let again = pair.client.root().unwrap();
    let id_pack = root.as_proxy().unwrap().id_pack().clone();
    drop(root);
    pair.client.flush_decrefs().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    // one handle still alive, nothing released yet
    assert_eq!(pair.server.local_objects().refs(&id_pack), Some(2));

    drop(again);
    pair.client.flush_decrefs().unwrap();
    assert!(wait_until(|| !pair.server.local_objects().contains(&id_pack)));
    assert_eq!(pair.server.metrics().snapshot().decrefs_received, 1);
}

#[test]
fn test_echoed_proxy_comes_back_as_local_object() {
    let pair = pair();
    let root = pair.client.root().unwrap();
    // the server receives its own object back and returns it
    let echoed = root.invoke("echo", Args::new(vec![Value::Object(root.clone())])).unwrap();
    let echoed = echoed.as_object().unwrap().as_proxy().unwrap();
    assert!(std::ptr::eq(echoed, root.as_proxy().unwrap()));
}

#[test]
fn test_nested_callback_into_caller() {
    let pair = pair();
    let root = pair.client.root().unwrap();
    let double: ObjectRef = Function::new("double", |args| Ok(Value::Int(args.int(0, "x")? * 2)));
    let result = root
        .invoke("apply", Args::new(vec![Value::Object(double), Value::Int(21)]))
        .unwrap();
    assert_eq!(result, Value::Int(42));
    assert_eq!(pair.client.metrics().snapshot().requests_served, 1);
}

#[test]
fn test_capabilities_of_remote_object() {
    let pair = pair();
    let root = pair.client.root().unwrap();
    let names = root.capabilities().unwrap();
    assert_eq!(names, vec!["add", "apply", "bloat", "divide", "echo", "explode", "sleep"]);
}

#[test]
fn test_timeout_then_late_reply_is_discarded() {
    let pair = pair_with(ConnectionSettings::default().with_timeout(Some(Duration::from_millis(100))));
    let root = pair.client.root().unwrap();
    let fault = root.invoke("sleep", ints(&[300])).unwrap_err();
    assert!(matches!(fault, Fault::Timeout(100)));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(root.invoke("add", ints(&[2, 2])).unwrap(), Value::Int(4));
}

#[test]
fn test_closed_connection_fails_pending_and_new_calls() {
    let pair = pair();
    let root = pair.client.root().unwrap();
    pair.client.close();
    let fault = root.invoke("add", ints(&[1, 2])).unwrap_err();
    assert!(matches!(fault, Fault::Connection(_)));
}

#[test]
fn test_request_on_root_target() {
    let pair = pair();
    let value = pair
        .client
        .request(Request::GetAttr {
            target: Target::Root,
            name: "answer".into(),
        })
        .unwrap();
    assert_eq!(value, Value::Int(42));
    let value = pair
        .client
        .request(Request::Evaluate {
            code: "library.add(40, 2)".into(),
        })
        .unwrap();
    assert_eq!(value, Value::Int(42));
}

#[test]
fn test_undecodable_request_gets_protocol_fault() {
    // a raw peer speaking to a server connection directly
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut raw = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (stream, _) = listener.accept().unwrap();
    let protocol = ProtocolConfig::default();
    let server = Connection::new(
        stream,
        Box::new(HostService::new(library(), &protocol)),
        ConnectionSettings::new(&protocol).with_poll_interval(Duration::from_millis(20)),
    )
    .unwrap();
    let serving = {
        let server = server.clone();
        std::thread::spawn(move || server.serve_until(|| true))
    };

    // variant 0 (request), seq 7, then garbage
    let mut payload = vec![0, 0, 0, 0, 7, 0, 0, 0];
    payload.extend_from_slice(&[0xff; 6]);
    raw.write_all(&Packet::new(payload).to_bytes()).unwrap();

    raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 1024];
    let packet = loop {
        if let Some(packet) = PacketCodec.decode(&mut buf).unwrap() {
            break packet;
        }
        let n = raw.read(&mut chunk).unwrap();
        assert!(n > 0, "server closed the connection");
        buf.extend_from_slice(&chunk[..n]);
    };
    match Message::decode(&packet.payload).unwrap() {
        Message::Reply { seq, outcome } => {
            assert_eq!(seq, 7);
            assert!(matches!(outcome, Err(Fault::Protocol(_))));
        }
        other => panic!("unexpected message {other:?}"),
    }
    assert!(!server.is_closed());

    drop(raw);
    serving.join().unwrap().unwrap();
    assert_eq!(server.metrics().snapshot().protocol_errors, 1);
}

#[test]
fn test_failed_call_restores_peer_streams() {
    let pair = pair_with(ConnectionSettings::default().with_redirected_output(true));
    let root = pair.client.root().unwrap();
    let fault = root.invoke("divide", ints(&[1, 0])).unwrap_err();
    assert!(fault.is_execution());
    assert!(pair.client.metrics().snapshot().redirections_installed >= 1);
    assert_eq!(peer_stream(&pair.client, StreamKind::Stdout), Value::None);
    assert_eq!(peer_stream(&pair.client, StreamKind::Stderr), Value::None);
}

#[test]
fn test_abandoned_call_returns_at_its_timeout() {
    let pair = pair_with(
        ConnectionSettings::default()
            .with_redirected_output(true)
            .with_timeout(Some(Duration::from_millis(300))),
    );
    let root = pair.client.root().unwrap();

    let started = Instant::now();
    let fault = root.invoke("sleep", ints(&[1500])).unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(fault, Fault::Timeout(300)));
    assert!(elapsed < Duration::from_millis(600), "returned after {elapsed:?}");

    // the queued restores run once the peer is free again
    assert!(wait_until(|| root.invoke("add", ints(&[1, 1])).is_ok()));
    assert_eq!(peer_stream(&pair.client, StreamKind::Stdout), Value::None);
}

#[test]
fn test_disconnect_clears_overrides_on_serving_thread() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // one thread serves both sessions in turn, like a reused worker
    let serving = std::thread::spawn(move || {
        let protocol = ProtocolConfig::default();
        for _ in 0..2 {
            let (stream, _) = listener.accept().unwrap();
            let server = Connection::new(
                stream,
                Box::new(HostService::new(library(), &protocol)),
                ConnectionSettings::new(&protocol).with_poll_interval(Duration::from_millis(20)),
            )
            .unwrap();
            let _ = server.serve_until(|| true);
            server.service().on_disconnect(&server);
            server.close();
        }
    });

    let connect = || {
        Connection::new(
            TcpStream::connect(addr).unwrap(),
            Box::new(ClientService),
            ConnectionSettings::default(),
        )
        .unwrap()
    };

    let first = connect();
    let ours = Value::object(StreamObject::new(
        StreamKind::Stdout,
        redirect::current(StreamKind::Stdout),
    ));
    first
        .request_raw(Request::SetAttr {
            target: Target::Root,
            name: StreamKind::Stdout.name().into(),
            value: first.boxer().box_value(&ours).unwrap(),
        })
        .unwrap();
    assert!(matches!(peer_stream(&first, StreamKind::Stdout), Value::Object(_)));
    // gone without restoring anything
    first.close();

    let second = connect();
    assert_eq!(peer_stream(&second, StreamKind::Stdout), Value::None);
    second.close();
    serving.join().unwrap();
}

#[test]
fn test_refused_reply_releases_its_references() {
    let pair = pair();
    let fault = pair
        .client
        .request(Request::Invoke {
            target: Target::Root,
            name: "bloat".into(),
            args: vec![],
            kwargs: vec![],
        })
        .unwrap_err();
    assert!(matches!(fault, Fault::Protocol(ref m) if m.contains("too large")));
    assert!(pair.server.local_objects().is_empty());
    // the session survives the refused reply
    assert_eq!(
        pair.client.root().unwrap().invoke("add", ints(&[1, 2])).unwrap(),
        Value::Int(3)
    );
}

#[test]
fn test_unmerged_protocol_refuses_private_names_and_setattr() {
    let strict = ProtocolConfig {
        allow_all_attrs: false,
        allow_setattr: false,
        ..ProtocolConfig::default()
    };
    let pair = pair_between(
        ConnectionSettings::default(),
        ConnectionSettings::default()
            .with_protocol(strict)
            .with_poll_interval(Duration::from_millis(20)),
    );
    let get = |name: &str| {
        pair.client.request(Request::GetAttr {
            target: Target::Root,
            name: name.into(),
        })
    };
    assert_eq!(get("answer").unwrap(), Value::Int(42));
    assert!(get("__class__").unwrap_err().is_attribute());

    let refused = pair
        .client
        .request(Request::SetAttr {
            target: Target::Root,
            name: "answer".into(),
            value: pair.client.boxer().box_value(&Value::Int(1)).unwrap(),
        })
        .unwrap_err();
    assert!(refused.is_attribute());
}
