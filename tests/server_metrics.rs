//! Server-side counters kept in the process-wide metrics instance

#![allow(clippy::unwrap_used)]

use std::net::TcpStream;

use remote_object::prelude::*;
use remote_object::utils::metrics::global_metrics;
use serial_test::serial;

struct Echo;

fn server() -> RemoteServer {
    let class = Class::<Echo>::builder("tests.Echo")
        .method("echo", |_, args| Ok(args.get(0).cloned().unwrap_or_default()))
        .build();
    RemoteServer::new(
        Instance::new(class, Echo) as ObjectRef,
        ServerConfig {
            host: Some(String::from("127.0.0.1")),
            port: 0,
            ..ServerConfig::default()
        },
    )
    .unwrap()
}

fn connect(port: u16) -> RemoteClient {
    RemoteClient::connect(ClientConfig {
        peer: String::from("127.0.0.1"),
        port,
        ..ClientConfig::default()
    })
    .unwrap()
}

#[test]
#[serial]
fn test_sessions_are_counted() {
    let before = global_metrics().snapshot().connections_total;
    let handle = server().spawn().unwrap();
    for i in 0..3 {
        let client = connect(handle.port());
        assert_eq!(
            client.call("echo", Args::new(vec![Value::Int(i)])).unwrap(),
            Value::Int(i)
        );
    }
    assert_eq!(global_metrics().snapshot().connections_total, before + 3);
}

#[test]
#[serial]
fn test_refused_peer_is_not_a_session() {
    let before = global_metrics().snapshot().connections_total;
    let handle = server()
        .with_authenticator(|_: &TcpStream| -> Result<()> {
            Err(Fault::connection("peer not allowed"))
        })
        .spawn()
        .unwrap();

    let client = connect(handle.port());
    let fault = client.call("echo", Args::new(vec![Value::Int(1)])).unwrap_err();
    assert!(fault.is_fatal());
    assert_eq!(global_metrics().snapshot().connections_total, before);
}
