//! Property-based tests using proptest
//!
//! These tests check framing, boxing and script invariants across randomly
//! generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use proptest::prelude::*;
use remote_object::core::codec::PacketCodec;
use remote_object::core::packet::{Packet, HEADER_SIZE};
use remote_object::core::value::Value;
use remote_object::protocol::boxing::Boxer;
use remote_object::protocol::message::{Message, Request, Target};
use remote_object::protocol::registry::{LocalObjectTable, ProxyRegistry};
use remote_object::service::script::{Interpreter, Namespace};
use remote_object::utils::metrics::Metrics;
use tokio_util::codec::Decoder;

fn copied_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::None),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        (-1.0e12f64..1.0e12).prop_map(Value::Float),
        ".{0,32}".prop_map(Value::Str),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
    ];
    leaf.prop_recursive(3, 32, 6, |inner| {
        prop::collection::vec(inner, 0..6).prop_map(Value::Tuple)
    })
}

// Property: copied values cross a message unchanged
proptest! {
    #[test]
    fn prop_copied_values_survive_the_wire(value in copied_value()) {
        let local = LocalObjectTable::new();
        let proxies = ProxyRegistry::detached(1);
        let metrics = Metrics::new();
        let boxer = Boxer::new(&local, &proxies, &metrics);

        let boxed = boxer.box_value(&value).expect("boxing should not fail");
        let message = Message::Reply { seq: 1, outcome: Ok(boxed) };
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        let Message::Reply { outcome: Ok(boxed), .. } = decoded else {
            panic!("reply expected");
        };
        prop_assert_eq!(boxer.unbox(boxed).unwrap(), value);
        // copies never touch the reference tables
        prop_assert!(local.is_empty());
        prop_assert_eq!(proxies.live_count(), 0);
    }
}

// Property: packets split at any point reassemble into the original
proptest! {
    #[test]
    fn prop_packet_survives_any_split(
        payload in prop::collection::vec(any::<u8>(), 0..4096),
        split in any::<prop::sample::Index>(),
    ) {
        let bytes = Packet::new(payload.clone()).to_bytes();
        let at = split.index(bytes.len());
        let mut codec = PacketCodec;
        let mut buf = BytesMut::from(&bytes[..at]);

        let early = codec.decode(&mut buf).unwrap();
        prop_assert!(at == bytes.len() || early.is_none());
        let packet = match early {
            Some(packet) => packet,
            None => {
                buf.extend_from_slice(&bytes[at..]);
                codec.decode(&mut buf).unwrap().expect("complete packet")
            }
        };
        prop_assert_eq!(packet.payload, payload);
        prop_assert!(buf.is_empty());
    }
}

// Property: a header is either incomplete, rejected, or a bounded length
proptest! {
    #[test]
    fn prop_peek_length_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        if let Ok(Some(length)) = Packet::peek_length(&bytes) {
            prop_assert!(bytes.len() >= HEADER_SIZE);
            prop_assert!(length <= remote_object::config::MAX_PAYLOAD_SIZE);
        }
    }
}

// Property: arbitrary payloads are rejected, not panicked on
proptest! {
    #[test]
    fn prop_message_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = Message::decode(&bytes);
        let _ = Message::recover_request_seq(&bytes);
    }
}

// Property: the sequence number of any encoded request is recoverable
proptest! {
    #[test]
    fn prop_request_seq_recoverable(seq in any::<u32>(), name in "[a-z_]{1,16}") {
        let message = Message::Request {
            seq,
            request: Request::GetAttr { target: Target::Root, name },
        };
        let bytes = message.encode().unwrap();
        prop_assert_eq!(Message::recover_request_seq(&bytes), Some(seq));
    }
}

// Property: integer and string literals evaluate to themselves
proptest! {
    #[test]
    fn prop_literals_evaluate_to_themselves(n in -i64::MAX..=i64::MAX, s in "[a-zA-Z0-9 ]{0,24}") {
        let interpreter = Interpreter::new(Namespace::new());
        prop_assert_eq!(interpreter.evaluate(&n.to_string()).unwrap(), Value::Int(n));
        prop_assert_eq!(interpreter.evaluate(&format!("'{s}'")).unwrap(), Value::Str(s.clone()));

        interpreter.execute(&format!("x = {n}")).unwrap();
        prop_assert_eq!(interpreter.evaluate("x").unwrap(), Value::Int(n));
    }
}
