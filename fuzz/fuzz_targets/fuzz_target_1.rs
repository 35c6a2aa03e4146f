#![no_main]

use libfuzzer_sys::fuzz_target;
use remote_object::core::packet::Packet;
use remote_object::protocol::message::Message;

fuzz_target!(|data: &[u8]| {
    // Framing and message decoding must reject, never panic
    let _ = Packet::from_bytes(data);
    let _ = Message::decode(data);
    let _ = Message::recover_request_seq(data);
});
