//! Framing codec for [`Packet`]s over a byte stream.
//!
//! The codec works on a `BytesMut` accumulator, so the same implementation
//! frames tokio streams and the blocking reader of a connection worker.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::packet::{Packet, HEADER_SIZE};
use crate::error::Fault;

#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = Fault;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, Fault> {
        let Some(length) = Packet::peek_length(src)? else {
            return Ok(None);
        };
        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }
        let version = src[4];
        let flags = src[5];
        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).to_vec();
        Ok(Some(Packet {
            version,
            flags,
            payload,
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = Fault;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Fault> {
        dst.reserve(HEADER_SIZE + packet.payload.len());
        let mut header = Vec::with_capacity(HEADER_SIZE);
        packet.write_header(&mut header);
        dst.put_slice(&header);
        dst.put_slice(&packet.payload);
        Ok(())
    }
}
