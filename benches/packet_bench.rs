use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use remote_object::core::codec::PacketCodec;
use remote_object::core::packet::Packet;
use remote_object::utils::compression::{maybe_compress, CompressionKind};
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_packet_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_encode_decode");
    let payload_sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &payload_sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter_batched(
                || Packet::new(vec![0u8; size]),
                |packet| {
                    let mut buf = BytesMut::with_capacity(size + 32);
                    PacketCodec.encode(packet, &mut buf).unwrap();
                },
                BatchSize::SmallInput,
            )
        });

        let mut framed = BytesMut::new();
        PacketCodec
            .encode(Packet::new(vec![0u8; size]), &mut framed)
            .unwrap();
        group.bench_function(format!("decode_{size}b"), |b| {
            b.iter_batched(
                || framed.clone(),
                |mut buf| {
                    let decoded = PacketCodec.decode(&mut buf).unwrap();
                    assert!(decoded.is_some());
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_payload_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_compression");
    // repetitive text, the usual shape of large keyword results
    let payload: Vec<u8> = "keyword output line\n".repeat(4096).into_bytes();
    group.throughput(Throughput::Bytes(payload.len() as u64));

    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        group.bench_function(format!("{kind:?}"), |b| {
            b.iter_batched(
                || payload.clone(),
                |data| maybe_compress(data, kind, 512).unwrap(),
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_packet_encode_decode, bench_payload_compression);
criterion_main!(benches);
