use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use procmux::console::LogStacker;
use procmux::core::codec::{Frame, FrameCodec};
use procmux::core::packet::Packet;
use tokio_util::codec::{Decoder, Encoder};

fn console_messages(lines: usize, width: usize) -> Packet {
    Packet::ConsoleMessages {
        lines: (0..lines).map(|i| format!("{i:>width$}")).collect(),
    }
}

#[allow(clippy::unwrap_used)]
fn bench_packet_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_encode_decode");
    let line_counts = [1usize, 16, 128, 255];

    for &count in &line_counts {
        let packet = console_messages(count, 80);
        let encoded = packet.encode().unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_function(format!("encode_{count}_lines"), |b| {
            b.iter(|| packet.encode().unwrap())
        });
        group.bench_function(format!("decode_{count}_lines"), |b| {
            b.iter(|| {
                let decoded = Packet::decode(&encoded);
                assert!(decoded.is_ok());
            })
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");
    let payload_sizes = [64usize, 4096, 65536];

    for &size in &payload_sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("roundtrip_{size}b"), |b| {
            b.iter_batched(
                || Frame::binary(vec![0u8; size].into()),
                |frame| {
                    let mut codec = FrameCodec::default();
                    let mut buf = BytesMut::with_capacity(size + 16);
                    codec.encode(frame, &mut buf).unwrap();
                    codec.decode(&mut buf).unwrap().unwrap()
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_log_stacker(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_stacker");

    group.bench_function("add_with_4_trackers", |b| {
        let mut log = LogStacker::new(200);
        let trackers: Vec<_> = (0..4).map(|_| log.add_tracker()).collect();
        let mut i = 0u64;
        b.iter(|| {
            log.add(format!("line {i}"));
            i += 1;
            if i % 20 == 0 {
                for &tracker in &trackers {
                    log.read_all_changes(tracker);
                }
            }
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_packet_encode_decode,
    bench_frame_codec,
    bench_log_stacker
);
criterion_main!(benches);
