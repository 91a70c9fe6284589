//! Codec benchmarks for eventual-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use eventual_protocol::{client, codec, CloudEvent, Frame};
use serde_json::json;

fn sample_event(payload_len: usize) -> CloudEvent {
    CloudEvent::new("evt-1", "bench", "bench.sample")
        .with_data(json!({ "blob": "x".repeat(payload_len) }))
}

fn bench_rpc_encode(c: &mut Criterion) {
    let frame = Frame::publish(1, "token", "", "test", sample_event(64));

    let mut group = c.benchmark_group("rpc_encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("publish_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_rpc_decode(c: &mut Criterion) {
    let frame = Frame::publish(1, "token", "", "test", sample_event(64));
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("rpc_decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("publish_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_client_decode(c: &mut Criterion) {
    let text = serde_json::json!({
        "type": "publish",
        "token": "token",
        "channels": ["weather"],
        "event": sample_event(256),
    })
    .to_string();

    c.bench_function("client_decode_publish_256B", |b| {
        b.iter(|| client::decode_frame(black_box(&text)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_rpc_encode,
    bench_rpc_decode,
    bench_client_decode
);
criterion_main!(benches);
