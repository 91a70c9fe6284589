//! Latency benchmarks for eventual.
//!
//! These benchmarks focus on the per-event cost on the hot path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use eventual_core::pool::{PoolRequest, PublishRequest, SubscribeRequest};
use eventual_core::{
    JwtAuthority, Origin, RelayGuard, Registry, ReplayQueue, SessionHandle, TokenAuthority,
    WorkerPool,
};
use eventual_protocol::client::{decode_frame, encode_event};
use eventual_protocol::{codec, CloudEvent, Frame};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

/// Benchmark round-trip of a peer publish frame.
fn bench_rpc_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("rpc_roundtrip");

    let event = CloudEvent::new("evt-1", "bench", "reading")
        .with_data(serde_json::json!({ "payload": "x".repeat(256) }));
    let frame = Frame::publish(1, "token", "sub-1", "weather", event);

    group.bench_function("256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        });
    });

    group.finish();
}

/// Benchmark the client JSON path: decode an inbound publish, encode the delivery.
fn bench_client_json(c: &mut Criterion) {
    let mut group = c.benchmark_group("client_json");

    let text = serde_json::json!({
        "type": "publish",
        "token": "t",
        "channels": ["weather"],
        "event": { "id": "1", "source": "bench", "type": "reading", "data": { "celsius": 21 } }
    })
    .to_string();
    group.bench_function("decode_publish", |b| {
        b.iter(|| decode_frame(black_box(&text)).unwrap())
    });

    let event =
        CloudEvent::new("1", "bench", "reading").with_data(serde_json::json!({ "celsius": 21 }));
    group.bench_function("encode_event", |b| {
        b.iter(|| encode_event(black_box(&event)).unwrap())
    });

    group.finish();
}

/// Benchmark publish until the event sits in a subscriber's queue.
fn bench_publish_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_latency");
    let rt = Runtime::new().unwrap();

    group.bench_function("single_subscriber", |b| {
        b.iter_custom(|iters| {
            let pool = WorkerPool::new(Arc::new(Registry::new()), Arc::new(ReplayQueue::new()));
            let core = pool.core();
            let (session, mut rx) = SessionHandle::new("10.0.0.1:1", 32);
            session.mark_open();
            rt.block_on(core.handle(PoolRequest::Subscribe(SubscribeRequest {
                channels: vec!["test".into()],
                session,
            })));

            let event = Arc::new(CloudEvent::new("1", "bench", "reading"));
            let start = Instant::now();
            for _ in 0..iters {
                rt.block_on(core.publish(PublishRequest {
                    channels: vec!["test".into()],
                    event: Arc::clone(&event),
                    origin: Origin::Peer,
                }));
                let _ = rx.try_recv();
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmark token checks and relay deduplication.
fn bench_guards(c: &mut Criterion) {
    let mut group = c.benchmark_group("guards");

    let authority = JwtAuthority::new(b"bench-secret", JwtAuthority::DEFAULT_TTL);
    let token = authority.sign().unwrap();
    group.bench_function("verify_token", |b| {
        b.iter(|| authority.verify(black_box(&token)))
    });

    let guard = RelayGuard::new(Duration::from_secs(600), 100_000);
    let mut i = 0u64;
    group.bench_function("first_sighting", |b| {
        b.iter(|| {
            let event = CloudEvent::new(format!("evt-{}", i % 50_000), "bench", "reading");
            i += 1;
            guard.first_sighting(black_box(&event))
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_rpc_roundtrip,
    bench_client_json,
    bench_publish_latency,
    bench_guards,
);
criterion_main!(benches);
