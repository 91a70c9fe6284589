//! End-to-end throughput benchmark for eventual.
//!
//! Measures delivered events per second through a running broker with real
//! WebSocket I/O. Tokens are signed with `JWT_TOKEN_SECRET`, which must match
//! the broker's.

use eventual_core::JwtAuthority;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

    let secret = std::env::var("JWT_TOKEN_SECRET").unwrap_or_default();
    let token = JwtAuthority::new(secret.as_bytes(), JwtAuthority::DEFAULT_TTL)
        .sign_for("e2e-bench")?;

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║        eventual End-to-End Throughput Benchmark              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the broker is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_pubsub_benchmark(num_clients, url, token).await;
    Ok(())
}

async fn run_pubsub_benchmark(num_clients: usize, url: String, token: String) {
    println!("📊 Pub/Sub Benchmark: {} clients", num_clients);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);
        let url = url.clone();
        let token = token.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_id, &url, &token, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to subscribe
    barrier.wait().await;
    println!("✓ All {} clients connected", num_clients);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);

    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients as f64;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Delivered Events:     {:>10}                           ║",
        total_messages
    );
    println!(
        "║  Throughput:           {:>10.0} evt/s                    ║",
        msgs_per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} evt/s                    ║",
        msgs_per_sec_per_client
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    url: &str,
    token: &str,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    let subscribe = json!({ "type": "subscribe", "token": token, "channels": ["benchmark"] });
    sender.send(Message::Text(subscribe.to_string())).await?;

    // Subscriptions are acknowledged only by delivery; give the pool a moment.
    tokio::time::sleep(Duration::from_millis(200)).await;
    barrier.wait().await;

    let mut seq = 0u64;
    let recv_count = Arc::clone(&message_count);
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Text(_)) = result {
                recv_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    loop {
        seq += 1;
        let publish = json!({
            "type": "publish",
            "token": token,
            "channels": ["benchmark"],
            "event": {
                "id": format!("{}-{}", client_id, seq),
                "source": "e2e-bench",
                "type": "tick",
                "data": { "seq": seq }
            }
        });
        if sender.send(Message::Text(publish.to_string())).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
