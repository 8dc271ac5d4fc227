use criterion::{criterion_group, criterion_main, Criterion};
use logos_collab::broadcast::{BroadcastGroup, RoomFrame};
use logos_collab::clock::LogicalClock;
use logos_collab::holdback::HoldbackBuffer;
use logos_collab::protocol::{Batch, Envelope, OperationKind, SyncMessage};
use logos_collab::queue::{DeliveryHandler, OutboundQueue, QueueConfig};
use logos_collab::transport::Transport;
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, bytes: Vec<u8>) -> bool {
        black_box(bytes);
        true
    }
}

struct NullHandler;

impl DeliveryHandler for NullHandler {
    fn on_oversize(&mut self, _op: Envelope, _size: usize) {}
    fn on_dead_letter(&mut self, _batch: Batch) {}
}

/// Clock with `n` participants, each at `n`.
fn wide_clock(n: u128) -> LogicalClock {
    (0..n).map(|i| (Uuid::from_u128(i + 1), n as u64)).collect()
}

fn stroke_op(origin: Uuid, clock: LogicalClock) -> Envelope {
    Envelope::new(
        origin,
        Uuid::nil(),
        clock,
        OperationKind::Update,
        json!({ "modelId": Uuid::nil(), "modelType": "path", "updates": { "points": [[0.0, 0.0], [1.0, 1.0]] }, "previous": {} }),
    )
}

fn bench_clock_merge_32(c: &mut Criterion) {
    let a = wide_clock(32);
    let b = wide_clock(32).increment(Uuid::from_u128(7));

    c.bench_function("clock_merge_32_participants", |bench| {
        bench.iter(|| black_box(black_box(&a).merge(black_box(&b))))
    });
}

fn bench_causal_ready_32(c: &mut Criterion) {
    let local = wide_clock(32);
    let sender = Uuid::from_u128(3);
    let op = local.increment(sender);

    c.bench_function("causal_ready_32_participants", |bench| {
        bench.iter(|| {
            black_box(LogicalClock::is_causally_ready(
                black_box(&op),
                black_box(&local),
                &sender,
            ))
        })
    });
}

fn bench_holdback_drain_reversed_1000(c: &mut Criterion) {
    let sender = Uuid::from_u128(1);
    let mut clock = LogicalClock::new();
    let mut ops = Vec::with_capacity(1000);
    for _ in 0..1000 {
        clock = clock.increment(sender);
        ops.push(stroke_op(sender, clock.clone()));
    }
    ops.reverse();

    c.bench_function("holdback_drain_1000_reversed", |bench| {
        bench.iter(|| {
            let mut buffer = HoldbackBuffer::new(1000);
            for op in ops.iter().cloned() {
                buffer.admit(op);
            }
            let mut local = LogicalClock::new();
            loop {
                let ready = buffer.drain_ready(&local);
                if ready.is_empty() {
                    break;
                }
                for op in &ready {
                    local = local.merge(op.clock());
                }
            }
            black_box(local);
        })
    });
}

fn bench_queue_pack_1000(c: &mut Criterion) {
    let origin = Uuid::from_u128(1);
    let mut clock = LogicalClock::new();
    let ops: Vec<Envelope> = (0..1000)
        .map(|_| {
            clock = clock.increment(origin);
            stroke_op(origin, clock.clone())
        })
        .collect();
    let config = QueueConfig {
        max_inflight_batches: usize::MAX,
        ..QueueConfig::default()
    };

    c.bench_function("queue_enqueue_flush_1000_ops", |bench| {
        bench.iter(|| {
            let mut queue = OutboundQueue::new(
                origin,
                Uuid::nil(),
                config.clone(),
                Arc::new(NullTransport),
                Box::new(NullHandler),
            );
            let now = Instant::now();
            for op in ops.iter().cloned() {
                queue.enqueue(op, now).unwrap();
            }
            queue.poll_flush(now + Duration::from_secs(1)).unwrap();
            black_box(queue.inflight_len());
        })
    });
}

fn bench_operation_encode_50(c: &mut Criterion) {
    let origin = Uuid::from_u128(1);
    let batch = Batch::new(
        origin,
        Uuid::nil(),
        (1..=50)
            .map(|seq| stroke_op(origin, LogicalClock::from([(origin, seq)])))
            .collect(),
    );

    c.bench_function("operation_encode_50_ops", |bench| {
        bench.iter(|| {
            let msg = SyncMessage::operation(origin, black_box(&batch)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_broadcast_1000_frames_100_peers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_frames_100_peers", |bench| {
        bench.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);

                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(group.add_peer(Uuid::new_v4()).await);
                }

                for i in 0..1000u64 {
                    let frame = Arc::new(RoomFrame {
                        sender_id: Uuid::nil(),
                        bytes: vec![i as u8; 64],
                    });
                    group.broadcast_raw(black_box(frame));
                }
            });
        })
    });
}

criterion_group!(
    benches,
    bench_clock_merge_32,
    bench_causal_ready_32,
    bench_holdback_drain_reversed_1000,
    bench_queue_pack_1000,
    bench_operation_encode_50,
    bench_broadcast_1000_frames_100_peers,
);
criterion_main!(benches);
