//! Event framing throughput benchmark.
//!
//! Measures SSE encoding of ToolEvents and incremental decoding across
//! fixed-size read boundaries using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use switchboard::events::sse::{encode_event, SseDecoder};
use switchboard::events::{EventType, ToolEvent};
use switchboard::types::SessionId;

fn event(payload_len: usize) -> ToolEvent {
    ToolEvent {
        event_type: EventType::ToolResult,
        session_id: SessionId::generate(),
        sequence: 42,
        payload: json!({
            "invocationId": "8d2c5f1e-0000-4000-8000-000000000000",
            "toolId": "weather",
            "status": "completed",
            "result": "x".repeat(payload_len),
        }),
    }
}

fn bench_encode(c: &mut Criterion) {
    let sizes: &[usize] = &[0, 256, 4096, 65536];

    let mut group = c.benchmark_group("encode_event");
    for &size in sizes {
        let event = event(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &event, |b, e| {
            b.iter(|| encode_event(black_box(e)).unwrap());
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    // 64 frames read back in chunks of various sizes
    let wire: Vec<u8> = (0..64)
        .flat_map(|_| encode_event(&event(512)).unwrap().to_vec())
        .collect();
    let chunk_sizes: &[usize] = &[16, 512, 8192];

    let mut group = c.benchmark_group("decode_stream");
    for &chunk in chunk_sizes {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &wire, |b, w| {
            b.iter(|| {
                let mut decoder = SseDecoder::new();
                let mut frames = 0;
                for piece in w.chunks(chunk) {
                    frames += decoder.feed(black_box(piece)).len();
                }
                assert_eq!(frames, 64);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
