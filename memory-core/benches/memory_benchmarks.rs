//! Performance benchmarks for memory-core
//!
//! These benchmarks measure the per-turn hot paths: trimming, redaction and
//! ephemeral store access.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use memory_core::*;
use serde_json::json;
use std::time::Duration;

fn history(turns: usize) -> Vec<ConversationEvent> {
    (0..turns)
        .flat_map(|i| {
            vec![
                ConversationEvent::user_text("bench", format!("question {}", i)).with_tokens(40),
                ConversationEvent::tool_result("bench", "search", json!({"page": i})).with_tokens(120),
                ConversationEvent::model_text("bench", format!("answer {}", i)).with_tokens(60),
            ]
        })
        .collect()
}

/// Benchmark trimming histories of increasing length
fn bench_trim(c: &mut Criterion) {
    let mut group = c.benchmark_group("trim");
    for turns in [10usize, 100, 1000] {
        let history = history(turns);
        group.bench_with_input(BenchmarkId::from_parameter(turns), &history, |b, history| {
            b.iter(|| black_box(trim(black_box(history), 3000, 5)))
        });
    }
    group.finish();
}

/// Benchmark redaction of clean and dirty text
fn bench_redact(c: &mut Criterion) {
    let redactor = Redactor::default();
    let clean = "tôi muốn mua 2 hộp sữa tươi không đường loại 1 lít ".repeat(20);
    let dirty = "contact me at an.nguyen@example.com or +84 90 123 4567 ".repeat(20);

    c.bench_function("redact_clean", |b| b.iter(|| black_box(redactor.redact(black_box(&clean)))));
    c.bench_function("redact_dirty", |b| b.iter(|| black_box(redactor.redact(black_box(&dirty)))));
}

/// Benchmark ephemeral set/get on a warm store
fn bench_ephemeral(c: &mut Criterion) {
    let store = EphemeralStore::default();
    let namespace = session_namespace("bench", "tool");
    for i in 0..1000 {
        store.set(&namespace, &format!("k{}", i), json!(i), Duration::from_secs(900));
    }

    c.bench_function("ephemeral_get", |b| {
        b.iter(|| black_box(store.get(black_box(&namespace), black_box("k500"))))
    });
    c.bench_function("ephemeral_set", |b| {
        b.iter(|| store.set(&namespace, black_box("hot"), json!({"page": 1}), Duration::from_secs(900)))
    });
}

criterion_group!(benches, bench_trim, bench_redact, bench_ephemeral);
criterion_main!(benches);
