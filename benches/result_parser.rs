//! Result parser benchmark suite.
//!
//! Benchmarks line classification and result-body parsing at different
//! body sizes:
//! - Element counts: 1, 8, 64
//! - Array lengths: 16, 256
//!
//! Run with: cargo bench --bench result_parser
//! Results saved to: target/criterion/

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ublock::protocol::classify;
use ublock::{ResultNames, ResultParser};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const ELEMENT_COUNTS: &[usize] = &[1, 8, 64];
const ARRAY_LENGTHS: &[usize] = &[16, 256];

fn parser() -> ResultParser {
    ResultParser::new(
        ResultNames::new()
            .with_status(["hit", "miss", "catch", "reject", "noresp"])
            .with_values(["wait", "visual", "audio"])
            .with_arrays(["whisk", "lick"]),
    )
    .expect("valid names")
}

/// Builds a body cycling through status, value, array and unknown elements.
fn mixed_body(elements: usize) -> String {
    const CYCLE: &[&str] = &["hit", "wait250", "lick[12,45,67]", "visual-3", "zzz"];
    (0..elements)
        .map(|i| CYCLE[i % CYCLE.len()])
        .collect::<Vec<_>>()
        .join(";")
}

fn array_body(length: usize) -> String {
    let values: Vec<String> = (0..length).map(|i| (i * 7).to_string()).collect();
    format!("hit;whisk[{}]", values.join(","))
}

// ============================================================================
// Benchmark: Classification
// ============================================================================

fn bench_classify(c: &mut Criterion) {
    let lines = [".debug", ">info", "@d500;f1000", "+hit;wait250", "*error", "plain"];

    c.bench_function("classify/all_kinds", |b| {
        b.iter(|| {
            for line in &lines {
                black_box(classify(black_box(line)));
            }
        });
    });
}

// ============================================================================
// Benchmark: Parsing
// ============================================================================

fn bench_parse_mixed(c: &mut Criterion) {
    let parser = parser();
    let mut group = c.benchmark_group("parse_mixed");

    for &count in ELEMENT_COUNTS {
        let body = mixed_body(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("elements", count), &body, |b, body| {
            b.iter(|| parser.parse(black_box(body)));
        });
    }

    group.finish();
}

fn bench_parse_arrays(c: &mut Criterion) {
    let parser = parser();
    let mut group = c.benchmark_group("parse_arrays");

    for &length in ARRAY_LENGTHS {
        let body = array_body(length);
        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_with_input(BenchmarkId::new("length", length), &body, |b, body| {
            b.iter(|| parser.parse(black_box(body)));
        });
    }

    group.finish();
}

// ============================================================================
// Main
// ============================================================================

criterion_group!(benches, bench_classify, bench_parse_mixed, bench_parse_arrays);
criterion_main!(benches);
