//! Benchmarks for trace decoding and partner matching
//!
//! These benchmarks measure:
//! - Single line decode throughput per element kind
//! - Full directory load including partner matching and replay-order sort

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crre::element::{decode_line, ParsedLine};
use crre::{load, RoutineId};
use std::fs;

fn bench_decode_line(c: &mut Criterion) {
    let lines = [
        ("spawn", "G,1,2,7,main.rs:10"),
        ("channel", "C,5,12,3,S,7,f,send.rs:10"),
        ("mutex", "M,1,2,4,f,L,t,lock.rs:33"),
        ("select", "S,9,14,11,3~8~13,1,select.rs:70"),
        ("waitgroup", "W,3,4,5,A,-1,2,wg.rs:12"),
    ];

    let mut group = c.benchmark_group("decode_line");
    for (name, line) in lines {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(name), line, |b, line| {
            b.iter(|| {
                let parsed = decode_line(RoutineId(1), black_box(line)).unwrap();
                assert!(matches!(parsed, ParsedLine::Element(_)));
            })
        });
    }
    group.finish();
}

fn write_balanced_trace(dir: &std::path::Path, pairs: u64) {
    let mut sends = String::new();
    let mut recvs = String::new();
    for op in 1..=pairs {
        let issued = op * 4;
        let completed = op * 4 + 3;
        sends.push_str(&format!(
            "C,{},{},1,S,{},f,send.rs:{}\n",
            issued,
            completed,
            op,
            op % 500 + 1
        ));
        recvs.push_str(&format!(
            "C,{},{},1,R,{},f,recv.rs:{}\n",
            issued + 1,
            completed,
            op,
            op % 500 + 1
        ));
    }
    fs::write(dir.join("trace_1.log"), sends).unwrap();
    fs::write(dir.join("trace_2.log"), recvs).unwrap();
}

fn bench_load_and_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_and_match");
    for pairs in [100u64, 1_000, 10_000] {
        let dir = tempfile::tempdir().unwrap();
        write_balanced_trace(dir.path(), pairs);

        group.throughput(Throughput::Elements(pairs * 2));
        group.bench_with_input(BenchmarkId::from_parameter(pairs), &dir, |b, dir| {
            b.iter(|| {
                let trace = load(black_box(dir.path())).unwrap();
                assert_eq!(trace.element_count() as u64, pairs * 2);
                assert!(trace.unmatched().is_empty());
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decode_line, bench_load_and_match);
criterion_main!(benches);
