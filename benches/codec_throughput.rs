//! Echo codec throughput benchmark.
//!
//! Measures read_frame/write_frame latency and throughput using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use netharness::protocol::codec::{read_frame, write_frame};
use netharness::protocol::EchoCommand;
use std::io::Cursor;

const MAX_FRAME: u32 = 5 * 1024 * 1024;
const PAYLOAD_SIZES: &[usize] = &[0, 64, 1024, 4096, 65536];

fn bench_write_frame(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let code = EchoCommand::Echo.code();

    let mut group = c.benchmark_group("write_frame");
    for &size in PAYLOAD_SIZES {
        let payload = vec![0xABu8; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, p| {
            b.iter(|| {
                rt.block_on(async {
                    let mut buf = Vec::with_capacity(size + 5);
                    write_frame(&mut buf, code, black_box(p)).await.unwrap();
                    buf
                })
            });
        });
    }
    group.finish();
}

fn bench_read_frame(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let code = EchoCommand::Echo.code();

    let mut group = c.benchmark_group("read_frame");
    for &size in PAYLOAD_SIZES {
        let payload = vec![0xABu8; size];
        let wire = rt.block_on(async {
            let mut buf = Vec::new();
            write_frame(&mut buf, code, &payload).await.unwrap();
            buf
        });

        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, w| {
            b.iter(|| {
                rt.block_on(async {
                    let mut cursor = Cursor::new(black_box(w.as_slice()));
                    read_frame(&mut cursor, MAX_FRAME).await.unwrap()
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_write_frame, bench_read_frame);
criterion_main!(benches);
