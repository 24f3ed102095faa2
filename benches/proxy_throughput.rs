//! Per-request overhead on the proxying hot path: reverse SSE usage
//! scanning (spec.md §4.10 step 4) and the progress-filter line splitter
//! that rides every byte of child stdout/stderr (spec.md §4.5).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use modelmux::metrics::extract_from_sse_reverse;
use modelmux::process::ProgressFilter;

fn sse_body(event_count: usize) -> Vec<u8> {
    let mut body = Vec::new();
    for i in 0..event_count {
        body.extend_from_slice(format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"tok{i}\"}}}}]}}\n\n").as_bytes());
    }
    body.extend_from_slice(
        b"data: {\"usage\":{\"prompt_tokens\":128,\"completion_tokens\":256},\"timings\":{\"prompt_n\":128,\"predicted_n\":256,\"prompt_per_second\":900.0,\"predicted_per_second\":45.0,\"prompt_ms\":142.2,\"predicted_ms\":5688.9}}\n\n",
    );
    body.extend_from_slice(b"data: [DONE]\n\n");
    body
}

fn bench_sse_reverse_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("sse_reverse_scan");

    for size in [10, 100, 1000] {
        let body = sse_body(size);
        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_with_input(BenchmarkId::new("events", size), &body, |b, body| {
            b.iter(|| {
                let usage = extract_from_sse_reverse(black_box(body));
                black_box(usage);
            })
        });
    }

    group.finish();
}

fn progress_chunk(dot_run: usize) -> Vec<u8> {
    let mut chunk = Vec::new();
    chunk.extend_from_slice(b"load_tensors: loading model tensors, data size = 4096 MiB\n");
    chunk.extend(std::iter::repeat(b'.').take(dot_run));
    chunk.extend_from_slice(b"\n");
    chunk
}

fn bench_progress_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("progress_filter_write");

    for dots in [8, 64, 512] {
        let chunk = progress_chunk(dots);
        group.throughput(Throughput::Bytes(chunk.len() as u64));
        group.bench_with_input(BenchmarkId::new("dots", dots), &chunk, |b, chunk| {
            b.iter(|| {
                let mut filter = ProgressFilter::new("load_tensors:");
                let events = filter.push(black_box(chunk));
                black_box(events);
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sse_reverse_scan, bench_progress_filter);
criterion_main!(benches);
