//! Output filter and comparison throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use vme_runner::capability::Platform;
use vme_runner::filter::{
    discard_boot_banner, filter_benign_lines, strip_comment_lines, FilterConfig, OutputPolicy,
};
use vme_runner::protocol::{decode, encode, Request};

fn console_output(lines: usize) -> String {
    let mut out: String = (0..11).map(|i| format!("[ boot ] stage {}\n", i)).collect();
    for i in 0..lines {
        if i % 10 == 0 {
            out.push_str("# progress marker\n");
        }
        out.push_str(&format!("result line {} value={}\n", i, i * 7));
    }
    out
}

fn stderr_output(lines: usize) -> String {
    (0..lines)
        .map(|i| {
            if i % 3 == 0 {
                format!("Started enclave with enclave-cid: {}\n", i)
            } else {
                format!("Start request {} accepted\n", i)
            }
        })
        .collect()
}

fn bench_line_filters(c: &mut Criterion) {
    let mut group = c.benchmark_group("line_filters");
    let benign = regex::bytes::Regex::new("Start.*").unwrap();

    for (name, lines) in [("small", 100), ("medium", 1_000), ("large", 10_000)] {
        let stdout = console_output(lines).into_bytes();
        let stderr = stderr_output(lines).into_bytes();
        group.throughput(Throughput::Bytes(stdout.len() as u64));

        group.bench_with_input(BenchmarkId::new("strip_comments", name), &stdout, |b, text| {
            b.iter(|| strip_comment_lines(black_box(text), "#"))
        });
        group.bench_with_input(BenchmarkId::new("discard_banner", name), &stdout, |b, text| {
            b.iter(|| discard_boot_banner(black_box(text), 11))
        });
        group.bench_with_input(BenchmarkId::new("benign_stderr", name), &stderr, |b, text| {
            b.iter(|| filter_benign_lines(black_box(text), &benign))
        });
    }

    group.finish();
}

fn bench_compare(c: &mut Criterion) {
    let mut group = c.benchmark_group("compare");
    let local = OutputPolicy::new(Platform::Local, FilterConfig::default()).unwrap();
    let enclave = OutputPolicy::new(Platform::Enclave, FilterConfig::default()).unwrap();

    for (name, lines) in [("small", 100), ("large", 10_000)] {
        let stdout = console_output(lines).into_bytes();
        let expected = strip_comment_lines(&stdout, "#");
        let banner_only = console_output(0).into_bytes();
        let stderr = stderr_output(lines).into_bytes();

        group.throughput(Throughput::Bytes(stdout.len() as u64));
        group.bench_function(BenchmarkId::new("local", name), |b| {
            b.iter(|| local.compare(black_box(&stdout), b"", Some(expected.as_slice())))
        });
        group.bench_function(BenchmarkId::new("enclave", name), |b| {
            b.iter(|| enclave.compare(black_box(&banner_only), black_box(&stderr), None))
        });
    }

    group.finish();
}

fn bench_messages(c: &mut Criterion) {
    let request = Request::Connect {
        addr: "example.com:443".to_string(),
    };
    let encoded = encode(&request).unwrap();

    c.bench_function("encode_connect_request", |b| {
        b.iter(|| encode(black_box(&request)))
    });
    c.bench_function("decode_connect_request", |b| {
        b.iter(|| decode::<Request>(black_box(&encoded)))
    });
}

criterion_group!(benches, bench_line_filters, bench_compare, bench_messages);
criterion_main!(benches);
