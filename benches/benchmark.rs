use capture_pipeline::{chrome_args, Config, InflightRequests, Job, NetworkEvent};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn benchmark_config_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    configure_fast_group(&mut group);

    group.bench_function("creation", |b| {
        b.iter(|| {
            let config = Config::default();
            black_box(config);
        });
    });

    group.bench_function("chrome_args", |b| {
        let config = Config::default();
        b.iter(|| black_box(chrome_args(&config)));
    });

    group.finish();
}

fn benchmark_job_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_parsing");
    configure_fast_group(&mut group);

    let payloads: Vec<&[u8]> = vec![
        br#"{"url": "https://example.com"}"#,
        br#"{"url": "https://example.com/a/much/longer/path?with=query&and=more#fragment"}"#,
        br#"{"url": "not a url"}"#,
        b"\xff\xfe garbage",
    ];

    group.bench_function("from_delivery", |b| {
        b.iter(|| {
            for payload in &payloads {
                let result = Job::from_delivery(payload, false);
                let _ = black_box(result);
            }
        });
    });

    group.finish();
}

fn benchmark_url_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_validation");
    configure_fast_group(&mut group);

    let test_urls = vec![
        "https://example.com",
        "http://example.com/path",
        "invalid-url",
    ];

    group.bench_function("validate", |b| {
        b.iter(|| {
            for url in &test_urls {
                let result = capture_pipeline::validate_url(url);
                let _ = black_box(result);
            }
        });
    });

    let list = (0..100)
        .map(|i| format!("https://site-{i}.example\n# comment\n\n"))
        .collect::<String>();
    group.bench_function("parse_url_list", |b| {
        b.iter(|| black_box(capture_pipeline::parse_url_list(&list)));
    });

    group.finish();
}

fn benchmark_network_tracking(c: &mut Criterion) {
    let mut group = c.benchmark_group("network_tracking");
    configure_fast_group(&mut group);

    group.bench_function("page_load_200_requests", |b| {
        b.iter(|| {
            let mut inflight = InflightRequests::default();
            for i in 0..200 {
                inflight.apply(NetworkEvent::Started(i.to_string()));
            }
            for i in 0..200 {
                inflight.apply(NetworkEvent::Finished(i.to_string()));
            }
            black_box(inflight.is_empty());
        });
    });

    group.finish();
}

fn benchmark_format_utilities(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_utilities");
    configure_fast_group(&mut group);

    let test_durations = vec![Duration::from_millis(100), Duration::from_secs(5)];
    let test_byte_sizes = vec![1024, 1048576];

    group.bench_function("format_duration", |b| {
        b.iter(|| {
            for duration in &test_durations {
                let formatted = capture_pipeline::format_duration(*duration);
                black_box(formatted);
            }
        });
    });

    group.bench_function("format_bytes", |b| {
        b.iter(|| {
            for size in &test_byte_sizes {
                let formatted = capture_pipeline::format_bytes(*size);
                black_box(formatted);
            }
        });
    });

    group.finish();
}

criterion_group!(
    unit_benches,
    benchmark_config_creation,
    benchmark_job_parsing,
    benchmark_url_validation,
    benchmark_network_tracking,
    benchmark_format_utilities,
);

criterion_main!(unit_benches);
