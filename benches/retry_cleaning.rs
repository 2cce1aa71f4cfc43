//! Benchmark: retry/ignore error-text cleaning and matching
//!
//! Measures `runner::clean_error_text` and retry-rule matching over stderr
//! blobs of varying size.
//! Run: cargo bench --bench retry_cleaning

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stratum::runner::{clean_error_text, matching_retry_rule};
use stratum::unit::RetryRule;

fn noisy_stderr(lines: usize) -> String {
    (0..lines)
        .map(|i| format!("module.vpc[{i}]: \x01refreshing state...\x02 -lock-timeout=120m"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn bench_clean_error_text(c: &mut Criterion) {
    let mut group = c.benchmark_group("clean_error_text");
    for lines in [10usize, 100, 1_000] {
        let stderr = noisy_stderr(lines);
        group.bench_function(format!("lines_{lines}"), |b| {
            b.iter(|| black_box(clean_error_text(black_box(&stderr), "exit status 1")));
        });
    }
    group.finish();
}

fn bench_matching_retry_rule(c: &mut Criterion) {
    let rules = vec![
        RetryRule {
            name: "throttle".into(),
            pattern: "RequestLimitExceeded".into(),
            max_attempts: 3,
            sleep_interval_sec: 1,
        },
        RetryRule {
            name: "timeout".into(),
            pattern: "(?s).*context deadline exceeded.*".into(),
            max_attempts: 3,
            sleep_interval_sec: 5,
        },
    ];
    let cleaned = clean_error_text(&noisy_stderr(200), "exit status 1");

    c.bench_function("matching_retry_rule_no_match", |b| {
        b.iter(|| black_box(matching_retry_rule(black_box(&rules), black_box(&cleaned), 0)));
    });
}

criterion_group!(benches, bench_clean_error_text, bench_matching_retry_rule);
criterion_main!(benches);
