//! Benchmark: DAG construction
//!
//! Measures `UnitGraph::build` and leveling over synthetic dependency
//! chains of varying width/depth.
//! Run: cargo bench --bench dag_construction

use camino::Utf8PathBuf;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rustc_hash::FxHashMap;
use stratum::unit::{DependencyRef, HookSet, IgnoreRule, RetryConfig, Unit};
use stratum::{SortMode, UnitGraph};
use std::collections::HashSet;

fn chain_of(n: usize) -> Vec<Unit> {
    (0..n)
        .map(|i| {
            let path = Utf8PathBuf::from(format!("/units/u{i}"));
            let dependencies = if i == 0 {
                Vec::new()
            } else {
                vec![DependencyRef {
                    name: "prev".to_string(),
                    target_path: Utf8PathBuf::from(format!("/units/u{}", i - 1)),
                    mock_outputs: None,
                    mock_outputs_allowed_commands: HashSet::new(),
                    skip_outputs: false,
                }]
            };
            Unit {
                path,
                config_path: Utf8PathBuf::from(format!("/units/u{i}/stratum.hcl")),
                includes: Vec::new(),
                locals: FxHashMap::default(),
                inputs: FxHashMap::default(),
                dependencies,
                remote_state: None,
                terraform: None,
                hooks: HookSet::default(),
                retry: RetryConfig::default(),
                ignore: Vec::<IgnoreRule>::new(),
                feature_flags: FxHashMap::default(),
                exclude_actions: HashSet::new(),
                external: false,
            }
        })
        .collect()
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("unit_graph_build");
    for size in [10usize, 100, 1_000] {
        let units = chain_of(size);
        group.bench_function(format!("chain_{size}"), |b| {
            b.iter(|| {
                let graph = UnitGraph::build(black_box(&units));
                black_box(graph)
            });
        });
    }
    group.finish();
}

fn bench_levels(c: &mut Criterion) {
    let mut group = c.benchmark_group("unit_graph_levels");
    for size in [10usize, 100, 1_000] {
        let units = chain_of(size);
        let graph = UnitGraph::build(&units);
        group.bench_function(format!("chain_{size}"), |b| {
            b.iter(|| black_box(graph.levels(SortMode::Dag)));
        });
    }
    group.finish();
}

fn bench_cycle_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("unit_graph_cycle_detection");
    for size in [10usize, 100, 1_000] {
        let units = chain_of(size);
        let graph = UnitGraph::build(&units);
        group.bench_function(format!("chain_{size}"), |b| {
            b.iter(|| black_box(graph.detect_cycles()).is_ok());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build, bench_levels, bench_cycle_detection);
criterion_main!(benches);
