// ========================================================================================
//
//                           Job Array Planning Benchmark
//
// ========================================================================================
//
// Measures how planning scales with the number of chunks: partitioning, grouped
// path allocation, command rendering and task-key derivation. Nothing touches
// the filesystem beyond the input check, so the numbers reflect pure planning cost.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use genoflow::callers::Illuminus;
use genoflow::config::{IlluminusOptions, PlannerConfig};
use genoflow::partition::partition;
use genoflow::planner::ChunkJobPlanner;
use genoflow::types::IndexRange;
use std::fs;

/// SNP counts of typical chips, from a small custom array to a large GWAS chip.
const SNP_COUNTS: [u64; 4] = [10_000, 250_000, 1_000_000, 4_000_000];

fn bench_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");
    for &snps in &SNP_COUNTS {
        group.throughput(Throughput::Elements(snps));
        group.bench_with_input(BenchmarkId::from_parameter(snps), &snps, |b, &snps| {
            b.iter(|| partition(0, black_box(snps), 10_000))
        });
    }
    group.finish();
}

fn bench_plan(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("temporary directory");
    for input in ["run1.sim", "chip.bpm.csv", "run1.sample.json"] {
        fs::write(dir.path().join(input), "x").expect("write input");
    }
    let planner = ChunkJobPlanner::new(&PlannerConfig::new(dir.path()));
    let options = IlluminusOptions {
        chunk_size: 1_000,
        ..IlluminusOptions::default()
    };

    let mut group = c.benchmark_group("plan_illuminus");
    for &snps in &SNP_COUNTS {
        let caller = Illuminus {
            sim: "run1.sim".into(),
            manifest: "chip.bpm.csv".into(),
            sample_json: "run1.sample.json".into(),
            output: "run1.1".into(),
            snps: IndexRange::new(0, snps).expect("range"),
            chromosome: Some("1".to_string()),
            options: options.clone(),
        };
        group.throughput(Throughput::Elements(snps / options.chunk_size));
        group.bench_with_input(BenchmarkId::from_parameter(snps), &caller, |b, caller| {
            b.iter(|| planner.prepare(black_box(caller)).expect("plan"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_partition, bench_plan);
criterion_main!(benches);
