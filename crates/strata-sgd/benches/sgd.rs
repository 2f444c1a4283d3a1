//! Benchmarks for the SGD inner loops.
//!
//! Measures: one BlockWorker pass per order, and one lock-runner pass at
//! several thread counts.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use strata_matrix::{ColFactors, Factors, RowFactors, SparseMatrix};
use strata_sgd::*;

fn problem(m: usize, n: usize, nnz: usize, r: usize) -> (SparseMatrix, Factors) {
    let mut v = SparseMatrix::with_capacity(m, n, nnz);
    for k in 0..nnz {
        let i = (k * 7919) % m;
        let j = (k * 104_729) % n;
        v.push(i, j, ((i + j) % 5) as f64 + 1.0);
    }
    let f = Factors {
        w: RowFactors::from_fn(m, r, |i, k| 0.1 + 0.001 * ((i + k) % 17) as f64),
        h: ColFactors::from_fn(r, n, |k, j| 0.1 + 0.001 * ((j + 3 * k) % 13) as f64),
    };
    (v, f)
}

fn bench_block_worker(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_worker");
    let (v, f) = problem(2_000, 1_000, 100_000, 16);
    for order in [SgdOrder::Sequential, SgdOrder::WithReplacement, SgdOrder::WithoutReplacement] {
        group.bench_with_input(BenchmarkId::new("pass", format!("{order:?}")), &order, |b, &order| {
            let mut f = f.clone();
            let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
            b.iter(|| {
                let Factors { w, h } = &mut f;
                black_box(BlockWorker::new(&Nzsl, order).run(BlockRef::whole(&v), w, h, 1e-4, &mut rng))
            });
        });
    }
    group.finish();
}

fn bench_lock_runner(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_runner");
    let (v, f) = problem(2_000, 1_000, 100_000, 16);
    for threads in [1, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("pass", threads), &threads, |b, &threads| {
            let mut f = f.clone();
            let mut runner =
                LocalLockRunner::new(Nzsl, RegularizeNone, SgdOrder::WithReplacement, threads, 7)
                    .unwrap();
            b.iter(|| black_box(runner.run_updates(&mut f, &v, 1e-4).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_block_worker, bench_lock_runner);
criterion_main!(benches);
