//! Benchmarks for checkpoint save, load and rotation throughput

use bytes::Bytes;
use checkpoint::CheckpointLedger;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicU64, Ordering};
use storage::{LocalStorage, StorageBackend};
use tempfile::TempDir;

const SIZES: [usize; 3] = [1_000_000, 10_000_000, 100_000_000];

fn artifact_write_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("artifact_write");

    for size in SIZES.iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());
        let data = Bytes::from(vec![0u8; *size]);

        group.bench_function(format!("{}MB", size / 1_000_000), |b| {
            b.to_async(&rt).iter(|| async {
                storage.write("model_0.bin", data.clone()).await.unwrap();
            });
        });
    }

    group.finish();
}

fn ledger_save_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("ledger_save");

    for size in SIZES.iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        let temp_dir = TempDir::new().unwrap();
        let ledger = CheckpointLedger::new(temp_dir.path(), 3);
        let blob = vec![0u8; *size];
        let step = AtomicU64::new(0);

        group.bench_function(format!("{}MB", size / 1_000_000), |b| {
            b.to_async(&rt).iter(|| async {
                let step = step.fetch_add(1, Ordering::Relaxed);
                ledger.save(&blob, step).await.unwrap();
            });
        });
    }

    group.finish();
}

fn ledger_load_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("ledger_load");

    for size in SIZES.iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        let temp_dir = TempDir::new().unwrap();
        let ledger = CheckpointLedger::new(temp_dir.path(), 3);
        rt.block_on(ledger.save(&vec![0u8; *size], 100)).unwrap();

        group.bench_function(format!("{}MB", size / 1_000_000), |b| {
            b.to_async(&rt).iter(|| async {
                let blob: Vec<u8> = ledger.load(None).await.unwrap();
                blob
            });
        });
    }

    group.finish();
}

fn ledger_contention_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("ledger_contention");

    for num_writers in [1, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_writers),
            num_writers,
            |b, &writers| {
                b.to_async(&rt).iter(|| async move {
                    let temp_dir = TempDir::new().unwrap();

                    let mut handles = vec![];
                    for i in 0..writers {
                        let path = temp_dir.path().to_path_buf();
                        handles.push(tokio::spawn(async move {
                            let ledger = CheckpointLedger::new(path, 4);
                            ledger.save(&vec![0u8; 100_000], i as u64).await.unwrap();
                        }));
                    }

                    for handle in handles {
                        handle.await.unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    artifact_write_benchmark,
    ledger_save_benchmark,
    ledger_load_benchmark,
    ledger_contention_benchmark,
);
criterion_main!(benches);
