//! WAL benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokenflow_wal::{FsyncPolicy, Wal, WalConfig, WalEntry, WalOffset};
use tempfile::TempDir;

fn create_test_wal(fsync: FsyncPolicy) -> (TempDir, Wal) {
    let dir = TempDir::new().unwrap();
    let config = WalConfig::new(dir.path())
        .with_segment_size(64 * 1024 * 1024)
        .with_fsync_policy(fsync);
    let wal = Wal::open(config).unwrap();
    (dir, wal)
}

/// A commit carrying `changes` execution updates.
fn create_commit(changes: usize) -> WalEntry {
    WalEntry::Commit {
        command: "Signal".to_string(),
        changes: (0..changes)
            .map(|i| {
                serde_json::json!({
                    "op": "update",
                    "entity": {
                        "type": "execution",
                        "id": format!("exec-{}", i),
                        "process_instance_id": "bench-instance",
                        "activity_id": "review",
                        "variables": {"amount": i, "approved": true},
                        "revision": 3
                    }
                })
            })
            .collect(),
        timestamp: 1_700_000_000_000,
    }
}

fn bench_wal_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_append");

    for (name, policy) in [
        ("no_fsync", FsyncPolicy::Never),
        ("fsync_every_100", FsyncPolicy::EveryN(100)),
    ] {
        let (_dir, wal) = create_test_wal(policy);
        let entry = create_commit(2);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("commit", name), &entry, |b, entry| {
            b.iter(|| black_box(wal.append(entry).unwrap()));
        });
    }

    // Larger change sets, as produced by parallel forks and joins
    let (_dir, wal) = create_test_wal(FsyncPolicy::Never);
    for changes in [1, 10, 100] {
        let entry = create_commit(changes);
        group.throughput(Throughput::Elements(changes as u64));
        group.bench_with_input(BenchmarkId::new("changes", changes), &entry, |b, entry| {
            b.iter(|| black_box(wal.append(entry).unwrap()));
        });
    }

    group.finish();
}

fn bench_wal_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_read");

    let (_dir, wal) = create_test_wal(FsyncPolicy::Never);
    let entry = create_commit(2);
    for _ in 0..1000 {
        wal.append(&entry).unwrap();
    }

    for limit in [10, 100, 1000] {
        group.throughput(Throughput::Elements(limit as u64));
        group.bench_with_input(BenchmarkId::new("entries", limit), &limit, |b, &limit| {
            b.iter(|| black_box(wal.read_from(WalOffset::start(), Some(limit)).unwrap()));
        });
    }

    group.finish();
}

fn bench_wal_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_recovery");

    for entry_count in [100, 1000, 10000] {
        let dir = TempDir::new().unwrap();
        {
            let config = WalConfig::new(dir.path()).with_fsync_policy(FsyncPolicy::Never);
            let wal = Wal::open(config).unwrap();
            let entry = create_commit(2);
            for _ in 0..entry_count {
                wal.append(&entry).unwrap();
            }
            wal.sync().unwrap();
        }

        group.throughput(Throughput::Elements(entry_count as u64));
        group.bench_with_input(
            BenchmarkId::new("entries", entry_count),
            &entry_count,
            |b, _| {
                b.iter(|| {
                    let config = WalConfig::new(dir.path()).with_fsync_policy(FsyncPolicy::Never);
                    black_box(Wal::open(config).unwrap())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_wal_append, bench_wal_read, bench_wal_recovery);

criterion_main!(benches);
