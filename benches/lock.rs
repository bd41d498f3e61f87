//! Lock acquisition benchmarks.
//!
//! Measures the uncontended cost of a lock/unlock cycle, blocking and
//! non-blocking, on a single handle. Contended behavior is dominated by the
//! kernel's wait queue and is not meaningfully benchmarkable here.

use criterion::{criterion_group, criterion_main, Criterion};
use statefile::{CancelToken, LockFile};
use tokio::runtime::Runtime;

fn bench_lock_unlock_cycle(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.lock");
    let file = LockFile::create(&path).unwrap();
    let token = CancelToken::new();
    let runtime = Runtime::new().unwrap();

    c.bench_function("uncontended_lock_unlock", |b| {
        b.to_async(&runtime).iter(|| async {
            statefile::lock(&token, &file).await.unwrap();
            statefile::unlock(&file).unwrap();
        })
    });

    c.bench_function("uncontended_try_lock_unlock", |b| {
        b.iter(|| {
            statefile::try_lock(&file).unwrap();
            statefile::unlock(&file).unwrap();
        })
    });
}

criterion_group!(benches, bench_lock_unlock_cycle);
criterion_main!(benches);
