use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::Throughput;
use criterion::{criterion_group, criterion_main};
use seqstore::Store;
use tempfile::tempdir;

fn add_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("add");
    for payload_size in [64usize, 1024, 16 * 1024].iter() {
        group.throughput(Throughput::Bytes(*payload_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(payload_size),
            payload_size,
            |b, &payload_size| {
                let dir = tempdir().unwrap();
                let mut store = Store::open(dir.path()).unwrap();
                let payload = vec![7u8; payload_size];
                let mut i = 0u64;
                b.iter(|| {
                    store.add(&format!("id-{}", i), &payload).unwrap();
                    i += 1;
                });
            },
        );
    }
    group.finish();
}

fn get_throughput(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let mut store = Store::open(dir.path()).unwrap();
    let payload = vec![7u8; 1024];
    for i in 0..10_000u64 {
        store.add(&format!("id-{}", i), &payload).unwrap();
    }
    store.commit().unwrap();

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));
    group.bench_function("random_lookup", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let id = format!("id-{}", i % 10_000);
            store.get(&id).unwrap();
            i += 1;
        });
    });
    group.finish();
}

criterion_group!(benches, add_throughput, get_throughput);
criterion_main!(benches);
