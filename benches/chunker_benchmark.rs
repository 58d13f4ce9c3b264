use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::{Builder, Runtime};

use blob_nfs::io::{MemoryIo, TransactionalIo};
use blob_nfs::{Chunker, MetaKey};

const KB: usize = 1024;
const OBJECT_SIZE: usize = 64 * KB;

fn runtime() -> Runtime {
    Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn chunker() -> Chunker {
    Chunker::new(Arc::new(TransactionalIo::new(Arc::new(MemoryIo::new()))))
}

fn bench_write(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("chunker_write");

    for size in [4 * KB, OBJECT_SIZE, 1024 * KB] {
        let data = vec![0xa5u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        let chunker = chunker();
        let blob = MetaKey::new("bench", "v", "aligned");
        group.bench_with_input(BenchmarkId::new("aligned", size), &data, |b, data| {
            b.iter(|| {
                rt.block_on(chunker.write(&blob, OBJECT_SIZE, data, 0, None))
                    .expect("write")
            })
        });

        // offset by one byte so both ends need a read before write
        let blob = MetaKey::new("bench", "v", "misaligned");
        group.bench_with_input(BenchmarkId::new("misaligned", size), &data, |b, data| {
            b.iter(|| {
                rt.block_on(chunker.write(&blob, OBJECT_SIZE, data, 1, None))
                    .expect("write")
            })
        });
    }
    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("chunker_read");

    let chunker = chunker();
    let blob = MetaKey::new("bench", "v", "sparse");
    // every other chunk written, the rest read as zeros
    for index in (0..16u64).step_by(2) {
        rt.block_on(chunker.write(
            &blob,
            OBJECT_SIZE,
            &vec![1u8; OBJECT_SIZE],
            index * OBJECT_SIZE as u64,
            Some(16 * OBJECT_SIZE as u64),
        ))
        .expect("seed");
    }

    for size in [4 * KB, OBJECT_SIZE, 16 * OBJECT_SIZE] {
        let mut dest = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(BenchmarkId::new("read_blob", size), |b| {
            b.iter(|| {
                rt.block_on(chunker.read_blob(&blob, OBJECT_SIZE, &mut dest, 0))
                    .expect("read")
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_write, bench_read);
criterion_main!(benches);
