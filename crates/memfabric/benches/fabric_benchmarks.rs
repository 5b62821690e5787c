//! Benchmarks for the registry, the page table and loopback migrations.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use memfabric::{
    AddressSpace, ControlMessage, FabricConfig, LoopbackFabric, MemoryManager, NodeId, PageState,
    PageTable, RegionAddress, RegionRegistry, DEFAULT_ALIGNMENT,
};
use std::hint::black_box;

const START: u64 = 1 << 44;

fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("allocate_deallocate", |b| {
        let registry = RegionRegistry::new(
            AddressSpace::new(RegionAddress(START), 1 << 30),
            DEFAULT_ALIGNMENT,
            NodeId(0),
        );
        b.iter(|| {
            let region = registry.allocate(black_box(10_000)).unwrap();
            registry.deallocate(&region).unwrap();
        });
    });

    for num_regions in [16usize, 256, 4096].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("lookup", num_regions),
            num_regions,
            |b, &num_regions| {
                let registry = RegionRegistry::new(
                    AddressSpace::new(RegionAddress(START), 1 << 30),
                    DEFAULT_ALIGNMENT,
                    NodeId(0),
                );
                let regions: Vec<_> = (0..num_regions)
                    .map(|_| registry.allocate(4096).unwrap())
                    .collect();
                let mut i = 0usize;
                b.iter(|| {
                    let addr = regions[i % regions.len()].base().offset(100);
                    i += 1;
                    black_box(registry.lookup(addr))
                });
            },
        );
    }

    group.finish();
}

fn bench_page_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_table");

    for num_pages in [64usize, 4096].iter() {
        group.throughput(Throughput::Elements(*num_pages as u64));
        group.bench_with_input(
            BenchmarkId::new("claim_all", num_pages),
            num_pages,
            |b, &num_pages| {
                b.iter(|| {
                    let table = PageTable::new(RegionAddress(START), num_pages * 4096, 4096).unwrap();
                    for index in 0..num_pages {
                        if table.compare_and_swap_of(index, PageState::Remote, PageState::InFlight) {
                            table.set_state_of(index, PageState::Local);
                        }
                    }
                    black_box(table.is_fully_local())
                });
            },
        );
    }

    group.finish();
}

fn bench_messages(c: &mut Criterion) {
    let message = ControlMessage::Done {
        addr: RegionAddress(START),
        size: 1 << 20,
    };
    c.bench_function("message_encode_decode", |b| {
        b.iter(|| {
            let bytes = message.encode().unwrap();
            black_box(ControlMessage::decode(&bytes).unwrap())
        });
    });
}

fn bench_migration(c: &mut Criterion) {
    let mut group = c.benchmark_group("migration");
    group.sample_size(20);

    for size in [64usize << 10, 1 << 20].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("paged_4k", size), size, |b, &size| {
            let fabric = LoopbackFabric::with_nodes(&[NodeId(0), NodeId(1)]);
            let config = FabricConfig::default()
                .address_space(RegionAddress(START), 64 << 20)
                .default_page_size(Some(4096));
            let node = |id: NodeId| {
                MemoryManager::builder(fabric.endpoint(id), fabric.coordinator(id))
                    .config(config.clone())
                    .build()
                    .unwrap()
            };
            let (source, dest) = (node(NodeId(0)), node(NodeId(1)));

            b.iter(|| {
                let region = source.allocate(size).unwrap();
                source.migrate(&region, NodeId(1)).unwrap();
                let received = dest.wait_for_transfer().unwrap();
                dest.pull(&received).unwrap();
                dest.close(&received).unwrap();
                source.wait_for_close(&region).unwrap();
                dest.wait_for_close(&received).unwrap();
                dest.deallocate(&received).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_registry,
    bench_page_table,
    bench_messages,
    bench_migration
);
criterion_main!(benches);
