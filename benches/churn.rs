//! Allocation churn: arena slots vs boxed nodes.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use indexed_arena::{Arena, HeapSource};

const NODES: usize = 1024;
const NODE_SIZE: usize = 24;

type Node = [u64; 3];

fn arena_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("churn");

    group.bench_function("arena_fill_drain", |b| {
        let arena: Arena<u32, HeapSource> = Arena::new(NODES).unwrap();
        let mut handles = Vec::with_capacity(NODES);
        b.iter(|| {
            for _ in 0..NODES {
                handles.push(arena.allocate(NODE_SIZE).unwrap());
            }
            for handle in handles.drain(..) {
                arena.deallocate(black_box(handle), NODE_SIZE);
            }
        });
    });

    group.bench_function("arena_fill_drain_no_delete", |b| {
        let arena: Arena<u32, HeapSource> =
            Arena::with_source(NODES, false, HeapSource::new()).unwrap();
        let mut handles = Vec::with_capacity(NODES);
        b.iter(|| {
            for _ in 0..NODES {
                handles.push(arena.allocate(NODE_SIZE).unwrap());
            }
            for handle in handles.drain(..) {
                arena.deallocate(black_box(handle), NODE_SIZE);
            }
            // Dropping the last handle auto-reset the arena, so the next
            // round starts from a clean bump run.
        });
    });

    group.bench_function("arena_pairwise", |b| {
        let arena: Arena<u32, HeapSource> = Arena::new(NODES).unwrap();
        // Keep one slot live so the arena never auto-resets mid-measurement.
        let pin = arena.allocate(NODE_SIZE).unwrap();
        b.iter(|| {
            let handle = arena.allocate(NODE_SIZE).unwrap();
            black_box(arena.element(handle));
            arena.deallocate(handle, NODE_SIZE);
        });
        arena.deallocate(pin, NODE_SIZE);
    });

    group.bench_function("box_fill_drain", |b| {
        let mut nodes: Vec<Box<Node>> = Vec::with_capacity(NODES);
        b.iter(|| {
            for i in 0..NODES {
                nodes.push(black_box(Box::new([i as u64; 3])));
            }
            nodes.clear();
        });
    });

    group.finish();
}

#[cfg(feature = "sync")]
fn sync_arena_churn(c: &mut Criterion) {
    use indexed_arena::SyncArena;

    let mut group = c.benchmark_group("sync_churn");

    group.bench_function("uncontended_pairwise", |b| {
        let arena: SyncArena<u32, HeapSource> = SyncArena::new(NODES).unwrap();
        b.iter(|| {
            let handle = arena.allocate(NODE_SIZE).unwrap();
            black_box(arena.element(handle));
            arena.deallocate(handle, NODE_SIZE);
        });
    });

    group.finish();
}

#[cfg(feature = "sync")]
criterion_group!(benches, arena_churn, sync_arena_churn);
#[cfg(not(feature = "sync"))]
criterion_group!(benches, arena_churn);
criterion_main!(benches);
