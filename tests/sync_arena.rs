//! Concurrency behavior of the thread-safe arena.
#![cfg(feature = "sync")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use indexed_arena::{
    thread_local_arena_context, thread_stack_top, HandleAllocator, HandleConfig, HeapSource,
    SyncArena, UniversalConfig,
};

#[test]
fn concurrent_churn_keeps_slots_distinct() {
    const THREADS: usize = 2;
    const CYCLES: usize = 100_000;

    let arena = Arc::new(SyncArena::<u32, HeapSource>::new(1_000_000).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|worker| {
            let arena = Arc::clone(&arena);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let stamp_base = (worker as u64 + 1) << 32;
                barrier.wait();
                for cycle in 0..CYCLES {
                    let handle = arena.allocate(8).unwrap();
                    assert!(handle >= 1 && handle <= 1_000_000);
                    let slot = arena.element(handle) as *mut u64;
                    let stamp = stamp_base | cycle as u64;
                    unsafe {
                        slot.write(stamp);
                        // If another thread received the same slot, the
                        // stamp would have been clobbered.
                        assert_eq!(slot.read(), stamp);
                    }
                    arena.deallocate(handle, 8);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let arena = Arc::try_unwrap(arena).ok().unwrap();
    // At quiescence every slot ever handed out is back on the free list.
    assert_eq!(arena.free_list_len(), arena.used_capacity());
    // A pop that loses its CAS race can miss a slot another thread is
    // holding and fall back to fresh capacity, so the high-water mark can
    // drift a little above the thread count. It must stay tiny relative
    // to the cycle count.
    assert!(arena.used_capacity() <= 64);
}

#[test]
fn concurrent_batches_never_alias() {
    const THREADS: usize = 4;
    const BATCH: usize = 256;
    const ROUNDS: usize = 200;

    let arena = Arc::new(SyncArena::<u32, HeapSource>::new(THREADS * BATCH).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|worker| {
            let arena = Arc::clone(&arena);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut batch = Vec::with_capacity(BATCH);
                for round in 0..ROUNDS {
                    for _ in 0..BATCH {
                        batch.push(arena.allocate(16).unwrap());
                    }
                    let stamp = ((worker * ROUNDS + round) as u64) << 16;
                    for (position, &handle) in batch.iter().enumerate() {
                        unsafe {
                            (arena.element(handle) as *mut u64).write(stamp | position as u64)
                        };
                    }
                    // The whole batch is still intact: no other thread was
                    // handed any of these slots.
                    for (position, &handle) in batch.iter().enumerate() {
                        let read = unsafe { (arena.element(handle) as *const u64).read() };
                        assert_eq!(read, stamp | position as u64);
                    }
                    for handle in batch.drain(..) {
                        arena.deallocate(handle, 16);
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let arena = Arc::try_unwrap(arena).ok().unwrap();
    assert_eq!(arena.free_list_len(), arena.used_capacity());
}

#[test]
fn exhaustion_under_contention_is_clean() {
    const THREADS: usize = 4;
    const CAPACITY: usize = 64;

    let arena = Arc::new(SyncArena::<u32, HeapSource>::new(CAPACITY).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));
    let saw_oom = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let arena = Arc::clone(&arena);
            let barrier = Arc::clone(&barrier);
            let saw_oom = Arc::clone(&saw_oom);
            thread::spawn(move || {
                barrier.wait();
                let mut held = Vec::new();
                for _ in 0..CAPACITY {
                    match arena.allocate(8) {
                        Ok(handle) => held.push(handle),
                        Err(_) => {
                            saw_oom.store(true, Ordering::Relaxed);
                        }
                    }
                }
                held
            })
        })
        .collect();

    let total: usize = workers
        .into_iter()
        .map(|worker| {
            let held = worker.join().unwrap();
            let count = held.len();
            for handle in held {
                arena.deallocate(handle, 8);
            }
            count
        })
        .sum();

    // Exactly the capacity was handed out across all threads, no more.
    assert_eq!(total, CAPACITY);
    assert!(saw_oom.load(Ordering::Relaxed));
    let arena = Arc::try_unwrap(arena).ok().unwrap();
    assert_eq!(arena.used_capacity(), CAPACITY);
    assert_eq!(arena.free_list_len(), CAPACITY);
}

thread_local_arena_context! {
    struct WorkerStore for SyncArena<u32, HeapSource>
}

// The shared arena is identified per thread; the container object is a
// per-thread worker record, so its size is pinned here.
type WorkerConfig = UniversalConfig<WorkerStore, { std::mem::size_of::<WorkerRecord>() }, 4>;

#[repr(C)]
#[allow(dead_code)]
struct WorkerRecord {
    head: u32,
    count: u32,
}

#[test]
fn shared_arena_behind_per_thread_contexts() {
    const THREADS: usize = 4;
    const NODES: usize = 500;

    let arena = Arc::new(SyncArena::<u32, HeapSource>::new(THREADS * NODES).unwrap());
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let arena = Arc::clone(&arena);
            thread::spawn(move || {
                WorkerConfig::set_arena(Arc::as_ptr(&arena) as *mut _);
                WorkerConfig::set_stack_top(thread_stack_top().unwrap().as_ptr());

                let alloc: HandleAllocator<[u32; 4], WorkerConfig> =
                    HandleAllocator::with_arena(&*arena);
                let mut handles = Vec::with_capacity(NODES);
                for position in 0..NODES {
                    let handle = alloc.allocate().unwrap();
                    unsafe { handle.as_ptr().write([position as u32; 4]) };
                    handles.push(handle);
                }
                for (position, handle) in handles.into_iter().enumerate() {
                    assert_eq!(unsafe { *handle.as_ref() }, [position as u32; 4]);
                    alloc.deallocate(handle);
                }
                WorkerConfig::set_arena(std::ptr::null_mut());
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let arena = Arc::try_unwrap(arena).ok().unwrap();
    assert_eq!(arena.free_list_len(), arena.used_capacity());
}
