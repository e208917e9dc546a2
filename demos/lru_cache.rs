//! An LRU cache whose recency list links are 32-bit handles.
//!
//! The cache couples a `HashMap` index with an intrusive recency list:
//! each entry carries `prev`/`next` handles instead of pointers, and the
//! list's sentinel links are embedded in the cache object itself,
//! addressed through container-body handles. Entries live in a
//! `SyncArena`.

use std::collections::HashMap;
use std::mem;
use std::ptr::addr_of_mut;

use slog::{info, o, Drain, Logger};

use indexed_arena::{
    thread_local_arena_context, thread_stack_top, Handle, HandleAllocator, HandleConfig,
    HeapSource, SyncArena, UniversalConfig,
};

thread_local_arena_context! {
    struct CacheStore for SyncArena<u32, HeapSource>
}

type EntryHandle = Handle<Entry, CacheConfig>;

/// Only the embedded links need to be covered by the container test, and
/// they sit at the front of the cache object.
type CacheConfig = UniversalConfig<CacheStore, { mem::size_of::<Links>() }, 8>;

#[repr(C)]
struct Links {
    prev: EntryHandle,
    next: EntryHandle,
}

#[repr(C)]
struct Entry {
    links: Links,
    key: u64,
    value: u64,
}

/// `links` must stay the first field: the sentinel handle decodes to the
/// cache object itself and is only ever accessed through `Links`.
#[repr(C)]
struct LruCache {
    links: Links,
    index: HashMap<u64, EntryHandle>,
    alloc: HandleAllocator<Entry, CacheConfig>,
    capacity: usize,
    logger: Logger,
}

impl LruCache {
    /// The cache is boxed because container-body handles bake in its
    /// address; it must not move afterwards.
    fn create(arena: &SyncArena<u32, HeapSource>, capacity: usize, logger: Logger) -> Box<Self> {
        let mut cache = Box::new(LruCache {
            links: Links {
                prev: Handle::null(),
                next: Handle::null(),
            },
            index: HashMap::new(),
            alloc: HandleAllocator::with_arena(arena),
            capacity,
            logger,
        });
        CacheConfig::set_container(&*cache as *const LruCache as *mut u8);
        let sentinel = cache.sentinel();
        cache.links.prev = sentinel;
        cache.links.next = sentinel;
        cache
    }

    fn sentinel(&self) -> EntryHandle {
        Handle::from_raw(CacheConfig::index_of(&self.links as *const Links as *const u8))
    }

    fn links_of(handle: EntryHandle) -> *mut Links {
        // Entry and the sentinel both start with Links.
        handle.as_ptr() as *mut Links
    }

    fn unlink(&mut self, handle: EntryHandle) {
        unsafe {
            let links = read_links(Self::links_of(handle));
            (*Self::links_of(links.prev)).next = links.next;
            (*Self::links_of(links.next)).prev = links.prev;
        }
    }

    fn push_front(&mut self, handle: EntryHandle) {
        let sentinel = self.sentinel();
        let first = self.links.next;
        unsafe {
            let links = Self::links_of(handle);
            addr_of_mut!((*links).prev).write(sentinel);
            addr_of_mut!((*links).next).write(first);
            (*Self::links_of(first)).prev = handle;
        }
        self.links.next = handle;
    }

    fn get(&mut self, key: u64) -> Option<u64> {
        let handle = *self.index.get(&key)?;
        self.unlink(handle);
        self.push_front(handle);
        Some(unsafe { handle.as_ref() }.value)
    }

    fn insert(&mut self, key: u64, value: u64) {
        if let Some(&handle) = self.index.get(&key) {
            unsafe { (*handle.as_ptr()).value = value };
            self.unlink(handle);
            self.push_front(handle);
            return;
        }
        if self.index.len() == self.capacity {
            self.evict();
        }
        let handle = self.alloc.allocate().expect("arena sized to the capacity");
        unsafe {
            addr_of_mut!((*handle.as_ptr()).key).write(key);
            addr_of_mut!((*handle.as_ptr()).value).write(value);
        }
        self.push_front(handle);
        self.index.insert(key, handle);
    }

    fn evict(&mut self) {
        let last = self.links.prev;
        debug_assert!(last != self.sentinel(), "evicting from an empty cache");
        let key = unsafe { last.as_ref() }.key;
        info!(self.logger, "evicting"; "key" => key);
        self.unlink(last);
        self.index.remove(&key);
        self.alloc.deallocate(last);
    }
}

impl Drop for LruCache {
    fn drop(&mut self) {
        for (_, handle) in self.index.drain() {
            self.alloc.deallocate(handle);
        }
    }
}

unsafe fn read_links(links: *const Links) -> Links {
    Links {
        prev: (*links).prev,
        next: (*links).next,
    }
}

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let logger = Logger::root(
        slog_term::FullFormat::new(plain).build().fuse(),
        o!("demo" => "lru_cache"),
    );

    let arena = SyncArena::<u32, HeapSource>::with_logger(
        1024,
        true,
        HeapSource::new(),
        logger.new(o!("component" => "arena")),
    )
    .expect("capacity fits a u32 handle");

    CacheConfig::set_arena(&arena as *const _ as *mut _);
    CacheConfig::set_stack_top(
        thread_stack_top()
            .expect("stack probe supported on this platform")
            .as_ptr(),
    );

    {
        let mut cache = LruCache::create(&arena, 3, logger.new(o!("component" => "cache")));
        for key in 0..5 {
            cache.insert(key, key * 100);
        }
        // 0 and 1 were evicted, 2..5 remain.
        assert_eq!(cache.get(0), None);
        assert_eq!(cache.get(2), Some(200));
        // Touching 2 protected it; inserting evicts 3 next.
        cache.insert(9, 900);
        assert_eq!(cache.get(3), None);
        assert_eq!(cache.get(9), Some(900));
        info!(logger, "cache behaves"; "live_entries" => cache.index.len());
    }

    info!(
        logger, "arena after cache drop";
        "used_capacity" => arena.used_capacity(),
        "free" => arena.free_list_len(),
    );
    CacheConfig::set_arena(std::ptr::null_mut());
    CacheConfig::set_container(std::ptr::null_mut());
}
