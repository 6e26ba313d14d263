//! Slab object caches and the general-purpose `kmalloc` pool.
//!
//! A cache owns slabs of `2^order` contiguous frames from the frame
//! allocator, carved into fixed-size objects. Free objects are chained
//! through a pointer embedded in the first eight bytes of the object
//! payload; a slab migrates between the cache's `full`, `partial` and
//! `empty` lists as its in-use count crosses the boundaries.
//!
//! Debug aids are opt-in per cache: poisoning of freed objects, red
//! zones around each payload, and allocation-site tracking.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use super::addr::{align_up, FrameNumber, VirtAddr, PAGE_SIZE};
use super::frame::{AllocFlags, FrameAllocator, MAX_ORDER};

/// Cache-line size objects are padded to under `HWCACHE_ALIGN`.
pub const CACHE_LINE: usize = 64;

/// Byte written over freed payloads when poisoning is enabled.
pub const POISON_BYTE: u8 = 0xA5;
/// Byte pattern of the guard ranges around each payload.
pub const RED_ZONE_BYTE: u8 = 0xBB;

bitflags! {
    /// Per-cache behavior flags.
    pub struct CacheFlags: u32 {
        /// Align objects to a cache-line boundary.
        const HWCACHE_ALIGN = 1 << 0;
        /// Fill freed objects with [`POISON_BYTE`].
        const POISON        = 1 << 1;
        /// Guard bytes before and after every object.
        const RED_ZONE      = 1 << 2;
        /// Record the allocation site of every live object.
        const TRACK_CALLER  = 1 << 3;
    }
}

/// Object constructor run on every allocation before the pointer is
/// handed out.
pub type Ctor = fn(*mut u8);

/// One slab: a naturally aligned run of frames carved into objects.
struct Slab {
    head: FrameNumber,
    base: u64,
    /// Payload address of the first free object; 0 when full.
    free_head: u64,
    in_use: u32,
}

struct CacheInner {
    slabs: Vec<Slab>,
    /// Slab base address -> slab index, for pointer resolution.
    by_base: BTreeMap<u64, usize>,
    partial: Vec<usize>,
    full: Vec<usize>,
    empty: Vec<usize>,
    allocs: u64,
    frees: u64,
    sites: BTreeMap<u64, &'static core::panic::Location<'static>>,
}

/// Usage snapshot for one cache.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub name: &'static str,
    pub object_size: usize,
    pub objects_per_slab: usize,
    pub slabs: usize,
    pub in_use: usize,
    pub allocs: u64,
    pub frees: u64,
}

/// A named allocator for one fixed object size and alignment.
pub struct SlabCache {
    name: &'static str,
    object_size: usize,
    align: usize,
    red: usize,
    stride: usize,
    slab_order: u8,
    objects_per_slab: usize,
    flags: CacheFlags,
    ctor: Option<Ctor>,
    frames: Arc<FrameAllocator>,
    inner: Mutex<CacheInner>,
}

impl SlabCache {
    /// Construct a cache. `align` must be a power of two no larger than
    /// a page; it is raised to the freelist-pointer minimum (8) and to
    /// the cache line under [`CacheFlags::HWCACHE_ALIGN`].
    pub fn new(
        name: &'static str,
        size: usize,
        align: usize,
        flags: CacheFlags,
        ctor: Option<Ctor>,
        frames: Arc<FrameAllocator>,
    ) -> Arc<SlabCache> {
        assert!(size > 0 && align.is_power_of_two() && align <= PAGE_SIZE);
        let mut align = align.max(8);
        if flags.contains(CacheFlags::HWCACHE_ALIGN) {
            align = align.max(CACHE_LINE);
        }
        // The guard regions keep payloads aligned by being `align` wide.
        let red = if flags.contains(CacheFlags::RED_ZONE) { align } else { 0 };
        let stride = red + align_up(size.max(8), align) + red;

        // Smallest run giving a reasonable object count per slab.
        let mut slab_order: u8 = 0;
        while slab_order < MAX_ORDER && (PAGE_SIZE << slab_order) / stride < 4 {
            slab_order += 1;
        }
        let objects_per_slab = (PAGE_SIZE << slab_order) / stride;
        assert!(objects_per_slab > 0, "object too large for the largest slab");

        log::debug!(
            target: "slab",
            "cache {}: size {} stride {} order {} ({} objects/slab)",
            name, size, stride, slab_order, objects_per_slab
        );

        Arc::new(SlabCache {
            name,
            object_size: size,
            align,
            red,
            stride,
            slab_order,
            objects_per_slab,
            flags,
            ctor,
            frames,
            inner: Mutex::new(CacheInner {
                slabs: Vec::new(),
                by_base: BTreeMap::new(),
                partial: Vec::new(),
                full: Vec::new(),
                empty: Vec::new(),
                allocs: 0,
                frees: 0,
                sites: BTreeMap::new(),
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Allocate one object. Returns its payload address, aligned to the
    /// cache's alignment. `ZEROED` zero-fills (overriding poison
    /// residue); `ATOMIC` forbids blocking in the frame layer.
    #[track_caller]
    pub fn alloc(&self, flags: AllocFlags) -> Option<VirtAddr> {
        let caller = core::panic::Location::caller();
        let mut inner = self.inner.lock();
        loop {
            let slab_idx = if let Some(&idx) = inner.partial.last() {
                Some(idx)
            } else if let Some(idx) = inner.empty.pop() {
                inner.partial.push(idx);
                Some(idx)
            } else {
                None
            };

            if let Some(idx) = slab_idx {
                let obj = self.pop_object(&mut inner, idx);
                inner.allocs += 1;
                if self.flags.contains(CacheFlags::TRACK_CALLER) {
                    inner.sites.insert(obj, caller);
                }
                drop(inner);
                let ptr = obj as *mut u8;
                if flags.contains(AllocFlags::ZEROED) {
                    unsafe { core::ptr::write_bytes(ptr, 0, self.object_size) };
                }
                if let Some(ctor) = self.ctor {
                    ctor(ptr);
                }
                return Some(VirtAddr::new(obj));
            }

            // No partial or empty slab: grow. The cache lock is dropped
            // across the frame-allocator call (C2 -> C1 is the only
            // permitted lock direction).
            drop(inner);
            let head = self.frames.alloc_frames(self.slab_order, flags & AllocFlags::ATOMIC, 0)?;
            inner = self.inner.lock();
            let idx = self.build_slab(&mut inner, head);
            inner.partial.push(idx);
        }
    }

    /// Return an object to the cache.
    pub fn free(&self, obj: VirtAddr) {
        let va = obj.as_u64();
        let span = (PAGE_SIZE << self.slab_order) as u64;
        let base = va & !(span - 1);

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let idx = match inner.by_base.get(&base) {
            Some(&idx) => idx,
            None => {
                drop(guard);
                self.violation(obj, "free of pointer outside this cache");
                return;
            }
        };
        let offset = va - base;
        if offset < self.red as u64 || (offset - self.red as u64) % self.stride as u64 != 0 {
            drop(guard);
            self.violation(obj, "free of misaligned object pointer");
            return;
        }
        #[cfg(debug_assertions)]
        {
            // Walk the freelist; the object must not already be on it.
            let mut cursor = inner.slabs[idx].free_head;
            while cursor != 0 {
                if cursor == va {
                    drop(guard);
                    self.violation(obj, "double free");
                    return;
                }
                cursor = unsafe { core::ptr::read(cursor as *const u64) };
            }
        }
        if self.red != 0 {
            self.check_red_zones(va);
        }

        if self.flags.contains(CacheFlags::POISON) {
            unsafe {
                core::ptr::write_bytes(va as *mut u8, POISON_BYTE, self.payload_len());
            }
        }
        if self.flags.contains(CacheFlags::TRACK_CALLER) {
            inner.sites.remove(&va);
        }

        let slab = &mut inner.slabs[idx];
        unsafe { core::ptr::write(va as *mut u64, slab.free_head) };
        slab.free_head = va;
        let was_full = slab.in_use as usize == self.objects_per_slab;
        slab.in_use -= 1;
        let now_empty = slab.in_use == 0;
        inner.frees += 1;

        if was_full {
            Self::move_between(&mut inner.full, &mut inner.partial, idx);
        }
        if now_empty {
            Self::move_between(&mut inner.partial, &mut inner.empty, idx);
        }
    }

    /// Whether `obj` points into a slab belonging to this cache.
    pub fn owns(&self, obj: VirtAddr) -> bool {
        let span = (PAGE_SIZE << self.slab_order) as u64;
        let base = obj.as_u64() & !(span - 1);
        self.inner.lock().by_base.contains_key(&base)
    }

    /// Allocation site of a live object under `TRACK_CALLER`.
    pub fn allocation_site(&self, obj: VirtAddr) -> Option<&'static core::panic::Location<'static>> {
        self.inner.lock().sites.get(&obj.as_u64()).copied()
    }

    /// Release the frames of empty slabs back to the frame allocator,
    /// keeping the cache warm: empties are only trimmed while at least
    /// one partial slab remains.
    pub fn trim(&self) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.partial.is_empty() {
            return 0;
        }
        let empties: Vec<usize> = core::mem::take(&mut inner.empty);
        let mut released = Vec::new();
        for idx in empties {
            let slab = &mut inner.slabs[idx];
            let head = slab.head;
            let base = slab.base;
            // The arena slot stays occupied but orphaned; slab indices
            // stay stable for the lists that reference them.
            slab.free_head = 0;
            slab.base = 0;
            inner.by_base.remove(&base);
            released.push(head);
        }
        drop(guard);
        let count = released.len();
        for head in released {
            self.frames.free_frames(head, self.slab_order);
        }
        count
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            name: self.name,
            object_size: self.object_size,
            objects_per_slab: self.objects_per_slab,
            slabs: inner.by_base.len(),
            in_use: inner
                .slabs
                .iter()
                .map(|s| if s.base != 0 { s.in_use as usize } else { 0 })
                .sum(),
            allocs: inner.allocs,
            frees: inner.frees,
        }
    }

    fn payload_len(&self) -> usize {
        self.stride - 2 * self.red
    }

    fn pop_object(&self, inner: &mut CacheInner, idx: usize) -> u64 {
        let slab = &mut inner.slabs[idx];
        let obj = slab.free_head;
        debug_assert_ne!(obj, 0, "partial slab with empty freelist");
        slab.free_head = unsafe { core::ptr::read(obj as *const u64) };
        slab.in_use += 1;
        if slab.free_head == 0 {
            Self::move_between(&mut inner.partial, &mut inner.full, idx);
        }
        obj
    }

    fn build_slab(&self, inner: &mut CacheInner, head: FrameNumber) -> usize {
        let base = self.frames.frame_to_addr(head).as_u64();
        let mut free_head = 0u64;
        // Chain objects back-to-front so the freelist walks forward.
        for i in (0..self.objects_per_slab).rev() {
            let obj = base + (i * self.stride + self.red) as u64;
            if self.red != 0 {
                unsafe {
                    core::ptr::write_bytes(
                        (obj - self.red as u64) as *mut u8,
                        RED_ZONE_BYTE,
                        self.red,
                    );
                    core::ptr::write_bytes(
                        (obj + self.payload_len() as u64) as *mut u8,
                        RED_ZONE_BYTE,
                        self.red,
                    );
                }
            }
            if self.flags.contains(CacheFlags::POISON) {
                unsafe {
                    core::ptr::write_bytes(obj as *mut u8, POISON_BYTE, self.payload_len());
                }
            }
            unsafe { core::ptr::write(obj as *mut u64, free_head) };
            free_head = obj;
        }
        let idx = inner.slabs.len();
        inner.slabs.push(Slab { head, base, free_head, in_use: 0 });
        inner.by_base.insert(base, idx);
        idx
    }

    fn check_red_zones(&self, obj: u64) {
        let before = (obj - self.red as u64) as *const u8;
        let after = (obj + self.payload_len() as u64) as *const u8;
        for i in 0..self.red {
            let ok = unsafe { *before.add(i) == RED_ZONE_BYTE && *after.add(i) == RED_ZONE_BYTE };
            if !ok {
                self.violation(VirtAddr::new(obj), "red zone damaged");
                return;
            }
        }
    }

    fn move_between(from: &mut Vec<usize>, to: &mut Vec<usize>, idx: usize) {
        if let Some(pos) = from.iter().position(|&i| i == idx) {
            from.swap_remove(pos);
        }
        to.push(idx);
    }

    #[track_caller]
    fn violation(&self, obj: VirtAddr, what: &str) {
        #[cfg(debug_assertions)]
        panic!("slab cache {}: {} ({:?})", self.name, what, obj);
        #[cfg(not(debug_assertions))]
        log::error!(target: "slab", "cache {}: {} ({:?})", self.name, what, obj);
    }
}

/// Fixed `kmalloc` size classes. Requests above the largest class go
/// straight to the frame allocator.
pub const KMALLOC_CLASSES: [usize; 13] =
    [8, 16, 32, 64, 96, 128, 192, 256, 512, 1024, 2048, 4096, 8192];

/// The general-purpose allocator: one slab cache per size class plus a
/// ledger of direct frame-allocator allocations.
pub struct KmallocPool {
    caches: Vec<Arc<SlabCache>>,
    large: Mutex<BTreeMap<u64, u8>>,
    frames: Arc<FrameAllocator>,
}

impl KmallocPool {
    pub fn new(frames: Arc<FrameAllocator>) -> Arc<KmallocPool> {
        static CLASS_NAMES: [&str; 13] = [
            "kmalloc-8", "kmalloc-16", "kmalloc-32", "kmalloc-64", "kmalloc-96", "kmalloc-128",
            "kmalloc-192", "kmalloc-256", "kmalloc-512", "kmalloc-1024", "kmalloc-2048",
            "kmalloc-4096", "kmalloc-8192",
        ];
        let caches = KMALLOC_CLASSES
            .iter()
            .zip(CLASS_NAMES.iter())
            .map(|(&size, &name)| {
                SlabCache::new(name, size, 8, CacheFlags::empty(), None, frames.clone())
            })
            .collect();
        Arc::new(KmallocPool { caches, large: Mutex::new(BTreeMap::new()), frames })
    }

    /// Allocate `size` bytes.
    pub fn kmalloc(&self, size: usize, flags: AllocFlags) -> Option<VirtAddr> {
        if size == 0 {
            return None;
        }
        if let Some(idx) = KMALLOC_CLASSES.iter().position(|&c| c >= size) {
            return self.caches[idx].alloc(flags);
        }
        // Large allocation: straight to the buddy system.
        let pages = size.div_ceil(PAGE_SIZE);
        let order = pages.next_power_of_two().trailing_zeros() as u8;
        if order > MAX_ORDER {
            return None;
        }
        let head = self.frames.alloc_frames(order, flags, 0)?;
        let vaddr = self.frames.frame_to_addr(head);
        self.large.lock().insert(vaddr.as_u64(), order);
        Some(vaddr)
    }

    /// Release a pointer returned by [`Self::kmalloc`].
    pub fn kfree(&self, ptr: VirtAddr) {
        if let Some(order) = self.large.lock().remove(&ptr.as_u64()) {
            self.frames.free_frames(self.frames.addr_to_frame(ptr), order);
            return;
        }
        for cache in &self.caches {
            if cache.owns(ptr) {
                cache.free(ptr);
                return;
            }
        }
        #[cfg(debug_assertions)]
        panic!("kfree of unknown pointer {:?}", ptr);
        #[cfg(not(debug_assertions))]
        log::error!(target: "slab", "kfree of unknown pointer {:?}", ptr);
    }

    pub fn cache_stats(&self) -> Vec<CacheStats> {
        self.caches.iter().map(|c| c.stats()).collect()
    }
}
