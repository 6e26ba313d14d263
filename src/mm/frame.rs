//! Physical frame allocator.
//!
//! A binary buddy system over the boot memory map, split per memory
//! zone and per NUMA node. Each (node, zone) arena keeps one free list
//! per order 0..=10, address-sorted, plus per-frame metadata (state,
//! order, reference count) used for coalescing, copy-on-write sharing
//! and contract-violation detection.
//!
//! Out-of-memory is reported by returning `None`, never by aborting.
//! Double free, use-after-free and order mismatch are fatal in debug
//! builds; release builds log the violation and quarantine the
//! offending frames so they are never handed out again.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::{Mutex, RwLock};

use super::addr::{DirectMap, FrameNumber, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::hal::{Hal, NodeId};

/// Largest supported buddy order: runs of `2^10` frames (4 MiB).
pub const MAX_ORDER: u8 = 10;
const NUM_ORDERS: usize = MAX_ORDER as usize + 1;

/// Upper bound of the DMA zone.
pub const DMA_LIMIT: u64 = 16 * 1024 * 1024;
/// Upper bound of the DMA32 zone.
pub const DMA32_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

bitflags! {
    /// Allocation behavior flags.
    pub struct AllocFlags: u32 {
        /// Restrict the allocation to the DMA zone (below 16 MiB).
        const ZONE_DMA    = 1 << 0;
        /// Restrict the allocation to DMA32 or below (below 4 GiB).
        const ZONE_DMA32  = 1 << 1;
        /// Any zone, searched NORMAL, DMA32, DMA.
        const ZONE_NORMAL = 1 << 2;
        /// Zero-fill the run before returning it.
        const ZEROED      = 1 << 3;
        /// Never block or sleep; fail fast under pressure.
        const ATOMIC      = 1 << 4;
        /// Pressure may trigger the reclaim hook.
        const REFILL_OK   = 1 << 5;
    }
}

/// Physical memory zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// Below 16 MiB.
    Dma,
    /// Below 4 GiB.
    Dma32,
    /// Everything above 4 GiB.
    Normal,
    /// Device apertures; never allocatable.
    Device,
}

impl Zone {
    /// Zone containing a physical address (RAM zones only).
    pub fn classify(addr: PhysAddr) -> Zone {
        if addr.as_u64() < DMA_LIMIT {
            Zone::Dma
        } else if addr.as_u64() < DMA32_LIMIT {
            Zone::Dma32
        } else {
            Zone::Normal
        }
    }

    /// Zones searched for a request, widest first. A request is only
    /// ever satisfied from its own zone or a lower one.
    fn search_chain(flags: AllocFlags) -> &'static [Zone] {
        if flags.contains(AllocFlags::ZONE_DMA) {
            &[Zone::Dma]
        } else if flags.contains(AllocFlags::ZONE_DMA32) {
            &[Zone::Dma32, Zone::Dma]
        } else {
            &[Zone::Normal, Zone::Dma32, Zone::Dma]
        }
    }
}

/// Externally visible frame status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Free,
    Allocated,
    Reserved,
    Poisoned,
}

/// One entry in the boot memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: PhysAddr,
    pub len: u64,
    pub kind: RegionKind,
    pub node: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
    Device,
}

/// Hook invoked (at most once per allocation attempt) when an arena
/// chain comes up empty and the caller allows reclaim.
pub trait Reclaim: Send + Sync {
    /// Try to free memory useful for an allocation of `order` under
    /// `flags`; returns the number of frames recovered.
    fn reclaim(&self, order: u8, flags: AllocFlags) -> usize;
}

/// Per-frame bookkeeping. `order` is meaningful on run heads only.
#[derive(Clone, Copy)]
struct FrameInfo {
    state: FrameState,
    order: u8,
    refcount: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Head of a free run of `order`.
    Free,
    /// Interior frame of a free run.
    FreeTail,
    /// Head of an allocated run of `order`.
    Allocated,
    /// Interior frame of an allocated run.
    AllocatedTail,
    Poisoned,
}

/// A contiguous range of usable frames inside one arena.
struct Span {
    start: FrameNumber,
    frames: Vec<FrameInfo>,
}

impl Span {
    fn contains(&self, frame: FrameNumber) -> bool {
        frame >= self.start && (frame.as_u64() - self.start.as_u64()) < self.frames.len() as u64
    }

    fn info(&self, frame: FrameNumber) -> &FrameInfo {
        &self.frames[(frame.as_u64() - self.start.as_u64()) as usize]
    }

    fn info_mut(&mut self, frame: FrameNumber) -> &mut FrameInfo {
        &mut self.frames[(frame.as_u64() - self.start.as_u64()) as usize]
    }
}

/// Lock-protected interior of one (node, zone) arena.
struct ZoneArena {
    free_lists: [Vec<FrameNumber>; NUM_ORDERS],
    spans: Vec<Span>,
    total_frames: usize,
    allocated_frames: usize,
}

impl ZoneArena {
    fn new() -> Self {
        Self {
            free_lists: core::array::from_fn(|_| Vec::new()),
            spans: Vec::new(),
            total_frames: 0,
            allocated_frames: 0,
        }
    }

    fn span_of(&self, frame: FrameNumber) -> Option<usize> {
        self.spans.iter().position(|s| s.contains(frame))
    }

    /// Whether `frame..frame + 2^order` lies inside a single span.
    fn run_in_bounds(&self, frame: FrameNumber, order: u8) -> bool {
        match self.span_of(frame) {
            Some(idx) => self.spans[idx].contains(frame.offset((1u64 << order) - 1)),
            None => false,
        }
    }

    fn insert_free(&mut self, order: u8, frame: FrameNumber) {
        let list = &mut self.free_lists[order as usize];
        let pos = list.partition_point(|&f| f < frame);
        list.insert(pos, frame);
    }

    fn remove_free(&mut self, order: u8, frame: FrameNumber) -> bool {
        let list = &mut self.free_lists[order as usize];
        match list.binary_search(&frame) {
            Ok(pos) => {
                list.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Seed the arena with a frame range, carving it into maximal
    /// naturally aligned runs.
    fn add_range(&mut self, start: FrameNumber, count: u64) {
        let mut frames = Vec::with_capacity(count as usize);
        frames.resize(
            count as usize,
            FrameInfo { state: FrameState::FreeTail, order: 0, refcount: 0 },
        );
        self.spans.push(Span { start, frames });
        self.spans.sort_unstable_by_key(|s| s.start);
        self.total_frames += count as usize;

        let mut current = start;
        let end = start.offset(count);
        while current < end {
            let mut order = MAX_ORDER;
            while order > 0 {
                let size = 1u64 << order;
                if current.is_aligned_to_order(order) && current.as_u64() + size <= end.as_u64() {
                    break;
                }
                order -= 1;
            }
            self.mark_free_run(current, order);
            self.insert_free(order, current);
            current = current.offset(1 << order);
        }
    }

    fn mark_free_run(&mut self, head: FrameNumber, order: u8) {
        let idx = self.span_of(head).expect("frame outside arena spans");
        let span = &mut self.spans[idx];
        for i in 0..(1u64 << order) {
            let info = span.info_mut(head.offset(i));
            *info = FrameInfo {
                state: if i == 0 { FrameState::Free } else { FrameState::FreeTail },
                order: if i == 0 { order } else { 0 },
                refcount: 0,
            };
        }
    }

    fn mark_allocated_run(&mut self, head: FrameNumber, order: u8) {
        let idx = self.span_of(head).expect("frame outside arena spans");
        let span = &mut self.spans[idx];
        for i in 0..(1u64 << order) {
            let info = span.info_mut(head.offset(i));
            *info = FrameInfo {
                state: if i == 0 { FrameState::Allocated } else { FrameState::AllocatedTail },
                order: if i == 0 { order } else { 0 },
                refcount: if i == 0 { 1 } else { 0 },
            };
        }
    }

    /// Pop a run of `order`, splitting a larger one if necessary.
    fn take(&mut self, order: u8) -> Option<FrameNumber> {
        let mut found = None;
        for j in order..=MAX_ORDER {
            if let Some(frame) = self.free_lists[j as usize].pop() {
                found = Some((frame, j));
                break;
            }
        }
        let (frame, mut have) = found?;

        // Split down, returning each unused upper half to its list.
        while have > order {
            have -= 1;
            let buddy = frame.offset(1 << have);
            self.mark_free_run(buddy, have);
            self.insert_free(have, buddy);
        }

        self.mark_allocated_run(frame, order);
        self.allocated_frames += 1 << order;
        Some(frame)
    }

    /// Return a run to the free lists, coalescing upward as far as the
    /// buddies allow.
    fn give_back(&mut self, frame: FrameNumber, order: u8) {
        let mut head = frame;
        let mut order = order;
        self.allocated_frames -= 1 << order;

        while order < MAX_ORDER {
            let buddy = head.buddy(order);
            if !self.run_in_bounds(buddy, order) {
                break;
            }
            let buddy_free = {
                let idx = self.span_of(buddy).unwrap();
                let info = self.spans[idx].info(buddy);
                info.state == FrameState::Free && info.order == order
            };
            if !buddy_free || !self.remove_free(order, buddy) {
                break;
            }
            head = if head < buddy { head } else { buddy };
            order += 1;
        }

        self.mark_free_run(head, order);
        self.insert_free(order, head);
    }
}

/// One (node, zone) arena with its spinlock and immutable range index.
struct Arena {
    node: NodeId,
    zone: Zone,
    /// (start, count) pairs, fixed after construction, so frames can be
    /// routed to an arena without taking its lock.
    ranges: Vec<(FrameNumber, u64)>,
    inner: Mutex<ZoneArena>,
}

impl Arena {
    fn contains(&self, frame: FrameNumber) -> bool {
        self.ranges
            .iter()
            .any(|&(start, count)| frame >= start && frame.as_u64() - start.as_u64() < count)
    }
}

/// Per-zone usage snapshot.
#[derive(Debug, Clone)]
pub struct ZoneStats {
    pub node: NodeId,
    pub zone: Zone,
    pub total_frames: usize,
    pub allocated_frames: usize,
    pub free_by_order: [usize; NUM_ORDERS],
}

impl ZoneStats {
    pub fn free_frames(&self) -> usize {
        self.total_frames - self.allocated_frames
    }

    pub fn free_bytes(&self) -> usize {
        self.free_frames() * PAGE_SIZE
    }
}

/// The physical memory manager. Owns every usable frame in the system.
pub struct FrameAllocator {
    hal: Arc<dyn Hal>,
    dmap: DirectMap,
    arenas: Vec<Arena>,
    nodes: Vec<NodeId>,
    reclaim: RwLock<Option<Arc<dyn Reclaim>>>,
}

impl FrameAllocator {
    /// Build the allocator from the boot memory map. Regions are split
    /// at zone boundaries; reserved and device regions are left alone.
    pub fn new(hal: Arc<dyn Hal>, dmap: DirectMap, memory_map: &[MemoryRegion]) -> Self {
        let mut allocator = Self {
            hal,
            dmap,
            arenas: Vec::new(),
            nodes: Vec::new(),
            reclaim: RwLock::new(None),
        };

        for region in memory_map.iter().filter(|r| r.kind == RegionKind::Usable) {
            let start = super::addr::align_up(region.start.as_usize(), PAGE_SIZE) as u64;
            let end =
                super::addr::align_down((region.start.as_u64() + region.len) as usize, PAGE_SIZE)
                    as u64;
            let mut current = start;
            while current < end {
                let zone = Zone::classify(PhysAddr::new(current));
                let zone_end = match zone {
                    Zone::Dma => DMA_LIMIT.min(end),
                    Zone::Dma32 => DMA32_LIMIT.min(end),
                    _ => end,
                };
                let first = FrameNumber::new(current >> super::addr::PAGE_SHIFT);
                let count = (zone_end - current) >> super::addr::PAGE_SHIFT;
                if count > 0 {
                    allocator.seed_arena(region.node, zone, first, count);
                }
                current = zone_end;
            }
        }

        allocator.nodes.sort_unstable();
        allocator.nodes.dedup();
        log::info!(
            target: "frame",
            "frame allocator ready: {} arenas across {} nodes",
            allocator.arenas.len(),
            allocator.nodes.len()
        );
        allocator
    }

    fn seed_arena(&mut self, node: NodeId, zone: Zone, start: FrameNumber, count: u64) {
        if !self.nodes.contains(&node) {
            self.nodes.push(node);
        }
        let arena = match self.arenas.iter_mut().find(|a| a.node == node && a.zone == zone) {
            Some(arena) => arena,
            None => {
                self.arenas.push(Arena {
                    node,
                    zone,
                    ranges: Vec::new(),
                    inner: Mutex::new(ZoneArena::new()),
                });
                self.arenas.last_mut().unwrap()
            }
        };
        arena.ranges.push((start, count));
        arena.inner.lock().add_range(start, count);
    }

    /// Install the memory-pressure reclaim hook.
    pub fn set_reclaim_hook(&self, hook: Arc<dyn Reclaim>) {
        *self.reclaim.write() = Some(hook);
    }

    /// The direct-map window this allocator was built with.
    pub fn direct_map(&self) -> DirectMap {
        self.dmap
    }

    /// Allocate `2^order` contiguous frames aligned to the run size.
    ///
    /// Returns the first frame of the run, or `None` under pressure the
    /// caller's flags do not allow resolving.
    pub fn alloc_frames(&self, order: u8, flags: AllocFlags, node: NodeId) -> Option<FrameNumber> {
        if order > MAX_ORDER {
            log::warn!(target: "frame", "allocation order {} out of range", order);
            return None;
        }

        if let Some(frame) = self.try_alloc(order, flags, node) {
            if flags.contains(AllocFlags::ZEROED) {
                self.dmap.zero_frames(frame, 1 << order);
            }
            return Some(frame);
        }

        // One reclaim attempt per allocation, then one retry.
        if flags.contains(AllocFlags::REFILL_OK) && !flags.contains(AllocFlags::ATOMIC) {
            let recovered = match self.reclaim.read().as_ref() {
                Some(hook) => hook.reclaim(order, flags),
                None => 0,
            };
            if recovered > 0 {
                if let Some(frame) = self.try_alloc(order, flags, node) {
                    if flags.contains(AllocFlags::ZEROED) {
                        self.dmap.zero_frames(frame, 1 << order);
                    }
                    return Some(frame);
                }
            }
        }

        log::debug!(target: "frame", "order {} allocation failed (flags {:?})", order, flags);
        None
    }

    fn try_alloc(&self, order: u8, flags: AllocFlags, node: NodeId) -> Option<FrameNumber> {
        // Atomic callers may be in interrupt context; the zone lock is
        // then taken with local interrupts off.
        let irq = flags.contains(AllocFlags::ATOMIC).then(|| self.hal.irq_save());
        let chain = Zone::search_chain(flags);
        let mut found = None;
        'search: for candidate in self.node_order(node) {
            for &zone in chain {
                let arena = self
                    .arenas
                    .iter()
                    .find(|a| a.node == candidate && a.zone == zone);
                if let Some(arena) = arena {
                    if let Some(frame) = arena.inner.lock().take(order) {
                        found = Some(frame);
                        break 'search;
                    }
                }
            }
        }
        if let Some(irq) = irq {
            self.hal.irq_restore(irq);
        }
        found
    }

    /// Nodes to try, preferred node first, then ascending distance with
    /// ties broken by node id.
    fn node_order(&self, preferred: NodeId) -> Vec<NodeId> {
        let mut nodes = self.nodes.clone();
        nodes.sort_unstable_by_key(|&n| {
            if n == preferred {
                (0, n)
            } else {
                (1 + self.hal.node_distance(preferred, n), n)
            }
        });
        nodes
    }

    /// Return a run previously obtained from [`Self::alloc_frames`].
    ///
    /// Freeing a frame that is not the head of an allocation of
    /// `order`, or that is not currently allocated, is a contract
    /// violation: fatal in debug builds, quarantined in release builds.
    pub fn free_frames(&self, frame: FrameNumber, order: u8) {
        if order > MAX_ORDER {
            self.violation(frame, "free with out-of-range order");
            return;
        }
        let arena = match self.arena_of(frame) {
            Some(arena) => arena,
            None => {
                self.violation(frame, "free of frame outside managed memory");
                return;
            }
        };

        let mut inner = arena.inner.lock();
        let idx = match inner.span_of(frame) {
            Some(idx) => idx,
            None => {
                drop(inner);
                self.violation(frame, "free of frame outside managed memory");
                return;
            }
        };
        let info = *inner.spans[idx].info(frame);
        if info.state != FrameState::Allocated || info.order != order {
            // Quarantine in release: the run never re-enters a free list.
            let head_known = info.state == FrameState::Allocated;
            let span = &mut inner.spans[idx];
            let count = if head_known { 1u64 << info.order } else { 1 };
            for i in 0..count {
                let slot = frame.offset(i);
                if span.contains(slot) {
                    span.info_mut(slot).state = FrameState::Poisoned;
                }
            }
            drop(inner);
            self.violation(frame, "double free or order mismatch");
            return;
        }
        if info.refcount > 1 {
            drop(inner);
            self.violation(frame, "free of frame with live references");
            return;
        }

        inner.give_back(frame, order);
    }

    /// Bump the reference count of an allocated frame (COW sharing).
    pub fn inc_ref(&self, frame: FrameNumber) {
        if let Some(arena) = self.arena_of(frame) {
            let mut inner = arena.inner.lock();
            if let Some(idx) = inner.span_of(frame) {
                let info = inner.spans[idx].info_mut(frame);
                if info.state == FrameState::Allocated {
                    info.refcount += 1;
                    return;
                }
            }
        }
        self.violation(frame, "refcount increment on non-allocated frame");
    }

    /// Drop one reference; frees the frame when the count reaches zero.
    /// Returns `true` if the frame was released to the buddy system.
    pub fn dec_ref(&self, frame: FrameNumber) -> bool {
        let arena = match self.arena_of(frame) {
            Some(arena) => arena,
            None => {
                self.violation(frame, "refcount decrement on unmanaged frame");
                return false;
            }
        };
        let mut inner = arena.inner.lock();
        let idx = match inner.span_of(frame) {
            Some(idx) => idx,
            None => return false,
        };
        let (order, release) = {
            let info = inner.spans[idx].info_mut(frame);
            if info.state != FrameState::Allocated || info.refcount == 0 {
                drop(inner);
                self.violation(frame, "refcount decrement on non-allocated frame");
                return false;
            }
            info.refcount -= 1;
            (info.order, info.refcount == 0)
        };
        if release {
            inner.give_back(frame, order);
        }
        release
    }

    /// Current reference count of an allocated frame head.
    pub fn ref_count(&self, frame: FrameNumber) -> u32 {
        self.with_info(frame, |info| info.refcount).unwrap_or(0)
    }

    /// Externally visible state of one frame.
    pub fn frame_status(&self, frame: FrameNumber) -> Option<FrameStatus> {
        self.with_info(frame, |info| match info.state {
            FrameState::Free | FrameState::FreeTail => FrameStatus::Free,
            FrameState::Allocated | FrameState::AllocatedTail => FrameStatus::Allocated,
            FrameState::Poisoned => FrameStatus::Poisoned,
        })
    }

    fn with_info<T>(&self, frame: FrameNumber, f: impl FnOnce(&FrameInfo) -> T) -> Option<T> {
        let arena = self.arena_of(frame)?;
        let inner = arena.inner.lock();
        let idx = inner.span_of(frame)?;
        Some(f(inner.spans[idx].info(frame)))
    }

    fn arena_of(&self, frame: FrameNumber) -> Option<&Arena> {
        self.arenas.iter().find(|a| a.contains(frame))
    }

    /// Kernel virtual address of a frame through the direct map.
    pub fn frame_to_addr(&self, frame: FrameNumber) -> VirtAddr {
        self.dmap.virt(frame.addr())
    }

    /// Frame containing a direct-mapped kernel virtual address.
    pub fn addr_to_frame(&self, vaddr: VirtAddr) -> FrameNumber {
        self.dmap.phys(vaddr).frame()
    }

    /// Usage snapshot across all arenas.
    pub fn zone_stats(&self) -> Vec<ZoneStats> {
        self.arenas
            .iter()
            .map(|arena| {
                let inner = arena.inner.lock();
                let mut free_by_order = [0usize; NUM_ORDERS];
                for (order, list) in inner.free_lists.iter().enumerate() {
                    free_by_order[order] = list.len();
                }
                ZoneStats {
                    node: arena.node,
                    zone: arena.zone,
                    total_frames: inner.total_frames,
                    allocated_frames: inner.allocated_frames,
                    free_by_order,
                }
            })
            .collect()
    }

    #[track_caller]
    fn violation(&self, frame: FrameNumber, what: &str) {
        #[cfg(debug_assertions)]
        panic!("frame allocator contract violation: {} ({:?})", what, frame);
        #[cfg(not(debug_assertions))]
        log::error!(target: "frame", "contract violation: {} ({:?}); frame quarantined", what, frame);
    }
}
