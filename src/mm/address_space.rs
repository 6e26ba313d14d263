//! Address spaces, virtual memory areas and the page-fault path.
//!
//! An address space owns a page-table hierarchy and an ordered set of
//! VMAs kept in an arena addressed by typed ids, with a `BTreeMap` from
//! start address for range queries. The kernel address space maps the
//! upper half; user spaces share those root entries by reference.
//!
//! Demand paging: `mmap` only records the VMA. The first touch faults,
//! and the handler installs a zeroed frame (anonymous) or reads from
//! the backing object (file-backed). Fork write-protects private
//! writable mappings in parent and child and tags them copy-on-write;
//! the write fault later restores write access on a private copy.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use super::addr::{VirtAddr, PAGE_SIZE, USER_SPACE_END};
use super::addr::FrameNumber;
use super::frame::{AllocFlags, FrameAllocator};
use super::page_table::{PageTables, Pte, PteFlags};
use crate::error::{KernelError, KernelResult};
use crate::hal::Hal;

bitflags! {
    /// VMA protection mask.
    pub struct Protection: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        const USER  = 1 << 3;
    }
}

bitflags! {
    /// VMA kind and sharing flags.
    pub struct VmaFlags: u32 {
        const PRIVATE   = 1 << 0;
        const SHARED    = 1 << 1;
        /// At least one page in the area is write-protected for COW.
        const COW       = 1 << 2;
        const ANONYMOUS = 1 << 3;
        const FILE      = 1 << 4;
    }
}

bitflags! {
    /// `mmap` placement flags.
    pub struct MapFlags: u32 {
        /// The hint is a demand, not a suggestion.
        const FIXED = 1 << 0;
    }
}

/// Fault classification delivered by the trap layer.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// The faulting access was a write.
    pub write: bool,
    /// The access came from user mode.
    pub user: bool,
    /// The translation was present (protection violation).
    pub present: bool,
}

/// Backing store for file-backed VMAs.
pub trait VmObject: Send + Sync {
    /// Total length in bytes.
    fn len(&self) -> u64;

    /// Fill `dst` (one page) from `offset` within the object.
    fn read_page(&self, offset: u64, dst: &mut [u8]) -> KernelResult<()>;
}

/// Typed index of a VMA inside its address space's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmaId(u32);

/// A half-open mapped range `[start, end)` with uniform protection.
#[derive(Clone)]
pub struct Vma {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub prot: Protection,
    pub flags: VmaFlags,
    pub backing: Option<Arc<dyn VmObject>>,
    /// Offset into the backing object of `start`.
    pub offset: u64,
}

impl Vma {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    fn same_backing(&self, other: &Vma) -> bool {
        match (&self.backing, &other.backing) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Layout landmarks of a user address space.
#[derive(Debug, Clone, Copy)]
pub struct SpaceLayout {
    pub code_base: VirtAddr,
    pub data_base: VirtAddr,
    pub heap_base: VirtAddr,
    pub mmap_base: VirtAddr,
    pub mmap_limit: VirtAddr,
    pub stack_top: VirtAddr,
}

impl Default for SpaceLayout {
    fn default() -> Self {
        Self {
            code_base: VirtAddr::new(0x0000_0000_0040_0000),
            data_base: VirtAddr::new(0x0000_0000_6000_0000),
            heap_base: VirtAddr::new(0x0000_1000_0000_0000),
            mmap_base: VirtAddr::new(0x0000_2AAA_0000_0000),
            mmap_limit: VirtAddr::new(0x0000_7F00_0000_0000),
            stack_top: VirtAddr::new(0x0000_7FFF_FFFF_F000),
        }
    }
}

/// Memory-management tunables.
#[derive(Debug, Clone, Copy)]
pub struct MmConfig {
    /// Bits of mmap placement entropy (0 disables ASLR).
    pub aslr_entropy_bits: u8,
    /// Whether `map` may install 2 MiB leaves for aligned stretches.
    pub allow_huge_pages: bool,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self { aslr_entropy_bits: 16, allow_huge_pages: true }
    }
}

struct VmaArena {
    slots: Vec<Option<Vma>>,
    free: Vec<u32>,
}

impl VmaArena {
    fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    fn insert(&mut self, vma: Vma) -> VmaId {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(vma);
                VmaId(idx)
            }
            None => {
                self.slots.push(Some(vma));
                VmaId(self.slots.len() as u32 - 1)
            }
        }
    }

    fn remove(&mut self, id: VmaId) -> Option<Vma> {
        let vma = self.slots.get_mut(id.0 as usize)?.take();
        if vma.is_some() {
            self.free.push(id.0);
        }
        vma
    }

    fn get(&self, id: VmaId) -> Option<&Vma> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    fn get_mut(&mut self, id: VmaId) -> Option<&mut Vma> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }
}

struct SpaceInner {
    arena: VmaArena,
    by_start: BTreeMap<u64, VmaId>,
    layout: SpaceLayout,
    mmap_hint: VirtAddr,
    rng_state: u64,
}

impl SpaceInner {
    fn vma_at(&self, addr: VirtAddr) -> Option<VmaId> {
        let (_, &id) = self.by_start.range(..=addr.as_u64()).next_back()?;
        let vma = self.arena.get(id)?;
        vma.contains(addr).then_some(id)
    }

    fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        // The candidate intersects a predecessor running past `start`
        // or any area starting inside the range.
        if let Some((_, &id)) = self.by_start.range(..start.as_u64()).next_back() {
            if let Some(vma) = self.arena.get(id) {
                if vma.end > start {
                    return true;
                }
            }
        }
        self.by_start.range(start.as_u64()..end.as_u64()).next().is_some()
    }

    /// First-fit gap search in the mmap window, wrapping to the base.
    fn find_gap(&self, from: VirtAddr, len: u64) -> Option<VirtAddr> {
        let mut cursor = from.as_u64().max(self.layout.mmap_base.as_u64());
        for (&start, &id) in self.by_start.range(..) {
            let vma = self.arena.get(id)?;
            let vma_end = vma.end.as_u64();
            if vma_end <= cursor {
                continue;
            }
            if start > cursor && start - cursor >= len {
                return Some(VirtAddr::new(cursor));
            }
            cursor = cursor.max(vma_end);
        }
        if cursor + len <= self.layout.mmap_limit.as_u64() {
            return Some(VirtAddr::new(cursor));
        }
        None
    }

    fn next_random(&mut self) -> u64 {
        // xorshift*; placement entropy, not a security boundary by itself.
        let mut x = self.rng_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng_state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpaceKind {
    Kernel,
    User,
}

/// A process (or the kernel's) view of memory.
pub struct AddressSpace {
    kind: SpaceKind,
    frames: Arc<FrameAllocator>,
    hal: Arc<dyn Hal>,
    config: MmConfig,
    /// Address-space lock: VMA tree and layout.
    inner: Mutex<SpaceInner>,
    /// Page lock: the table hierarchy.
    tables: Mutex<PageTables>,
    users: AtomicU32,
}

impl AddressSpace {
    /// The kernel address space: empty lower half, upper half populated
    /// by explicit `map` calls during boot.
    pub fn new_kernel(
        frames: Arc<FrameAllocator>,
        hal: Arc<dyn Hal>,
        config: MmConfig,
    ) -> KernelResult<Arc<Self>> {
        let tables = PageTables::new(&frames)?;
        let seed = hal.now_ns() | 1;
        Ok(Arc::new(Self {
            kind: SpaceKind::Kernel,
            frames,
            hal,
            config,
            inner: Mutex::new(SpaceInner {
                arena: VmaArena::new(),
                by_start: BTreeMap::new(),
                layout: SpaceLayout::default(),
                mmap_hint: SpaceLayout::default().mmap_base,
                rng_state: seed,
            }),
            tables: Mutex::new(tables),
            users: AtomicU32::new(1),
        }))
    }

    /// A fresh user address space sharing the kernel upper half.
    pub fn new_user(kernel: &AddressSpace) -> KernelResult<Arc<Self>> {
        let mut tables = PageTables::new(&kernel.frames)?;
        tables.adopt_kernel_half(&kernel.tables.lock());
        let seed = kernel.hal.now_ns() | 1;
        Ok(Arc::new(Self {
            kind: SpaceKind::User,
            frames: kernel.frames.clone(),
            hal: kernel.hal.clone(),
            config: kernel.config,
            inner: Mutex::new(SpaceInner {
                arena: VmaArena::new(),
                by_start: BTreeMap::new(),
                layout: SpaceLayout::default(),
                mmap_hint: SpaceLayout::default().mmap_base,
                rng_state: seed,
            }),
            tables: Mutex::new(tables),
            users: AtomicU32::new(1),
        }))
    }

    /// Root frame of the table hierarchy (for the context-switch path).
    /// Switching address spaces costs a full TLB flush.
    pub fn activate(&self) -> FrameNumber {
        self.hal.tlb_invalidate_all();
        self.tables.lock().root()
    }

    pub fn retain(&self) {
        self.users.fetch_add(1, Ordering::Relaxed);
    }

    pub fn release(&self) -> u32 {
        self.users.fetch_sub(1, Ordering::Release) - 1
    }

    pub fn user_count(&self) -> u32 {
        self.users.load(Ordering::Relaxed)
    }

    /// Install mappings for an explicit physical range (kernel windows,
    /// device apertures). No VMA is recorded and no frames change
    /// ownership.
    pub fn map(
        &self,
        vaddr: VirtAddr,
        paddr: super::addr::PhysAddr,
        size: usize,
        prot: Protection,
    ) -> KernelResult<()> {
        let mut tables = self.tables.lock();
        tables.map(
            &self.frames,
            vaddr,
            paddr,
            size,
            pte_flags(prot, false),
            self.config.allow_huge_pages,
        )
    }

    /// Remove every mapping in the range and trim the VMAs covering it.
    /// Idempotent on ranges that are already unmapped.
    pub fn unmap(&self, vaddr: VirtAddr, size: usize) -> KernelResult<()> {
        let size = super::addr::align_up(size, PAGE_SIZE);
        let mut inner = self.inner.lock();
        let mut tables = self.tables.lock();

        let mut removed = Vec::new();
        tables.unmap(&self.frames, vaddr, size, &mut removed)?;
        for page in &removed {
            // Frames under a managed VMA carry a reference; raw kernel
            // windows do not.
            if inner.vma_at(page.vaddr).is_some() {
                self.frames.dec_ref(page.frame);
            }
            self.hal.tlb_invalidate_page(page.vaddr);
        }

        self.trim_vmas(&mut inner, vaddr, VirtAddr::new(vaddr.as_u64() + size as u64));
        Ok(())
    }

    /// Walk the tables without creating anything.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<super::addr::PhysAddr> {
        self.tables.lock().translate(vaddr)
    }

    /// Insert a VMA, failing with `Overlap` if the range intersects an
    /// existing area.
    pub fn vma_insert(
        &self,
        start: VirtAddr,
        end: VirtAddr,
        prot: Protection,
        flags: VmaFlags,
        backing: Option<Arc<dyn VmObject>>,
        offset: u64,
    ) -> KernelResult<VmaId> {
        let mut inner = self.inner.lock();
        self.vma_insert_locked(&mut inner, start, end, prot, flags, backing, offset)
    }

    fn vma_insert_locked(
        &self,
        inner: &mut SpaceInner,
        start: VirtAddr,
        end: VirtAddr,
        prot: Protection,
        flags: VmaFlags,
        backing: Option<Arc<dyn VmObject>>,
        offset: u64,
    ) -> KernelResult<VmaId> {
        if start >= end || !start.is_page_aligned() || !end.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        // An area lies entirely in user space or entirely in kernel
        // space, never straddling the canonical hole.
        let last = VirtAddr::new(end.as_u64() - 1);
        if !start.is_canonical()
            || !last.is_canonical()
            || start.is_user() != last.is_user()
        {
            return Err(KernelError::InvalidArgument);
        }
        if inner.overlaps(start, end) {
            return Err(KernelError::Overlap);
        }
        let id = inner.arena.insert(Vma { start, end, prot, flags, backing, offset });
        inner.by_start.insert(start.as_u64(), id);
        Ok(id)
    }

    /// Reserve a region: honor a `FIXED` hint or pick an address in the
    /// mmap window, randomized by the configured entropy. Pages are
    /// populated on first touch.
    pub fn mmap(
        &self,
        hint: VirtAddr,
        len: usize,
        prot: Protection,
        flags: MapFlags,
        backing: Option<Arc<dyn VmObject>>,
        offset: u64,
    ) -> KernelResult<VirtAddr> {
        if len == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let len = super::addr::align_up(len, PAGE_SIZE) as u64;
        let vma_flags = VmaFlags::PRIVATE
            | if backing.is_some() { VmaFlags::FILE } else { VmaFlags::ANONYMOUS };
        if flags.contains(MapFlags::FIXED) && hint.as_u64() == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        let start = if flags.contains(MapFlags::FIXED) {
            if !hint.is_page_aligned() {
                return Err(KernelError::InvalidArgument);
            }
            hint
        } else {
            let jitter = if self.config.aslr_entropy_bits > 0 {
                let mask = (1u64 << self.config.aslr_entropy_bits) - 1;
                (inner.next_random() & mask) << super::addr::PAGE_SHIFT
            } else {
                0
            };
            let from = VirtAddr::new(
                inner.mmap_hint.as_u64().max(inner.layout.mmap_base.as_u64()) + jitter,
            );
            match inner.find_gap(from, len) {
                Some(addr) => addr,
                None => inner
                    .find_gap(inner.layout.mmap_base, len)
                    .ok_or(KernelError::OutOfMemory)?,
            }
        };
        let end = VirtAddr::new(start.as_u64() + len);
        self.vma_insert_locked(&mut inner, start, end, prot, vma_flags, backing, offset)?;
        if !flags.contains(MapFlags::FIXED) {
            inner.mmap_hint = end;
        }
        Ok(start)
    }

    /// Change the protection of `[start, start + len)`, splitting VMAs
    /// at the edges and merging compatible neighbors afterwards.
    pub fn protect(&self, start: VirtAddr, len: usize, prot: Protection) -> KernelResult<()> {
        if !start.is_page_aligned() || len == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let len = super::addr::align_up(len, PAGE_SIZE) as u64;
        let end = VirtAddr::new(start.as_u64() + len);

        let mut inner = self.inner.lock();
        self.split_at(&mut inner, start);
        self.split_at(&mut inner, end);

        let covered: Vec<VmaId> = inner
            .by_start
            .range(start.as_u64()..end.as_u64())
            .map(|(_, &id)| id)
            .collect();
        if covered.is_empty() {
            return Err(KernelError::NotFound);
        }
        for &id in &covered {
            let vma = inner.arena.get_mut(id).ok_or(KernelError::NotFound)?;
            vma.prot = prot;
        }

        // Rewrite present leaves; COW write protection survives a
        // permission widening (the fault path restores write access).
        let mut tables = self.tables.lock();
        let mut page = start;
        while page < end {
            if let Some(pte) = tables.leaf_entry(page) {
                let cow = pte.flags().contains(PteFlags::COW);
                let keep = pte.flags() & (PteFlags::ACCESSED | PteFlags::DIRTY);
                tables.update_leaf(page, Pte::new(pte.addr(), pte_flags(prot, cow) | keep));
                self.hal.tlb_invalidate_page(page);
            }
            page = page + PAGE_SIZE as u64;
        }
        drop(tables);

        self.merge_around(&mut inner, start);
        self.merge_around(&mut inner, end);
        Ok(())
    }

    /// The demand-paging and COW fault path.
    pub fn page_fault(&self, addr: VirtAddr, info: PageFaultInfo) -> KernelResult<()> {
        // 1. Locate the VMA; no VMA means the access is stray.
        let (prot, backing, vma_start, vma_offset) = {
            let inner = self.inner.lock();
            let id = inner.vma_at(addr).ok_or(KernelError::Segfault)?;
            let vma = inner.arena.get(id).ok_or(KernelError::Segfault)?;
            (vma.prot, vma.backing.clone(), vma.start, vma.offset)
        };

        // 2. Classify and reject up front.
        if info.user && !prot.contains(Protection::USER) {
            return Err(KernelError::Segfault);
        }
        if info.write && !prot.contains(Protection::WRITE) {
            return Err(KernelError::Segfault);
        }

        let page = addr.align_down_page();
        let mut tables = self.tables.lock();
        let existing = tables.leaf_entry(page);

        match existing {
            None => {
                if let Some(object) = backing {
                    // 4. Populate from the backing object.
                    let frame = self
                        .frames
                        .alloc_frames(0, AllocFlags::ZEROED | AllocFlags::REFILL_OK, 0)
                        .ok_or(KernelError::OutOfMemory)?;
                    let object_offset = (page - vma_start) + vma_offset;
                    let dst = unsafe {
                        core::slice::from_raw_parts_mut(
                            self.frames.direct_map().frame_ptr(frame),
                            PAGE_SIZE,
                        )
                    };
                    if let Err(err) = object.read_page(object_offset, dst) {
                        self.frames.free_frames(frame, 0);
                        return Err(err);
                    }
                    tables.map_page(&self.frames, page, frame.addr(), pte_flags(prot, false))?;
                } else {
                    // 3. Anonymous: a zeroed frame with the VMA's
                    // protection.
                    let frame = self
                        .frames
                        .alloc_frames(0, AllocFlags::ZEROED | AllocFlags::REFILL_OK, 0)
                        .ok_or(KernelError::OutOfMemory)?;
                    tables.map_page(&self.frames, page, frame.addr(), pte_flags(prot, false))?;
                }
                Ok(())
            }
            Some(pte) => {
                // 5. Write to a COW page: break the share.
                if info.write && pte.flags().contains(PteFlags::COW) {
                    self.break_cow(&mut tables, page, pte, prot)
                } else {
                    // 6. Anything else is a genuine violation.
                    Err(KernelError::Segfault)
                }
            }
        }
    }

    fn break_cow(
        &self,
        tables: &mut PageTables,
        page: VirtAddr,
        pte: Pte,
        prot: Protection,
    ) -> KernelResult<()> {
        let old = pte.frame();
        let fresh = self
            .frames
            .alloc_frames(0, AllocFlags::REFILL_OK, 0)
            .ok_or(KernelError::OutOfMemory)?;
        let dmap = self.frames.direct_map();
        unsafe {
            core::ptr::copy_nonoverlapping(dmap.frame_ptr(old), dmap.frame_ptr(fresh), PAGE_SIZE);
        }
        let keep = pte.flags() & (PteFlags::ACCESSED | PteFlags::DIRTY);
        tables.update_leaf(page, Pte::new(fresh.addr(), pte_flags(prot, false) | keep));
        // Dropping the old reference may release the frame to the
        // buddy system.
        self.frames.dec_ref(old);
        self.hal.tlb_invalidate_page(page);
        Ok(())
    }

    /// Duplicate this address space. Private writable areas become COW
    /// in both parent and child; everything else shares frames.
    pub fn fork(&self, kernel: &AddressSpace) -> KernelResult<Arc<AddressSpace>> {
        let child = AddressSpace::new_user(kernel)?;
        let mut inner = self.inner.lock();
        let mut tables = self.tables.lock();
        {
            let mut child_inner = child.inner.lock();
            let mut child_tables = child.tables.lock();
            child_inner.layout = inner.layout;
            child_inner.mmap_hint = inner.mmap_hint;

            let ids: Vec<VmaId> = inner.by_start.values().copied().collect();
            for id in ids {
                let mut vma = inner.arena.get(id).ok_or(KernelError::NotFound)?.clone();
                let cow_eligible = vma.flags.contains(VmaFlags::PRIVATE)
                    && vma.prot.contains(Protection::WRITE);

                let mut page = vma.start;
                while page < vma.end {
                    if let Some(pte) = tables.leaf_entry(page) {
                        let frame = pte.frame();
                        if cow_eligible {
                            let keep = pte.flags() & (PteFlags::ACCESSED | PteFlags::DIRTY);
                            let shared = Pte::new(frame.addr(), pte_flags(vma.prot, true) | keep);
                            tables.update_leaf(page, shared);
                            child_tables.map_page(&self.frames, page, frame.addr(),
                                pte_flags(vma.prot, true) | keep)?;
                            self.hal.tlb_invalidate_page(page);
                        } else {
                            child_tables.map_page(&self.frames, page, frame.addr(), pte.flags())?;
                        }
                        self.frames.inc_ref(frame);
                    }
                    page = page + PAGE_SIZE as u64;
                }

                if cow_eligible {
                    vma.flags |= VmaFlags::COW;
                    inner.arena.get_mut(id).ok_or(KernelError::NotFound)?.flags |= VmaFlags::COW;
                }
                let child_id = child_inner.arena.insert(vma);
                let start = child_inner.arena.get(child_id).unwrap().start;
                child_inner.by_start.insert(start.as_u64(), child_id);
            }
        }
        Ok(child)
    }

    /// Snapshot of the VMA covering `addr`.
    pub fn vma_lookup(&self, addr: VirtAddr) -> Option<Vma> {
        let inner = self.inner.lock();
        let id = inner.vma_at(addr)?;
        inner.arena.get(id).cloned()
    }

    /// Number of live VMAs.
    pub fn vma_count(&self) -> usize {
        self.inner.lock().by_start.len()
    }

    /// Split the VMA spanning `addr` so that `addr` becomes a boundary.
    fn split_at(&self, inner: &mut SpaceInner, addr: VirtAddr) {
        let id = match inner.vma_at(addr) {
            Some(id) => id,
            None => return,
        };
        let vma = match inner.arena.get(id) {
            Some(vma) if vma.start < addr => vma.clone(),
            _ => return,
        };
        let right = Vma {
            start: addr,
            end: vma.end,
            prot: vma.prot,
            flags: vma.flags,
            backing: vma.backing.clone(),
            offset: vma.offset + (addr - vma.start),
        };
        inner.arena.get_mut(id).unwrap().end = addr;
        let right_id = inner.arena.insert(right);
        inner.by_start.insert(addr.as_u64(), right_id);
    }

    /// Merge the VMAs meeting at `addr` when their attributes align.
    fn merge_around(&self, inner: &mut SpaceInner, addr: VirtAddr) {
        let right_id = match inner.by_start.get(&addr.as_u64()) {
            Some(&id) => id,
            None => return,
        };
        let left_id = match inner.by_start.range(..addr.as_u64()).next_back() {
            Some((_, &id)) => id,
            None => return,
        };
        let merge = {
            let left = match inner.arena.get(left_id) {
                Some(vma) => vma,
                None => return,
            };
            let right = match inner.arena.get(right_id) {
                Some(vma) => vma,
                None => return,
            };
            let contiguous_backing =
                left.backing.is_none() || left.offset + left.len() == right.offset;
            left.end == right.start
                && left.prot == right.prot
                && left.flags == right.flags
                && left.same_backing(right)
                && contiguous_backing
        };
        if !merge {
            return;
        }
        let right = inner.arena.remove(right_id).unwrap();
        inner.by_start.remove(&addr.as_u64());
        inner.arena.get_mut(left_id).unwrap().end = right.end;
    }

    /// Remove VMA coverage of `[start, end)`, splitting partially
    /// covered areas.
    fn trim_vmas(&self, inner: &mut SpaceInner, start: VirtAddr, end: VirtAddr) {
        let overlapping: Vec<(u64, VmaId)> = inner
            .by_start
            .range(..end.as_u64())
            .map(|(&s, &id)| (s, id))
            .collect();
        for (key, id) in overlapping {
            let vma = match inner.arena.get(id) {
                Some(vma) if vma.end > start => vma.clone(),
                _ => continue,
            };
            inner.by_start.remove(&key);
            inner.arena.remove(id);

            if vma.start < start {
                let left = Vma {
                    start: vma.start,
                    end: start,
                    prot: vma.prot,
                    flags: vma.flags,
                    backing: vma.backing.clone(),
                    offset: vma.offset,
                };
                let left_id = inner.arena.insert(left);
                inner.by_start.insert(vma.start.as_u64(), left_id);
            }
            if vma.end > end {
                let right = Vma {
                    start: end,
                    end: vma.end,
                    prot: vma.prot,
                    flags: vma.flags,
                    backing: vma.backing.clone(),
                    offset: vma.offset + (end - vma.start),
                };
                let right_id = inner.arena.insert(right);
                inner.by_start.insert(end.as_u64(), right_id);
            }
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let tables = self.tables.get_mut();
        let frames = self.frames.clone();
        if self.kind == SpaceKind::User {
            tables.release_user_half(&frames, &mut |_vaddr, frame, _flags| {
                frames.dec_ref(frame);
            });
        }
        frames.free_frames(tables.root(), 0);
    }
}

fn pte_flags(prot: Protection, cow: bool) -> PteFlags {
    let mut flags = PteFlags::PRESENT;
    if prot.contains(Protection::WRITE) && !cow {
        flags |= PteFlags::WRITABLE;
    }
    if prot.contains(Protection::USER) {
        flags |= PteFlags::USER;
    }
    if !prot.contains(Protection::EXEC) {
        flags |= PteFlags::NX;
    }
    if cow {
        flags |= PteFlags::COW;
    }
    flags
}
