//! Four-level page tables.
//!
//! The walker owns one root frame and manipulates the hierarchy through
//! the direct map; it never touches architectural registers. TLB
//! maintenance is the caller's business (the address-space layer issues
//! the invalidations the contract requires).
//!
//! Entry layout: bits 12..51 hold the physical frame, low bits and bit
//! 63 hold the attributes. Bit 9 is software-available and carries the
//! copy-on-write tag. A non-present entry is all zeroes.

use bitflags::bitflags;

use super::addr::{DirectMap, FrameNumber, PhysAddr, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
use super::frame::{AllocFlags, FrameAllocator};
use crate::error::{KernelError, KernelResult};

/// Bytes covered by one level-2 (huge) mapping.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

const ENTRIES: usize = 512;
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Page-table entry attribute bits.
    pub struct PteFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// Leaf at level 2 (2 MiB mapping).
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        /// Software bit: write-protected copy-on-write page.
        const COW           = 1 << 9;
        const NX            = 1 << 63;
    }
}

/// A single 64-bit table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(u64);

impl Pte {
    pub const fn empty() -> Self {
        Pte(0)
    }

    pub fn new(addr: PhysAddr, flags: PteFlags) -> Self {
        Pte((addr.as_u64() & ADDR_MASK) | flags.bits())
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    pub fn frame(self) -> FrameNumber {
        self.addr().frame()
    }
}

/// A leaf mapping removed by `unmap`, reported so the owner can release
/// frame references and invalidate the TLB.
#[derive(Debug, Clone, Copy)]
pub struct UnmappedPage {
    pub vaddr: VirtAddr,
    pub frame: FrameNumber,
    pub flags: PteFlags,
}

/// A four-level page-table hierarchy rooted in one frame.
pub struct PageTables {
    root: FrameNumber,
    dmap: DirectMap,
}

impl PageTables {
    /// Allocate an empty hierarchy.
    pub fn new(frames: &FrameAllocator) -> KernelResult<Self> {
        let root = frames
            .alloc_frames(0, AllocFlags::ZEROED, 0)
            .ok_or(KernelError::OutOfMemory)?;
        Ok(Self { root, dmap: frames.direct_map() })
    }

    pub fn root(&self) -> FrameNumber {
        self.root
    }

    fn entry_ptr(&self, table: FrameNumber, index: usize) -> *mut u64 {
        debug_assert!(index < ENTRIES);
        unsafe { (self.dmap.frame_ptr(table) as *mut u64).add(index) }
    }

    fn read_entry(&self, table: FrameNumber, index: usize) -> Pte {
        Pte(unsafe { self.entry_ptr(table, index).read() })
    }

    fn write_entry(&self, table: FrameNumber, index: usize, pte: Pte) {
        unsafe { self.entry_ptr(table, index).write(pte.0) };
    }

    /// Share the kernel half: copy the upper 256 root entries from
    /// another hierarchy. The referenced lower-level tables are shared,
    /// not duplicated.
    pub fn adopt_kernel_half(&mut self, kernel: &PageTables) {
        for index in ENTRIES / 2..ENTRIES {
            self.write_entry(self.root, index, kernel.read_entry(kernel.root, index));
        }
    }

    /// Walk down to the table holding the entry for `vaddr` at `level`,
    /// creating intermediate tables as needed.
    fn walk_create(
        &mut self,
        frames: &FrameAllocator,
        vaddr: VirtAddr,
        level: u8,
    ) -> KernelResult<FrameNumber> {
        let mut table = self.root;
        let mut current = 4u8;
        while current > level {
            let index = vaddr.table_index(current);
            let entry = self.read_entry(table, index);
            let next = if entry.is_present() {
                if entry.flags().contains(PteFlags::HUGE) {
                    return Err(KernelError::InvalidArgument);
                }
                entry.frame()
            } else {
                let frame = frames
                    .alloc_frames(0, AllocFlags::ZEROED, 0)
                    .ok_or(KernelError::OutOfMemory)?;
                let mut flags = PteFlags::PRESENT | PteFlags::WRITABLE;
                if vaddr.is_user() {
                    flags |= PteFlags::USER;
                }
                self.write_entry(table, index, Pte::new(frame.addr(), flags));
                frame
            };
            table = next;
            current -= 1;
        }
        Ok(table)
    }

    /// Walk down without creating; `None` if the path is not present.
    fn walk(&self, vaddr: VirtAddr, level: u8) -> Option<(FrameNumber, Pte)> {
        let mut table = self.root;
        let mut current = 4u8;
        loop {
            let entry = self.read_entry(table, vaddr.table_index(current));
            if current == level {
                return Some((table, entry));
            }
            if !entry.is_present() || entry.flags().contains(PteFlags::HUGE) {
                return None;
            }
            table = entry.frame();
            current -= 1;
        }
    }

    /// Install a single 4 KiB mapping, replacing whatever was there.
    pub fn map_page(
        &mut self,
        frames: &FrameAllocator,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PteFlags,
    ) -> KernelResult<()> {
        if !vaddr.is_page_aligned() || !paddr.is_page_aligned() || !vaddr.is_canonical() {
            return Err(KernelError::InvalidArgument);
        }
        let table = self.walk_create(frames, vaddr, 1)?;
        self.write_entry(table, vaddr.table_index(1), Pte::new(paddr, flags | PteFlags::PRESENT));
        Ok(())
    }

    /// Install a naturally aligned 2 MiB mapping at level 2.
    pub fn map_huge_page(
        &mut self,
        frames: &FrameAllocator,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PteFlags,
    ) -> KernelResult<()> {
        let huge = HUGE_PAGE_SIZE as u64;
        if vaddr.as_u64() % huge != 0 || paddr.as_u64() % huge != 0 || !vaddr.is_canonical() {
            return Err(KernelError::InvalidArgument);
        }
        let table = self.walk_create(frames, vaddr, 2)?;
        self.write_entry(
            table,
            vaddr.table_index(2),
            Pte::new(paddr, flags | PteFlags::PRESENT | PteFlags::HUGE),
        );
        Ok(())
    }

    /// Install a run of mappings. 2 MiB leaves are used for naturally
    /// aligned stretches when `allow_huge` is set.
    pub fn map(
        &mut self,
        frames: &FrameAllocator,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        size: usize,
        flags: PteFlags,
        allow_huge: bool,
    ) -> KernelResult<()> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut offset = 0usize;
        while offset < size {
            let va = vaddr + offset as u64;
            let pa = paddr + offset as u64;
            let rest = size - offset;
            if allow_huge
                && va.as_u64() % HUGE_PAGE_SIZE as u64 == 0
                && pa.as_u64() % HUGE_PAGE_SIZE as u64 == 0
                && rest >= HUGE_PAGE_SIZE
            {
                self.map_huge_page(frames, va, pa, flags)?;
                offset += HUGE_PAGE_SIZE;
            } else {
                self.map_page(frames, va, pa, flags)?;
                offset += PAGE_SIZE;
            }
        }
        Ok(())
    }

    /// Remove mappings in `[vaddr, vaddr + size)`. Already-unmapped
    /// pages are skipped, so the operation is idempotent. Page tables
    /// whose entries all become empty are pruned and freed.
    pub fn unmap(
        &mut self,
        frames: &FrameAllocator,
        vaddr: VirtAddr,
        size: usize,
        removed: &mut alloc::vec::Vec<UnmappedPage>,
    ) -> KernelResult<()> {
        if size == 0 || size % PAGE_SIZE != 0 || !vaddr.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        let mut offset = 0usize;
        while offset < size {
            let va = vaddr + offset as u64;
            // A huge leaf must be covered entirely by the unmap.
            if let Some((table, entry)) = self.walk(va, 2) {
                if entry.is_present() && entry.flags().contains(PteFlags::HUGE) {
                    if va.as_u64() % HUGE_PAGE_SIZE as u64 != 0 || size - offset < HUGE_PAGE_SIZE {
                        return Err(KernelError::InvalidArgument);
                    }
                    self.write_entry(table, va.table_index(2), Pte::empty());
                    removed.push(UnmappedPage { vaddr: va, frame: entry.frame(), flags: entry.flags() });
                    offset += HUGE_PAGE_SIZE;
                    self.prune(frames, va, 2);
                    continue;
                }
            }
            if let Some((table, entry)) = self.walk(va, 1) {
                if entry.is_present() {
                    self.write_entry(table, va.table_index(1), Pte::empty());
                    removed.push(UnmappedPage { vaddr: va, frame: entry.frame(), flags: entry.flags() });
                    self.prune(frames, va, 1);
                }
            }
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    /// Free intermediate tables along `vaddr`'s path that no longer
    /// hold any entries. `from_level` is the level of the removed leaf.
    fn prune(&mut self, frames: &FrameAllocator, vaddr: VirtAddr, from_level: u8) {
        // Bottom-up: an L1 table emptied may empty its parent.
        for level in from_level..4u8 {
            let (parent_table, parent_index, table) = {
                match self.walk(vaddr, level + 1) {
                    Some((parent, entry)) if entry.is_present() => {
                        (parent, vaddr.table_index(level + 1), entry.frame())
                    }
                    _ => return,
                }
            };
            let empty = (0..ENTRIES).all(|i| self.read_entry(table, i) == Pte::empty());
            if !empty {
                return;
            }
            self.write_entry(parent_table, parent_index, Pte::empty());
            frames.free_frames(table, 0);
        }
    }

    /// Translate a virtual address without creating anything.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let (_, l2) = self.walk(vaddr, 2)?;
        if l2.is_present() && l2.flags().contains(PteFlags::HUGE) {
            let offset = vaddr.as_u64() & (HUGE_PAGE_SIZE as u64 - 1);
            return Some(PhysAddr::new(l2.addr().as_u64() + offset));
        }
        let (_, entry) = self.walk(vaddr, 1)?;
        if !entry.is_present() {
            return None;
        }
        Some(PhysAddr::new(entry.addr().as_u64() + vaddr.page_offset()))
    }

    /// Leaf entry covering `vaddr`, if the walk reaches one.
    pub fn leaf_entry(&self, vaddr: VirtAddr) -> Option<Pte> {
        if let Some((_, l2)) = self.walk(vaddr, 2) {
            if l2.is_present() && l2.flags().contains(PteFlags::HUGE) {
                return Some(l2);
            }
        }
        let (_, entry) = self.walk(vaddr, 1)?;
        entry.is_present().then_some(entry)
    }

    /// Rewrite the leaf entry for `vaddr`. Returns the previous entry.
    pub fn update_leaf(&mut self, vaddr: VirtAddr, pte: Pte) -> Option<Pte> {
        let (table, entry) = self.walk(vaddr, 1)?;
        if !entry.is_present() {
            return None;
        }
        self.write_entry(table, vaddr.table_index(1), pte);
        Some(entry)
    }

    /// Tear down every table reachable from the user half, reporting
    /// still-present leaves to `on_leaf` before the tables are freed.
    /// The kernel half is shared and left untouched; the root frame
    /// itself is freed by the caller.
    pub fn release_user_half(
        &mut self,
        frames: &FrameAllocator,
        on_leaf: &mut dyn FnMut(VirtAddr, FrameNumber, PteFlags),
    ) {
        for index in 0..ENTRIES / 2 {
            let entry = self.read_entry(self.root, index);
            if entry.is_present() {
                let base = VirtAddr::new((index as u64) << (PAGE_SHIFT + 27));
                self.release_table(frames, entry.frame(), 3, base, on_leaf);
                self.write_entry(self.root, index, Pte::empty());
            }
        }
    }

    fn release_table(
        &mut self,
        frames: &FrameAllocator,
        table: FrameNumber,
        level: u8,
        base: VirtAddr,
        on_leaf: &mut dyn FnMut(VirtAddr, FrameNumber, PteFlags),
    ) {
        let span = 1u64 << (PAGE_SHIFT + 9 * (level as usize - 1));
        for index in 0..ENTRIES {
            let entry = self.read_entry(table, index);
            if !entry.is_present() {
                continue;
            }
            let vaddr = VirtAddr::new(base.as_u64() + index as u64 * span);
            if level == 1 || entry.flags().contains(PteFlags::HUGE) {
                on_leaf(vaddr, entry.frame(), entry.flags());
            } else {
                self.release_table(frames, entry.frame(), level - 1, vaddr, on_leaf);
            }
        }
        frames.free_frames(table, 0);
    }
}
