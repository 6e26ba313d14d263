//! Memory management: physical frames, slab caches, address spaces.
//!
//! The layers stack strictly upward: the frame allocator owns all
//! physical RAM, the slab caches draw whole frame runs from it, and the
//! virtual memory manager consumes both. Handles are passed explicitly;
//! construction order is frame allocator, then kmalloc pool, then the
//! kernel address space.

pub mod addr;
pub mod address_space;
pub mod frame;
pub mod page_table;
pub mod slab;

pub use addr::{align_down, align_up, DirectMap, FrameNumber, PhysAddr, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
pub use address_space::{
    AddressSpace, MapFlags, MmConfig, PageFaultInfo, Protection, SpaceLayout, Vma, VmaFlags,
    VmaId, VmObject,
};
pub use frame::{
    AllocFlags, FrameAllocator, FrameStatus, MemoryRegion, Reclaim, RegionKind, Zone, ZoneStats,
    MAX_ORDER,
};
pub use page_table::{PageTables, Pte, PteFlags, UnmappedPage, HUGE_PAGE_SIZE};
pub use slab::{CacheFlags, CacheStats, Ctor, KmallocPool, SlabCache, KMALLOC_CLASSES};
