//! # Nucleon Kernel Core
//!
//! The invariant-heavy core of the Nucleon monolithic kernel:
//!
//! - Physical memory management: a per-zone, per-NUMA-node buddy frame
//!   allocator ([`mm::frame`]) with a slab object allocator layered on
//!   top ([`mm::slab`]).
//! - Virtual memory management: four-level page tables, virtual memory
//!   areas, demand paging and copy-on-write ([`mm::address_space`]).
//! - NVMe storage engine: controller bring-up, per-CPU queue pairs,
//!   PRP descriptor construction and the synchronous command path
//!   ([`drivers::nvme`]).
//! - Hot-plug core: bus polling, bounded event delivery and driver
//!   binding ([`drivers::hotplug`]).
//!
//! Everything architecture-specific is consumed through the narrow
//! [`hal`] contract; the crate itself contains no instruction sequences
//! and builds for the host, where the test suite drives the full stack
//! against mock hardware.
//!
//! ## Initialization order
//!
//! Subsystems are constructed leaves-first and handles are passed down
//! explicitly; there are no global singletons:
//!
//! 1. The embedder builds a [`hal::Hal`] implementation and a
//!    [`mm::DirectMap`] covering physical memory.
//! 2. [`mm::FrameAllocator::new`] takes the boot memory map.
//! 3. [`mm::KmallocPool::new`] layers object caches on the frames.
//! 4. [`mm::AddressSpace::new_kernel`] builds the kernel address space;
//!    user spaces clone its upper half.
//! 5. NVMe controllers and the hot-plug manager are created on demand
//!    from device discovery.
//!
//! ## Lock order
//!
//! Locks must be taken in this order (outermost first): frame-allocator
//! zone locks, slab cache locks, address-space locks, page-table locks,
//! NVMe queue locks, NVMe controller lock, hot-plug event lock, driver
//! registry lock. No lock is held across a HAL sleep except where a
//! contract explicitly allows blocking.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod drivers;
pub mod error;
pub mod hal;
pub mod mm;

#[cfg(test)]
pub mod testing;

pub use error::{KernelError, KernelResult};
