//! Physical Region Page descriptor construction.
//!
//! A transfer is described by up to two inline PRP entries; anything
//! longer than two pages moves the second entry to a PRP list, a
//! page-aligned array of page-base addresses. When a list itself would
//! overflow its page, the final slot chains to a continuation page.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::hal::{DmaRegion, Hal};
use crate::mm::{VirtAddr, PAGE_SIZE};

/// Entries per list page; the last one doubles as the chain pointer
/// when a continuation is needed.
const LIST_ENTRIES: usize = PAGE_SIZE / 8;

/// The data-pointer pair for one command, plus ownership of any list
/// pages backing `prp2`.
pub struct PrpSet {
    pub prp1: u64,
    pub prp2: u64,
    lists: Vec<DmaRegion>,
    hal: Arc<dyn Hal>,
}

impl PrpSet {
    /// Describe the buffer `[vaddr, vaddr + len)` for DMA. Every page
    /// of the buffer must translate; the first entry may start
    /// mid-page, all others are page-aligned bases.
    pub fn build(hal: &Arc<dyn Hal>, vaddr: VirtAddr, len: usize) -> KernelResult<PrpSet> {
        if len == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let first = hal.dma_translate(vaddr).ok_or(KernelError::InvalidArgument)?;
        let first_fill = PAGE_SIZE - first.page_offset() as usize;

        let mut set = PrpSet { prp1: first.as_u64(), prp2: 0, lists: Vec::new(), hal: hal.clone() };
        if len <= first_fill {
            return Ok(set);
        }

        // Physical bases of every page after the first.
        let mut tail_pages = Vec::new();
        let mut offset = first_fill;
        while offset < len {
            let page_va = vaddr + offset as u64;
            let pa = hal.dma_translate(page_va).ok_or(KernelError::InvalidArgument)?;
            if !pa.is_page_aligned() {
                return Err(KernelError::InvalidArgument);
            }
            tail_pages.push(pa.as_u64());
            offset += PAGE_SIZE;
        }

        if tail_pages.len() == 1 {
            set.prp2 = tail_pages[0];
            return Ok(set);
        }

        set.prp2 = set.write_lists(&tail_pages)?;
        Ok(set)
    }

    /// Lay the page addresses out as one or more chained list pages and
    /// return the physical address of the first.
    fn write_lists(&mut self, pages: &[u64]) -> KernelResult<u64> {
        let mut remaining = pages;
        let mut first_pa = 0u64;
        let mut prev_chain_slot: Option<*mut u64> = None;

        while !remaining.is_empty() {
            let region = self.hal.dma_alloc(PAGE_SIZE).ok_or(KernelError::OutOfMemory)?;
            let base = region.vaddr().as_ptr() as *mut u64;
            if first_pa == 0 {
                first_pa = region.paddr().as_u64();
            }
            if let Some(slot) = prev_chain_slot {
                unsafe { slot.write(region.paddr().as_u64()) };
            }

            // A full page keeps its last slot for the continuation.
            let capacity = if remaining.len() > LIST_ENTRIES {
                LIST_ENTRIES - 1
            } else {
                remaining.len()
            };
            for (i, &pa) in remaining[..capacity].iter().enumerate() {
                unsafe { base.add(i).write(pa) };
            }
            prev_chain_slot = Some(unsafe { base.add(LIST_ENTRIES - 1) });
            remaining = &remaining[capacity..];
            self.lists.push(region);
        }
        Ok(first_pa)
    }

    /// Number of list pages backing this descriptor set.
    pub fn list_pages(&self) -> usize {
        self.lists.len()
    }
}

impl Drop for PrpSet {
    fn drop(&mut self) {
        for region in self.lists.drain(..) {
            self.hal.dma_free(region);
        }
    }
}
