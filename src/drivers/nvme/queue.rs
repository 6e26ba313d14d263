//! NVMe queue pairs.
//!
//! A queue pair is a submission ring and a completion ring in
//! DMA-coherent memory plus the two doorbells that transfer ownership
//! of entries between host and controller. The host side tracks
//! `sq_tail`, `cq_head` and the completion phase; the number of
//! in-flight commands is `(sq_tail - cq_head) mod size` and one slot is
//! always kept free to distinguish empty from full.
//!
//! Completions may arrive in any order; each is matched to its request
//! slot by command id. A memory-write barrier precedes every doorbell
//! write (the `Mmio` contract) and a read barrier follows every CQ
//! read.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{fence, Ordering};
use spin::Mutex;

use super::{regs, CqEntry, SqEntry, CQ_ENTRY_SIZE, SQ_ENTRY_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::hal::{DmaRegion, Hal, Mmio};
use crate::mm::PhysAddr;

/// Per-slot request lifecycle. An abandoned slot stays reserved until
/// the controller finally answers or the controller is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    InFlight,
    Abandoned,
    Done(CqEntry),
}

struct QueueState {
    sq_tail: u16,
    cq_head: u16,
    cq_phase: bool,
    slots: Vec<Slot>,
}

/// A submission/completion queue pair bound to its doorbells.
pub struct QueuePair {
    qid: u16,
    size: u16,
    sq_mem: DmaRegion,
    cq_mem: DmaRegion,
    regs: Arc<dyn Mmio>,
    sq_db: usize,
    cq_db: usize,
    hal: Arc<dyn Hal>,
    state: Mutex<QueueState>,
}

impl QueuePair {
    /// Allocate the rings and initialize host-side bookkeeping. The
    /// completion phase starts at 1: the first pass of controller
    /// writes carries phase 1 over the zeroed ring.
    pub fn new(
        qid: u16,
        size: u16,
        regs: Arc<dyn Mmio>,
        dstrd: u8,
        hal: Arc<dyn Hal>,
    ) -> KernelResult<Self> {
        if size < 2 {
            return Err(KernelError::InvalidArgument);
        }
        let sq_mem = hal
            .dma_alloc(size as usize * SQ_ENTRY_SIZE)
            .ok_or(KernelError::OutOfMemory)?;
        let cq_mem = match hal.dma_alloc(size as usize * CQ_ENTRY_SIZE) {
            Some(mem) => mem,
            None => {
                hal.dma_free(sq_mem);
                return Err(KernelError::OutOfMemory);
            }
        };
        let mut slots = Vec::new();
        slots.resize(size as usize, Slot::Free);
        Ok(Self {
            qid,
            size,
            sq_mem,
            cq_mem,
            regs,
            sq_db: regs::sq_doorbell(qid, dstrd),
            cq_db: regs::cq_doorbell(qid, dstrd),
            hal,
            state: Mutex::new(QueueState { sq_tail: 0, cq_head: 0, cq_phase: true, slots }),
        })
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// Physical base of the submission ring (queue-creation commands).
    pub fn sq_base(&self) -> PhysAddr {
        self.sq_mem.paddr()
    }

    /// Physical base of the completion ring.
    pub fn cq_base(&self) -> PhysAddr {
        self.cq_mem.paddr()
    }

    /// Commands currently owned by the controller.
    pub fn in_flight(&self) -> u16 {
        let state = self.state.lock();
        let (tail, head, size) = (state.sq_tail as u32, state.cq_head as u32, self.size as u32);
        ((tail + size - head) % size) as u16
    }

    /// Submit a command: assign `command_id := sq_tail`, copy the entry
    /// into the ring, advance the tail and ring the doorbell. Fails
    /// with `QueueFull` when advancing would collide with `cq_head` or
    /// the tail slot is still reserved by an abandoned command.
    pub fn submit(&self, mut cmd: SqEntry) -> KernelResult<u16> {
        let mut state = self.state.lock();
        let tail = state.sq_tail;
        let next = (tail + 1) % self.size;
        if next == state.cq_head {
            return Err(KernelError::QueueFull);
        }
        if state.slots[tail as usize] != Slot::Free {
            // The slot belongs to an abandoned command until the
            // controller answers or the controller is reset.
            return Err(KernelError::QueueFull);
        }

        cmd.set_command_id(tail);
        unsafe {
            let slot = (self.sq_mem.vaddr().as_ptr() as *mut SqEntry).add(tail as usize);
            core::ptr::write_volatile(slot, cmd);
        }
        state.slots[tail as usize] = Slot::InFlight;
        state.sq_tail = next;
        // The Mmio write carries the release barrier that orders the
        // ring store before the doorbell.
        self.regs.write32(self.sq_db, next as u32);
        Ok(tail)
    }

    /// Drain every newly delivered completion into its request slot.
    /// Returns the number of completions accepted.
    pub fn poll(&self) -> usize {
        let mut state = self.state.lock();
        let mut accepted = 0;
        loop {
            let head = state.cq_head;
            let entry = unsafe {
                let slot = (self.cq_mem.vaddr().as_ptr() as *const CqEntry).add(head as usize);
                let entry = core::ptr::read_volatile(slot);
                fence(Ordering::Acquire);
                entry
            };
            // A new entry carries the queue's current phase exactly.
            if entry.phase() != state.cq_phase {
                break;
            }
            let cid = entry.cid;
            if (cid as usize) < state.slots.len() {
                match state.slots[cid as usize] {
                    Slot::InFlight => state.slots[cid as usize] = Slot::Done(entry),
                    Slot::Abandoned => {
                        // The waiter gave up; release the slot now that
                        // the controller has answered.
                        log::debug!(
                            target: "nvme",
                            "queue {}: late completion for abandoned cid {}",
                            self.qid, cid
                        );
                        state.slots[cid as usize] = Slot::Free;
                    }
                    _ => {
                        log::warn!(
                            target: "nvme",
                            "queue {}: completion for idle cid {}",
                            self.qid, cid
                        );
                    }
                }
            } else {
                log::warn!(target: "nvme", "queue {}: completion with bad cid {}", self.qid, cid);
            }

            state.cq_head = (head + 1) % self.size;
            if state.cq_head == 0 {
                state.cq_phase = !state.cq_phase;
            }
            accepted += 1;
            let new_head = state.cq_head;
            self.regs.write32(self.cq_db, new_head as u32);
        }
        accepted
    }

    /// Take the completion for `cid` if it has arrived, freeing the
    /// slot.
    pub fn take_completion(&self, cid: u16) -> Option<CqEntry> {
        let mut state = self.state.lock();
        let idx = cid as usize;
        if idx >= state.slots.len() {
            return None;
        }
        if let Slot::Done(entry) = state.slots[idx] {
            state.slots[idx] = Slot::Free;
            return Some(entry);
        }
        None
    }

    /// Mark a timed-out command abandoned. The slot stays reserved
    /// until an asynchronous completion arrives or the controller is
    /// reset.
    pub fn abandon(&self, cid: u16) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(cid as usize) {
            if *slot == Slot::InFlight {
                *slot = Slot::Abandoned;
            }
        }
    }

    /// Fail every outstanding request (controller death or reset).
    /// Returns the number of slots released.
    pub fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let mut released = 0;
        for slot in state.slots.iter_mut() {
            if matches!(slot, Slot::InFlight | Slot::Abandoned | Slot::Done(_)) {
                *slot = Slot::Free;
                released += 1;
            }
        }
        state.cq_head = state.sq_tail;
        released
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        self.hal.dma_free(self.sq_mem);
        self.hal.dma_free(self.cq_mem);
    }
}
