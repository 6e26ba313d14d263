//! NVMe controller register map.
//!
//! Offsets and field extractors for the register subset the engine
//! touches. Doorbells start at 0x1000 with a stride of `4 << CAP.DSTRD`
//! bytes per doorbell.

use bitflags::bitflags;

/// Controller Capabilities (64-bit).
pub const REG_CAP: usize = 0x00;
/// Version.
pub const REG_VS: usize = 0x08;
/// Controller Configuration.
pub const REG_CC: usize = 0x14;
/// Controller Status.
pub const REG_CSTS: usize = 0x1C;
/// Admin Queue Attributes.
pub const REG_AQA: usize = 0x24;
/// Admin Submission Queue base address (64-bit).
pub const REG_ASQ: usize = 0x28;
/// Admin Completion Queue base address (64-bit).
pub const REG_ACQ: usize = 0x30;
/// First doorbell register.
pub const DOORBELL_BASE: usize = 0x1000;

/// Parsed fields of the CAP register.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Maximum queue entries supported, zero-based (bits 0..15).
    pub mqes: u16,
    /// Ready timeout in 500 ms units (bits 16..23).
    pub to: u8,
    /// Doorbell stride exponent (bits 32..35).
    pub dstrd: u8,
    /// Minimum memory page size exponent offset from 4 KiB (bits 48..51).
    pub mpsmin: u8,
}

impl Capabilities {
    pub fn parse(raw: u64) -> Self {
        Self {
            mqes: (raw & 0xFFFF) as u16,
            to: ((raw >> 16) & 0xFF) as u8,
            dstrd: ((raw >> 32) & 0xF) as u8,
            mpsmin: ((raw >> 48) & 0xF) as u8,
        }
    }

    /// Deepest queue the controller supports.
    pub fn max_entries(&self) -> u32 {
        self.mqes as u32 + 1
    }

    /// Enable/disable deadline advertised by the controller.
    pub fn ready_timeout_ms(&self) -> u64 {
        self.to as u64 * 500
    }

    /// Bytes between consecutive doorbell registers.
    pub fn doorbell_stride(&self) -> usize {
        4usize << self.dstrd
    }
}

bitflags! {
    /// Controller Configuration bits.
    pub struct Cc: u32 {
        const ENABLE = 1 << 0;
    }
}

/// CC with the queue-entry sizes, page size and arbitration fields the
/// engine programs: 64-byte SQ entries, 16-byte CQ entries, 4 KiB
/// pages, round-robin arbitration, NVM command set.
pub fn cc_value(enabled: bool) -> u32 {
    let mut cc = 0u32;
    cc |= 0 << 4; // CSS: NVM command set
    cc |= 0 << 7; // MPS: 2^(12+0) pages
    cc |= 0 << 11; // AMS: round robin
    cc |= 6 << 16; // IOSQES: 2^6 = 64 bytes
    cc |= 4 << 20; // IOCQES: 2^4 = 16 bytes
    if enabled {
        cc |= Cc::ENABLE.bits();
    }
    cc
}

bitflags! {
    /// Controller Status bits.
    pub struct Csts: u32 {
        const READY = 1 << 0;
        /// Controller Fatal Status.
        const CFS   = 1 << 1;
    }
}

/// AQA value for the admin queue depths (both zero-based).
pub fn aqa_value(sq_entries: u16, cq_entries: u16) -> u32 {
    ((cq_entries as u32 - 1) << 16) | (sq_entries as u32 - 1)
}

/// Submission-tail doorbell offset for queue `qid`.
pub fn sq_doorbell(qid: u16, dstrd: u8) -> usize {
    DOORBELL_BASE + (2 * qid as usize) * (4usize << dstrd)
}

/// Completion-head doorbell offset for queue `qid`.
pub fn cq_doorbell(qid: u16, dstrd: u8) -> usize {
    DOORBELL_BASE + (2 * qid as usize + 1) * (4usize << dstrd)
}
