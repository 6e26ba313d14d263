//! NVMe storage engine.
//!
//! Controller bring-up, per-CPU I/O queue pairs, PRP descriptor
//! construction and the synchronous command path. The engine talks to
//! the controller exclusively through an [`Mmio`](crate::hal::Mmio)
//! window and the HAL DMA services, so the same code drives QEMU-style
//! hardware and the in-tree controller model used by the tests.

pub mod controller;
pub mod prp;
pub mod queue;
pub mod regs;

pub use controller::{ControllerInfo, ControllerState, NvmeConfig, NvmeController};
pub use queue::QueuePair;

use crate::error::{KernelError, KernelResult};

/// Admin command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdminOpcode {
    DeleteIoSq = 0x00,
    CreateIoSq = 0x01,
    GetLogPage = 0x02,
    DeleteIoCq = 0x04,
    CreateIoCq = 0x05,
    Identify = 0x06,
    Abort = 0x08,
    SetFeatures = 0x09,
    GetFeatures = 0x0A,
}

/// NVM command-set opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IoOpcode {
    Flush = 0x00,
    Write = 0x01,
    Read = 0x02,
}

/// Feature identifiers used by the engine.
pub mod feature {
    /// Volatile write cache enable.
    pub const VOLATILE_WRITE_CACHE: u32 = 0x06;
    /// Number of I/O queues.
    pub const NUM_QUEUES: u32 = 0x07;
    /// Host memory buffer.
    pub const HOST_MEMORY_BUFFER: u32 = 0x0D;
}

/// Identify CNS values.
pub mod cns {
    pub const NAMESPACE: u32 = 0x00;
    pub const CONTROLLER: u32 = 0x01;
}

/// One 64-byte submission queue entry.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SqEntry {
    /// Opcode, flags and command id.
    pub cdw0: u32,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    /// Metadata pointer.
    pub mptr: u64,
    /// Data pointer: PRP1/PRP2 (the engine does not use SGLs).
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl SqEntry {
    /// A command with the given opcode; the command id slot stays blank
    /// until the queue assigns one at submission.
    pub fn new(opcode: u8) -> Self {
        Self { cdw0: opcode as u32, ..Default::default() }
    }

    pub fn opcode(&self) -> u8 {
        (self.cdw0 & 0xFF) as u8
    }

    pub fn command_id(&self) -> u16 {
        (self.cdw0 >> 16) as u16
    }

    pub(crate) fn set_command_id(&mut self, cid: u16) {
        self.cdw0 = (self.cdw0 & 0x0000_FFFF) | ((cid as u32) << 16);
    }
}

/// One 16-byte completion queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CqEntry {
    /// Command-specific result.
    pub result: u32,
    pub reserved: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub cid: u16,
    /// Bit 0 = phase tag; bits 1..11 = status code + type.
    pub status: u16,
}

impl CqEntry {
    pub fn phase(&self) -> bool {
        self.status & 1 == 1
    }

    /// Status code and type, exactly as the controller reported it.
    pub fn status_code(&self) -> u16 {
        (self.status >> 1) & 0x7FF
    }

    pub fn is_success(&self) -> bool {
        self.status_code() == 0
    }

    /// Map a non-zero status to the error the caller sees.
    pub fn to_result(&self) -> KernelResult<CqEntry> {
        if self.is_success() {
            Ok(*self)
        } else {
            Err(KernelError::DeviceError { code: self.status_code() })
        }
    }
}

/// A namespace accepted during the bring-up scan.
#[derive(Debug, Clone, Copy)]
pub struct Namespace {
    pub id: u32,
    /// Capacity in logical blocks.
    pub blocks: u64,
    /// Logical block size in bytes.
    pub lba_size: u32,
}

impl Namespace {
    pub fn capacity_bytes(&self) -> u64 {
        self.blocks * self.lba_size as u64
    }
}

/// Sizes of the wire structures, as NVMe fixes them.
pub const SQ_ENTRY_SIZE: usize = 64;
pub const CQ_ENTRY_SIZE: usize = 16;

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::pci::BarMapper;
use super::{BusCoord, ClassCode, DeviceRecord, Driver};
use crate::hal::Hal;

/// The class triple NVMe controllers enumerate with.
pub const NVME_CLASS: ClassCode = ClassCode::new(0x01, 0x08, 0x02);

/// The hot-plug-facing NVMe driver: matches NVMe-class PCI functions,
/// maps BAR0 and runs controller bring-up on probe.
pub struct NvmeDriver {
    hal: Arc<dyn Hal>,
    bars: Arc<dyn BarMapper>,
    config: NvmeConfig,
    controllers: Mutex<Vec<(BusCoord, Arc<NvmeController>)>>,
}

impl NvmeDriver {
    pub fn new(hal: Arc<dyn Hal>, bars: Arc<dyn BarMapper>, config: NvmeConfig) -> Arc<Self> {
        Arc::new(Self { hal, bars, config, controllers: Mutex::new(Vec::new()) })
    }

    /// The controller bound to a PCI coordinate, if probe succeeded.
    pub fn controller_for(&self, coord: BusCoord) -> Option<Arc<NvmeController>> {
        self.controllers
            .lock()
            .iter()
            .find(|(c, _)| *c == coord)
            .map(|(_, ctrl)| ctrl.clone())
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.lock().len()
    }
}

impl Driver for NvmeDriver {
    fn name(&self) -> &'static str {
        "nvme"
    }

    fn matches(&self, device: &DeviceRecord) -> bool {
        matches!(device.coord, BusCoord::Pci { .. }) && device.class == NVME_CLASS
    }

    fn probe(&self, device: &DeviceRecord) -> crate::error::KernelResult<()> {
        let regs = self
            .bars
            .map_bar(device.coord, 0)
            .ok_or(crate::error::KernelError::NotFound)?;
        let mut controller = NvmeController::new(regs, self.hal.clone(), self.config);
        controller.bring_up()?;
        self.controllers.lock().push((device.coord, Arc::new(controller)));
        Ok(())
    }

    fn remove(&self, device: &DeviceRecord) {
        self.controllers.lock().retain(|(coord, _)| *coord != device.coord);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_sizes() {
        assert_eq!(core::mem::size_of::<SqEntry>(), SQ_ENTRY_SIZE);
        assert_eq!(core::mem::size_of::<CqEntry>(), CQ_ENTRY_SIZE);
    }

    #[test]
    fn command_id_packing() {
        let mut cmd = SqEntry::new(IoOpcode::Read as u8);
        assert_eq!(cmd.command_id(), 0);
        cmd.set_command_id(0x1234);
        assert_eq!(cmd.opcode(), 0x02);
        assert_eq!(cmd.command_id(), 0x1234);
    }

    #[test]
    fn completion_status_decoding() {
        let entry = CqEntry { status: (0x182 << 1) | 1, ..Default::default() };
        assert!(entry.phase());
        assert_eq!(entry.status_code(), 0x182);
        assert_eq!(
            entry.to_result(),
            Err(KernelError::DeviceError { code: 0x182 })
        );
    }
}
