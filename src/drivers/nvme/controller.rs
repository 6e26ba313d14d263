//! NVMe controller bring-up and command submission.
//!
//! The bring-up walks `Probed -> Reset -> AdminUp -> Enabled ->
//! Identified -> QueuesUp -> Live`; any fatal condition lands in
//! `Dead`, where every outstanding and future request fails with
//! `ControllerDead`. The synchronous command path submits under the
//! queue lock and polls the completion queue with the lock dropped
//! between polls, so a long-running command never serializes unrelated
//! submissions.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::prp::PrpSet;
use super::queue::QueuePair;
use super::regs::{self, Capabilities, Csts};
use super::{cns, feature, AdminOpcode, CqEntry, IoOpcode, Namespace, SqEntry};
use crate::error::{KernelError, KernelResult};
use crate::hal::{DmaRegion, Hal, Mmio};
use crate::mm::{VirtAddr, PAGE_SIZE};

/// Bring-up state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ControllerState {
    Probed,
    Reset,
    AdminUp,
    Enabled,
    Identified,
    QueuesUp,
    Live,
    Dead,
}

impl ControllerState {
    /// Whether bring-up progressed at least to `milestone`. `Dead` has
    /// reached nothing.
    pub fn has_reached(self, milestone: ControllerState) -> bool {
        self != ControllerState::Dead && self >= milestone
    }
}

/// Engine tunables.
#[derive(Debug, Clone, Copy)]
pub struct NvmeConfig {
    /// Synchronous I/O command deadline.
    pub io_timeout_ms: u64,
    /// Synchronous admin command deadline.
    pub admin_timeout_ms: u64,
    /// Deadline for the not-ready poll after clearing enable.
    pub reset_timeout_ms: u64,
    /// Upper bound on I/O queues regardless of CPU count.
    pub max_io_queues: u16,
    /// Requested I/O queue depth (clamped to CAP.MQES + 1).
    pub io_queue_depth: u16,
    /// Host memory buffer cap in 4 KiB pages (0 disables HMB).
    pub hmb_max_pages: u32,
    /// Enable the volatile write cache when the controller has one.
    pub enable_write_cache: bool,
}

impl Default for NvmeConfig {
    fn default() -> Self {
        Self {
            io_timeout_ms: 30_000,
            admin_timeout_ms: 60_000,
            reset_timeout_ms: 5_000,
            max_io_queues: 64,
            io_queue_depth: 128,
            hmb_max_pages: 1024,
            enable_write_cache: true,
        }
    }
}

/// Facts recorded from Identify Controller.
#[derive(Debug, Clone, Default)]
pub struct ControllerInfo {
    pub vendor_id: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    /// Max data transfer size as a power-of-two multiple of the page
    /// size; 0 means unlimited.
    pub mdts: u8,
    /// Optional NVM command support bits.
    pub oncs: u16,
    /// Autonomous power state transition support.
    pub apsta: u8,
    /// Host memory buffer preferred size in 4 KiB units.
    pub hmpre: u32,
    /// SGL support descriptor (the engine still uses PRPs).
    pub sgls: u32,
    /// Number of namespaces the controller exposes.
    pub nn: u32,
    /// Volatile write cache presence.
    pub vwc: u8,
}

impl ControllerInfo {
    fn parse(buf: &[u8]) -> Self {
        let ascii = |range: core::ops::Range<usize>| {
            String::from_utf8_lossy(&buf[range]).trim().into()
        };
        Self {
            vendor_id: u16::from_le_bytes([buf[0], buf[1]]),
            serial: ascii(4..24),
            model: ascii(24..64),
            firmware: ascii(64..72),
            mdts: buf[77],
            oncs: u16::from_le_bytes([buf[520], buf[521]]),
            apsta: buf[265],
            hmpre: u32::from_le_bytes([buf[272], buf[273], buf[274], buf[275]]),
            sgls: u32::from_le_bytes([buf[536], buf[537], buf[538], buf[539]]),
            nn: u32::from_le_bytes([buf[516], buf[517], buf[518], buf[519]]),
            vwc: buf[531],
        }
    }

    /// Largest transfer in bytes, or `None` when unlimited.
    pub fn max_transfer_bytes(&self) -> Option<usize> {
        (self.mdts != 0).then(|| PAGE_SIZE << self.mdts)
    }
}

struct HostMemoryBuffer {
    descriptors: DmaRegion,
    buffer: DmaRegion,
    pages: u32,
}

/// One NVMe controller: the admin queue pair, one I/O queue pair per
/// CPU (up to the controller's grant), and the namespace table.
pub struct NvmeController {
    regs: Arc<dyn Mmio>,
    hal: Arc<dyn Hal>,
    config: NvmeConfig,
    caps: Capabilities,
    state: Mutex<ControllerState>,
    admin: Option<Arc<QueuePair>>,
    io_queues: Vec<Arc<QueuePair>>,
    info: ControllerInfo,
    namespaces: Vec<Namespace>,
    hmb: Option<HostMemoryBuffer>,
}

impl NvmeController {
    /// Wrap a freshly probed controller. Nothing is touched until
    /// [`Self::bring_up`].
    pub fn new(regs: Arc<dyn Mmio>, hal: Arc<dyn Hal>, config: NvmeConfig) -> Self {
        let caps = Capabilities::parse(regs.read64(regs::REG_CAP));
        Self {
            regs,
            hal,
            config,
            caps,
            state: Mutex::new(ControllerState::Probed),
            admin: None,
            io_queues: Vec::new(),
            info: ControllerInfo::default(),
            namespaces: Vec::new(),
            hmb: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    pub fn info(&self) -> &ControllerInfo {
        &self.info
    }

    pub fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    pub fn namespace(&self, nsid: u32) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.id == nsid)
    }

    pub fn io_queue_count(&self) -> usize {
        self.io_queues.len()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Pages lent to the controller through the host memory buffer.
    pub fn hmb_pages(&self) -> u32 {
        self.hmb.as_ref().map_or(0, |hmb| hmb.pages)
    }

    fn set_state(&self, state: ControllerState) {
        log::debug!(target: "nvme", "controller state -> {:?}", state);
        *self.state.lock() = state;
    }

    /// Run the whole bring-up. On failure the controller is left in
    /// `Dead` for fatal conditions, or its last good state otherwise.
    pub fn bring_up(&mut self) -> KernelResult<()> {
        let version = self.regs.read32(regs::REG_VS);
        log::debug!(
            target: "nvme",
            "controller version {}.{}", version >> 16, (version >> 8) & 0xFF
        );
        self.reset()?;
        self.create_admin_queue()?;
        self.enable()?;
        self.identify()?;
        self.create_io_queues()?;
        self.setup_hmb();
        self.setup_write_cache();
        self.scan_namespaces()?;
        self.set_state(ControllerState::Live);
        log::info!(
            target: "nvme",
            "controller live: {} ({}), {} I/O queues, {} namespaces",
            self.info.model, self.info.serial,
            self.io_queues.len(), self.namespaces.len()
        );
        Ok(())
    }

    /// `Probed -> Reset`: clear enable and wait for ready to drop.
    fn reset(&mut self) -> KernelResult<()> {
        self.regs.write32(regs::REG_CC, regs::cc_value(false));
        if let Err(err) = self.wait_ready(false, self.config.reset_timeout_ms) {
            self.fail(err);
            return Err(err);
        }
        self.set_state(ControllerState::Reset);
        Ok(())
    }

    /// `Reset -> AdminUp`: admin queues in DMA memory, bases and depths
    /// programmed.
    fn create_admin_queue(&mut self) -> KernelResult<()> {
        let depth = 32u32.min(self.caps.max_entries()) as u16;
        let admin = QueuePair::new(0, depth, self.regs.clone(), self.caps.dstrd, self.hal.clone())?;
        self.regs.write32(regs::REG_AQA, regs::aqa_value(depth, depth));
        self.regs.write64(regs::REG_ASQ, admin.sq_base().as_u64());
        self.regs.write64(regs::REG_ACQ, admin.cq_base().as_u64());
        self.admin = Some(Arc::new(admin));
        self.set_state(ControllerState::AdminUp);
        Ok(())
    }

    /// `AdminUp -> Enabled`: set enable, wait for ready within the
    /// controller-advertised deadline.
    fn enable(&mut self) -> KernelResult<()> {
        self.regs.write32(regs::REG_CC, regs::cc_value(true));
        let timeout = self.caps.ready_timeout_ms().max(500);
        if let Err(err) = self.wait_ready(true, timeout) {
            self.fail(err);
            return Err(err);
        }
        self.set_state(ControllerState::Enabled);
        Ok(())
    }

    /// `Enabled -> Identified`: fetch and record the controller data
    /// structure.
    fn identify(&mut self) -> KernelResult<()> {
        let buf = self.hal.dma_alloc(PAGE_SIZE).ok_or(KernelError::OutOfMemory)?;
        let mut cmd = SqEntry::new(AdminOpcode::Identify as u8);
        cmd.prp1 = buf.paddr().as_u64();
        cmd.cdw10 = cns::CONTROLLER;
        let outcome = self.sync_admin(cmd);
        if let Err(err) = outcome {
            self.hal.dma_free(buf);
            return Err(err);
        }
        let bytes = unsafe { core::slice::from_raw_parts(buf.vaddr().as_ptr(), PAGE_SIZE) };
        self.info = ControllerInfo::parse(bytes);
        self.hal.dma_free(buf);
        self.set_state(ControllerState::Identified);
        Ok(())
    }

    /// `Identified -> QueuesUp`: negotiate the queue count and create
    /// one CQ/SQ pair per granted queue, completion queue first.
    fn create_io_queues(&mut self) -> KernelResult<()> {
        let desired = (self.hal.cpu_count() as u16)
            .min(self.config.max_io_queues)
            .max(1);
        let mut cmd = SqEntry::new(AdminOpcode::SetFeatures as u8);
        cmd.cdw10 = feature::NUM_QUEUES;
        cmd.cdw11 = ((desired as u32 - 1) << 16) | (desired as u32 - 1);
        let reply = self.sync_admin(cmd)?;
        let granted_sq = ((reply.result & 0xFFFF) + 1).min(u16::MAX as u32) as u16;
        let granted_cq = ((reply.result >> 16) + 1).min(u16::MAX as u32) as u16;
        let granted = desired.min(granted_sq).min(granted_cq);
        log::debug!(target: "nvme", "queue grant: asked {}, got {}", desired, granted);

        let depth = (self.config.io_queue_depth as u32)
            .min(self.caps.max_entries())
            .max(2) as u16;
        for qid in 1..=granted {
            let qp = Arc::new(QueuePair::new(
                qid,
                depth,
                self.regs.clone(),
                self.caps.dstrd,
                self.hal.clone(),
            )?);

            // CQ first; the SQ names its CQ by id.
            let mut create_cq = SqEntry::new(AdminOpcode::CreateIoCq as u8);
            create_cq.prp1 = qp.cq_base().as_u64();
            create_cq.cdw10 = ((depth as u32 - 1) << 16) | qid as u32;
            create_cq.cdw11 = 1; // physically contiguous, polled
            self.sync_admin(create_cq)?;

            let mut create_sq = SqEntry::new(AdminOpcode::CreateIoSq as u8);
            create_sq.prp1 = qp.sq_base().as_u64();
            create_sq.cdw10 = ((depth as u32 - 1) << 16) | qid as u32;
            create_sq.cdw11 = 1 | ((qid as u32) << 16); // contiguous, bound to CQ qid
            self.sync_admin(create_sq)?;

            self.io_queues.push(qp);
        }
        self.set_state(ControllerState::QueuesUp);
        Ok(())
    }

    /// Lend host memory when the controller asks for it. Failure is
    /// logged, never fatal.
    fn setup_hmb(&mut self) {
        if self.info.hmpre == 0 || self.config.hmb_max_pages == 0 {
            return;
        }
        let pages = self.info.hmpre.min(self.config.hmb_max_pages);
        let buffer = match self.hal.dma_alloc(pages as usize * PAGE_SIZE) {
            Some(region) => region,
            None => {
                log::warn!(target: "nvme", "HMB allocation of {} pages failed", pages);
                return;
            }
        };
        let descriptors = match self.hal.dma_alloc(PAGE_SIZE) {
            Some(region) => region,
            None => {
                self.hal.dma_free(buffer);
                return;
            }
        };
        // One descriptor: buffer address and size in pages.
        unsafe {
            let desc = descriptors.vaddr().as_ptr() as *mut u64;
            desc.write(buffer.paddr().as_u64());
            (desc.add(1) as *mut u32).write(pages);
        }

        let mut cmd = SqEntry::new(AdminOpcode::SetFeatures as u8);
        cmd.cdw10 = feature::HOST_MEMORY_BUFFER;
        cmd.cdw11 = 1; // enable host memory
        cmd.cdw12 = pages; // size in memory-page units
        cmd.cdw13 = descriptors.paddr().as_u64() as u32;
        cmd.cdw14 = (descriptors.paddr().as_u64() >> 32) as u32;
        cmd.cdw15 = 1; // descriptor entry count
        match self.sync_admin(cmd) {
            Ok(_) => {
                log::debug!(target: "nvme", "HMB enabled: {} pages", pages);
                self.hmb = Some(HostMemoryBuffer { descriptors, buffer, pages });
            }
            Err(err) => {
                log::warn!(target: "nvme", "HMB setup rejected: {}", err);
                self.hal.dma_free(descriptors);
                self.hal.dma_free(buffer);
            }
        }
    }

    /// Turn on the volatile write cache when one exists.
    fn setup_write_cache(&mut self) {
        if self.info.vwc == 0 || !self.config.enable_write_cache {
            return;
        }
        let mut cmd = SqEntry::new(AdminOpcode::SetFeatures as u8);
        cmd.cdw10 = feature::VOLATILE_WRITE_CACHE;
        cmd.cdw11 = 1;
        if let Err(err) = self.sync_admin(cmd) {
            log::warn!(target: "nvme", "write cache enable rejected: {}", err);
        }
    }

    /// `QueuesUp -> Live`: accept every namespace with a nonzero size.
    fn scan_namespaces(&mut self) -> KernelResult<()> {
        let buf = self.hal.dma_alloc(PAGE_SIZE).ok_or(KernelError::OutOfMemory)?;
        for nsid in 1..=self.info.nn {
            let mut cmd = SqEntry::new(AdminOpcode::Identify as u8);
            cmd.nsid = nsid;
            cmd.prp1 = buf.paddr().as_u64();
            cmd.cdw10 = cns::NAMESPACE;
            match self.sync_admin(cmd) {
                Ok(_) => {}
                Err(KernelError::DeviceError { .. }) => continue,
                Err(err) => {
                    self.hal.dma_free(buf);
                    return Err(err);
                }
            }
            let bytes = unsafe { core::slice::from_raw_parts(buf.vaddr().as_ptr(), PAGE_SIZE) };
            let nsze = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
            if nsze == 0 {
                continue;
            }
            let flbas = bytes[26] & 0x0F;
            let lbaf = u32::from_le_bytes(
                bytes[128 + 4 * flbas as usize..132 + 4 * flbas as usize].try_into().unwrap(),
            );
            let lbads = ((lbaf >> 16) & 0xFF) as u8;
            self.namespaces.push(Namespace { id: nsid, blocks: nsze, lba_size: 1 << lbads });
        }
        self.hal.dma_free(buf);
        Ok(())
    }

    /// Read `blocks` logical blocks starting at `lba` into the buffer.
    pub fn read(
        &self,
        nsid: u32,
        lba: u64,
        blocks: u16,
        buf: VirtAddr,
        len: usize,
        cpu: usize,
    ) -> KernelResult<()> {
        self.submit_io(IoOpcode::Read, nsid, lba, blocks, buf, len, cpu)
    }

    /// Write `blocks` logical blocks starting at `lba` from the buffer.
    pub fn write(
        &self,
        nsid: u32,
        lba: u64,
        blocks: u16,
        buf: VirtAddr,
        len: usize,
        cpu: usize,
    ) -> KernelResult<()> {
        self.submit_io(IoOpcode::Write, nsid, lba, blocks, buf, len, cpu)
    }

    /// Flush the namespace's volatile write cache.
    pub fn flush(&self, nsid: u32, cpu: usize) -> KernelResult<()> {
        self.namespace(nsid).ok_or(KernelError::NotFound)?;
        let queue = self.io_queue_for(cpu)?;
        let mut cmd = SqEntry::new(IoOpcode::Flush as u8);
        cmd.nsid = nsid;
        self.sync_command(&queue, cmd, self.config.io_timeout_ms).map(|_| ())
    }

    fn submit_io(
        &self,
        opcode: IoOpcode,
        nsid: u32,
        lba: u64,
        blocks: u16,
        buf: VirtAddr,
        len: usize,
        cpu: usize,
    ) -> KernelResult<()> {
        let ns = self.namespace(nsid).ok_or(KernelError::NotFound)?;
        if blocks == 0 || len < blocks as usize * ns.lba_size as usize {
            return Err(KernelError::InvalidArgument);
        }
        if lba + blocks as u64 > ns.blocks {
            return Err(KernelError::InvalidArgument);
        }
        if let Some(limit) = self.info.max_transfer_bytes() {
            if blocks as usize * ns.lba_size as usize > limit {
                return Err(KernelError::InvalidArgument);
            }
        }
        let queue = self.io_queue_for(cpu)?;
        let prps = PrpSet::build(&self.hal, buf, blocks as usize * ns.lba_size as usize)?;

        let mut cmd = SqEntry::new(opcode as u8);
        cmd.nsid = nsid;
        cmd.prp1 = prps.prp1;
        cmd.prp2 = prps.prp2;
        cmd.cdw10 = lba as u32;
        cmd.cdw11 = (lba >> 32) as u32;
        cmd.cdw12 = blocks as u32 - 1; // zero-based count
        self.sync_command(&queue, cmd, self.config.io_timeout_ms)?;
        Ok(())
    }

    fn io_queue_for(&self, cpu: usize) -> KernelResult<Arc<QueuePair>> {
        if self.io_queues.is_empty() {
            return Err(KernelError::NotFound);
        }
        Ok(self.io_queues[cpu % self.io_queues.len()].clone())
    }

    fn sync_admin(&self, cmd: SqEntry) -> KernelResult<CqEntry> {
        let admin = self.admin.as_ref().ok_or(KernelError::InvalidArgument)?.clone();
        self.sync_command(&admin, cmd, self.config.admin_timeout_ms)
    }

    /// Submit and wait. The queue lock is only held inside `submit` and
    /// `poll`; between polls the caller sleeps with no locks held, so
    /// other submitters are never serialized behind a slow command.
    fn sync_command(
        &self,
        queue: &QueuePair,
        cmd: SqEntry,
        timeout_ms: u64,
    ) -> KernelResult<CqEntry> {
        if self.state() == ControllerState::Dead {
            return Err(KernelError::ControllerDead);
        }
        let cid = queue.submit(cmd)?;
        let deadline = self.hal.now_ns() + timeout_ms.saturating_mul(1_000_000);
        loop {
            queue.poll();
            if let Some(entry) = queue.take_completion(cid) {
                return entry.to_result();
            }
            let csts = Csts::from_bits_truncate(self.regs.read32(regs::REG_CSTS));
            if csts.contains(Csts::CFS) {
                self.fail(KernelError::ControllerDead);
                return Err(KernelError::ControllerDead);
            }
            if self.hal.now_ns() >= deadline {
                queue.abandon(cid);
                log::warn!(
                    target: "nvme",
                    "command {:#x} on queue {} timed out after {} ms",
                    cmd.opcode(), queue.qid(), timeout_ms
                );
                return Err(KernelError::Timeout);
            }
            self.hal.sleep_ms(1);
        }
    }

    /// Poll for ready (or not-ready) with a deadline; CFS at any point
    /// is fatal.
    fn wait_ready(&self, want_ready: bool, timeout_ms: u64) -> KernelResult<()> {
        let deadline = self.hal.now_ns() + timeout_ms.saturating_mul(1_000_000);
        loop {
            let csts = Csts::from_bits_truncate(self.regs.read32(regs::REG_CSTS));
            if csts.contains(Csts::CFS) {
                return Err(KernelError::ControllerDead);
            }
            if csts.contains(Csts::READY) == want_ready {
                return Ok(());
            }
            if self.hal.now_ns() >= deadline {
                return Err(KernelError::Timeout);
            }
            self.hal.sleep_ms(1);
        }
    }

    /// Transition to `Dead` and fail everything outstanding.
    fn fail(&self, err: KernelError) {
        log::error!(target: "nvme", "controller failed: {}", err);
        self.set_state(ControllerState::Dead);
        if let Some(admin) = &self.admin {
            admin.drain();
        }
        for queue in &self.io_queues {
            queue.drain();
        }
    }
}

impl Drop for NvmeController {
    fn drop(&mut self) {
        if let Some(hmb) = self.hmb.take() {
            self.hal.dma_free(hmb.descriptors);
            self.hal.dma_free(hmb.buffer);
        }
    }
}
