//! Driver framework glue.
//!
//! Device records, the driver trait and the registry that binds them.
//! The hot-plug core creates records from bus scans and asks the
//! registry to match and probe; outside drivers register themselves
//! here. Lookup is a linear walk over the registered set, which is
//! fine at the driver counts a kernel actually has.

pub mod hotplug;
pub mod nvme;
pub mod pci;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::fmt;
use spin::RwLock;

use crate::error::{KernelError, KernelResult};

/// Stable bus coordinate of a device. The variant set is closed and
/// small, so a tagged enum rather than a discriminated struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BusCoord {
    /// PCIe segment/bus/device/function.
    Pci { segment: u16, bus: u8, device: u8, function: u8 },
    /// USB host controller index and port.
    Usb { controller: u16, port: u16 },
}

impl fmt::Display for BusCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusCoord::Pci { segment, bus, device, function } => {
                write!(f, "pci {:04x}:{:02x}:{:02x}.{:x}", segment, bus, device, function)
            }
            BusCoord::Usb { controller, port } => {
                write!(f, "usb {}-{}", controller, port)
            }
        }
    }
}

/// PCI-style class triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassCode {
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
}

impl ClassCode {
    pub const fn new(class: u8, subclass: u8, prog_if: u8) -> Self {
        Self { class, subclass, prog_if }
    }
}

/// Device lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Seen on the bus, not yet bound.
    Arriving,
    /// Driver bound and probed.
    Active,
    /// Seen leaving; removal event pending or in processing.
    Removing,
    /// Gone.
    Removed,
    /// Bind failed; left alone until explicit intervention.
    Failed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Arriving => write!(f, "arriving"),
            DeviceState::Active => write!(f, "active"),
            DeviceState::Removing => write!(f, "removing"),
            DeviceState::Removed => write!(f, "removed"),
            DeviceState::Failed => write!(f, "failed"),
        }
    }
}

/// Typed index of a device record in the hot-plug table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId(pub(crate) u32);

/// One discovered device.
#[derive(Clone)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: String,
    pub coord: BusCoord,
    pub vendor: u16,
    pub product: u16,
    pub class: ClassCode,
    pub state: DeviceState,
    /// HAL timestamp of first detection.
    pub detected_ns: u64,
    /// Name of the bound driver, if any.
    pub driver: Option<&'static str>,
}

impl DeviceRecord {
    /// Human-readable vendor name for the record's display name.
    pub fn vendor_name(vendor: u16) -> &'static str {
        match vendor {
            0x8086 => "Intel",
            0x1022 | 0x1002 => "AMD",
            0x10DE => "NVIDIA",
            0x144D => "Samsung",
            0x1C5C => "SK hynix",
            0x1B36 | 0x1234 => "QEMU",
            0x1AF4 => "Virtio",
            0x15AD => "VMware",
            _ => "Unknown",
        }
    }
}

/// A driver: a match predicate over device records plus a probe entry
/// point. Probe may block; it always runs on the hot-plug event
/// thread, never on the detection thread.
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this driver wants the device.
    fn matches(&self, device: &DeviceRecord) -> bool;

    /// Take ownership of the device. An error fails the bind.
    fn probe(&self, device: &DeviceRecord) -> KernelResult<()>;

    /// The device is going away; release its resources.
    fn remove(&self, device: &DeviceRecord) {
        let _ = device;
    }
}

/// The set of registered drivers. Registration is idempotent by driver
/// name.
pub struct DriverRegistry {
    drivers: RwLock<Vec<Arc<dyn Driver>>>,
}

impl DriverRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { drivers: RwLock::new(Vec::new()) })
    }

    /// Add a driver; re-registering the same name replaces nothing and
    /// is harmless.
    pub fn register(&self, driver: Arc<dyn Driver>) {
        let mut drivers = self.drivers.write();
        if drivers.iter().any(|d| d.name() == driver.name()) {
            return;
        }
        log::info!(target: "driver", "registered driver {}", driver.name());
        drivers.push(driver);
    }

    pub fn len(&self) -> usize {
        self.drivers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.read().is_empty()
    }

    /// First registered driver matching the record.
    pub fn find(&self, device: &DeviceRecord) -> Option<Arc<dyn Driver>> {
        self.drivers.read().iter().find(|d| d.matches(device)).cloned()
    }

    /// Match and probe. On success the bound driver's name is returned;
    /// `BindFailure` covers both no-match and probe errors.
    pub fn bind(&self, device: &DeviceRecord) -> KernelResult<&'static str> {
        let driver = self.find(device).ok_or(KernelError::BindFailure)?;
        match driver.probe(device) {
            Ok(()) => Ok(driver.name()),
            Err(err) => {
                log::warn!(
                    target: "driver",
                    "probe of {} by {} failed: {}",
                    device.coord, driver.name(), err
                );
                Err(KernelError::BindFailure)
            }
        }
    }

    /// Detach callback for a departing device.
    pub fn detach(&self, device: &DeviceRecord) {
        if let Some(name) = device.driver {
            if let Some(driver) = self.drivers.read().iter().find(|d| d.name() == name) {
                driver.remove(device);
            }
        }
    }
}
