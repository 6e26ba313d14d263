//! Hot-plug device enumeration core.
//!
//! A detection pass scans every registered bus and diffs the result
//! against the device table: new coordinates become `Arriving` records
//! with an arrival event, vanished ones (a port gone vacant, a config
//! read answering all-ones) become removals. Events travel through a
//! fixed-capacity queue to the event pass, which binds drivers on
//! arrivals and retires records on removals.
//!
//! The two passes are each single-threaded and share nothing but the
//! bounded queue and the device table. Driver probe runs on the event
//! side only, so the detection loop never blocks on a slow driver, and
//! no lock is held across a bus scan.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::{BusCoord, ClassCode, DeviceId, DeviceRecord, DeviceState, DriverRegistry};
use crate::hal::Hal;

/// Fixed capacity of the event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Hot-plug tunables.
#[derive(Debug, Clone, Copy)]
pub struct HotplugConfig {
    /// Bus-scan cadence of the detection loop.
    pub poll_interval_ms: u64,
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 50 }
    }
}

/// An event as it travels through the bounded queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    DeviceArrival(DeviceId),
    DeviceRemoval(DeviceId),
}

/// What a bus reports for one present device.
#[derive(Debug, Clone)]
pub struct BusDevice {
    pub coord: BusCoord,
    pub vendor: u16,
    pub product: u16,
    pub class: ClassCode,
}

/// A scannable bus. The PCIe implementation lives here; USB host
/// controllers provide their own from outside the core.
pub trait Bus: Send + Sync {
    fn name(&self) -> &'static str;

    /// Snapshot of every device currently visible on the bus.
    fn scan(&self) -> Vec<BusDevice>;
}

/// PCIe as a hot-pluggable bus: enumeration over configuration space.
pub struct PciBus {
    cfg: Arc<dyn super::pci::ConfigSpace>,
    segment: u16,
    max_bus: u8,
}

impl PciBus {
    pub fn new(cfg: Arc<dyn super::pci::ConfigSpace>, segment: u16, max_bus: u8) -> Self {
        Self { cfg, segment, max_bus }
    }
}

impl Bus for PciBus {
    fn name(&self) -> &'static str {
        "pcie"
    }

    fn scan(&self) -> Vec<BusDevice> {
        super::pci::enumerate(self.cfg.as_ref(), self.segment, self.max_bus)
            .into_iter()
            .map(|f| BusDevice {
                coord: f.coord,
                vendor: f.vendor,
                product: f.device,
                class: f.class,
            })
            .collect()
    }
}

/// Usage counters and queue health.
#[derive(Debug, Clone, Default)]
pub struct HotplugStats {
    pub devices: usize,
    pub active: usize,
    pub failed: usize,
    pub queued_events: usize,
    pub arrivals_seen: u64,
    pub removals_seen: u64,
    pub dropped_events: u64,
}

struct Entry {
    record: DeviceRecord,
    /// A removal was detected but its event still needs queue space.
    removal_queued: bool,
}

struct DeviceTable {
    slots: Vec<Option<Entry>>,
    free: Vec<u32>,
    by_coord: BTreeMap<BusCoord, DeviceId>,
}

impl DeviceTable {
    fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), by_coord: BTreeMap::new() }
    }

    fn insert(&mut self, record: DeviceRecord) -> DeviceId {
        let coord = record.coord;
        let entry = Entry { record, removal_queued: false };
        let id = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(entry);
                DeviceId(idx)
            }
            None => {
                self.slots.push(Some(entry));
                DeviceId(self.slots.len() as u32 - 1)
            }
        };
        self.slots[id.0 as usize].as_mut().unwrap().record.id = id;
        self.by_coord.insert(coord, id);
        id
    }

    fn remove(&mut self, id: DeviceId) -> Option<DeviceRecord> {
        let entry = self.slots.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        self.by_coord.remove(&entry.record.coord);
        Some(entry.record)
    }

    fn get(&self, id: DeviceId) -> Option<&Entry> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    fn get_mut(&mut self, id: DeviceId) -> Option<&mut Entry> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }
}

/// The hot-plug manager: device table, event queue and the two passes.
pub struct HotplugManager {
    hal: Arc<dyn Hal>,
    registry: Arc<DriverRegistry>,
    config: HotplugConfig,
    buses: Mutex<Vec<Arc<dyn Bus>>>,
    devices: Mutex<DeviceTable>,
    events: Mutex<heapless::Deque<HotplugEvent, EVENT_QUEUE_CAPACITY>>,
    arrivals_seen: AtomicU64,
    removals_seen: AtomicU64,
    dropped_events: AtomicU64,
}

impl HotplugManager {
    pub fn new(
        hal: Arc<dyn Hal>,
        registry: Arc<DriverRegistry>,
        config: HotplugConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            hal,
            registry,
            config,
            buses: Mutex::new(Vec::new()),
            devices: Mutex::new(DeviceTable::new()),
            events: Mutex::new(heapless::Deque::new()),
            arrivals_seen: AtomicU64::new(0),
            removals_seen: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
        })
    }

    pub fn add_bus(&self, bus: Arc<dyn Bus>) {
        self.buses.lock().push(bus);
    }

    /// One detection pass: scan every bus with no locks held, then diff
    /// against the device table.
    pub fn detection_tick(&self) {
        let buses: Vec<Arc<dyn Bus>> = self.buses.lock().clone();
        let mut snapshot: BTreeMap<BusCoord, BusDevice> = BTreeMap::new();
        for bus in &buses {
            for device in bus.scan() {
                snapshot.insert(device.coord, device);
            }
        }

        let now = self.hal.now_ns();
        let mut devices = self.devices.lock();

        // Arrivals: coordinates the table has never seen.
        for (coord, seen) in &snapshot {
            if devices.by_coord.contains_key(coord) {
                continue;
            }
            let name = format!(
                "{} {:04x}:{:04x}",
                DeviceRecord::vendor_name(seen.vendor),
                seen.vendor,
                seen.product
            );
            let id = devices.insert(DeviceRecord {
                id: DeviceId(0),
                name,
                coord: *coord,
                vendor: seen.vendor,
                product: seen.product,
                class: seen.class,
                state: DeviceState::Arriving,
                detected_ns: now,
                driver: None,
            });
            if self.enqueue(HotplugEvent::DeviceArrival(id)) {
                self.arrivals_seen.fetch_add(1, Ordering::Relaxed);
            } else {
                // No queue space: forget the record so the next scan
                // re-detects the device.
                devices.remove(id);
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Removals: known coordinates the snapshot no longer contains.
        let known: Vec<DeviceId> = devices.by_coord.values().copied().collect();
        for id in known {
            let entry = match devices.get_mut(id) {
                Some(entry) => entry,
                None => continue,
            };
            if snapshot.contains_key(&entry.record.coord) {
                continue;
            }
            match entry.record.state {
                DeviceState::Arriving | DeviceState::Active | DeviceState::Failed => {
                    entry.record.state = DeviceState::Removing;
                    entry.removal_queued = false;
                }
                DeviceState::Removing | DeviceState::Removed => {}
            }
            if entry.record.state == DeviceState::Removing && !entry.removal_queued {
                if self.enqueue(HotplugEvent::DeviceRemoval(id)) {
                    entry.removal_queued = true;
                    self.removals_seen.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.dropped_events.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// One event pass: drain the queue, binding and retiring. Returns
    /// the number of events processed.
    pub fn event_tick(&self) -> usize {
        let mut processed = 0;
        while let Some(event) = self.pop_event() {
            match event {
                HotplugEvent::DeviceArrival(id) => self.handle_arrival(id),
                HotplugEvent::DeviceRemoval(id) => self.handle_removal(id),
            }
            processed += 1;
        }
        processed
    }

    /// The detection side of the manager, as a thread body.
    pub fn run_detection_loop(&self) -> ! {
        loop {
            self.detection_tick();
            self.hal.sleep_ms(self.config.poll_interval_ms);
        }
    }

    /// The event side of the manager, as a thread body.
    pub fn run_event_loop(&self) -> ! {
        loop {
            if self.event_tick() == 0 {
                self.hal.sleep_ms(1);
            }
        }
    }

    fn handle_arrival(&self, id: DeviceId) {
        // Snapshot the record and probe with no locks held; bind may
        // block inside a driver.
        let record = {
            let devices = self.devices.lock();
            match devices.get(id) {
                Some(entry) if entry.record.state == DeviceState::Arriving => {
                    entry.record.clone()
                }
                _ => return,
            }
        };

        let outcome = self.registry.bind(&record);
        let mut devices = self.devices.lock();
        let entry = match devices.get_mut(id) {
            Some(entry) => entry,
            None => return,
        };
        if entry.record.state != DeviceState::Arriving {
            // Removal raced the bind; the removal event cleans up.
            return;
        }
        match outcome {
            Ok(driver) => {
                entry.record.state = DeviceState::Active;
                entry.record.driver = Some(driver);
                log::info!(
                    target: "hotplug",
                    "{} ({}) active under {}",
                    entry.record.name, entry.record.coord, driver
                );
            }
            Err(_) => {
                // Left in the table; not retried until intervention.
                entry.record.state = DeviceState::Failed;
                log::warn!(
                    target: "hotplug",
                    "{} ({}) failed to bind",
                    entry.record.name, entry.record.coord
                );
            }
        }
    }

    fn handle_removal(&self, id: DeviceId) {
        let record = {
            let mut devices = self.devices.lock();
            match devices.get_mut(id) {
                Some(entry) if entry.record.state == DeviceState::Removing => {
                    entry.record.clone()
                }
                _ => return,
            }
        };
        self.registry.detach(&record);
        let mut devices = self.devices.lock();
        if let Some(entry) = devices.get_mut(id) {
            entry.record.state = DeviceState::Removed;
        }
        devices.remove(id);
        log::info!(target: "hotplug", "{} ({}) removed", record.name, record.coord);
    }

    fn enqueue(&self, event: HotplugEvent) -> bool {
        self.events.lock().push_back(event).is_ok()
    }

    fn pop_event(&self) -> Option<HotplugEvent> {
        self.events.lock().pop_front()
    }

    /// Snapshot of a device by coordinate.
    pub fn device_by_coord(&self, coord: BusCoord) -> Option<DeviceRecord> {
        let devices = self.devices.lock();
        let id = *devices.by_coord.get(&coord)?;
        devices.get(id).map(|entry| entry.record.clone())
    }

    /// Snapshot of every known device.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        let devices = self.devices.lock();
        devices
            .slots
            .iter()
            .filter_map(|slot| slot.as_ref().map(|entry| entry.record.clone()))
            .collect()
    }

    pub fn stats(&self) -> HotplugStats {
        let devices = self.devices.lock();
        let mut stats = HotplugStats {
            devices: devices.by_coord.len(),
            queued_events: self.events.lock().len(),
            arrivals_seen: self.arrivals_seen.load(Ordering::Relaxed),
            removals_seen: self.removals_seen.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            ..Default::default()
        };
        for slot in devices.slots.iter().flatten() {
            match slot.record.state {
                DeviceState::Active => stats.active += 1,
                DeviceState::Failed => stats.failed += 1,
                _ => {}
            }
        }
        stats
    }

    pub fn config(&self) -> HotplugConfig {
        self.config
    }
}
