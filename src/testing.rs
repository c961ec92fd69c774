//! Test doubles for the host environment.
//!
//! [`MockBus`] backs register windows and DMA allocations with ordinary
//! heap memory keyed by fake physical addresses, so tests can preload
//! register files, inspect what the driver wrote, and play the device
//! side against the real ring bytes. [`LegacyPortModel`] is a small
//! reactive model of the transitional port-I/O register block.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::DeviceType;
use crate::VirtioError;
use crate::bus::DmaBuf;
use crate::bus::HostBus;
use crate::bus::MmioSlot;
use crate::bus::PciAddress;
use crate::probe::VIRTIO_PCI_VENDOR;
use crate::transports::VIRTIO_STATUS_FEAT_OK;
use crate::transports::VIRTIO_STATUS_NEEDS_RESET;
use crate::transports::mmio::MMIO_WINDOW_LEN;
use crate::transports::mmio::VIRTIO_MMIO_MAGIC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortOp {
    Write8(u32, u8),
    Write16(u32, u16),
    Write32(u32, u32),
}

/// A reactive legacy virtio-pci function behind a port base. Registers
/// that tests do not need read as zero.
pub(crate) struct LegacyPortModel {
    pub base: u32,
    pub status: u8,
    pub device_features: u32,
    pub driver_features: u32,
    pub queue_sel: u16,
    pub queue_sizes: Vec<u16>,
    pub queue_pfn: Vec<u32>,
    pub notified: Vec<u16>,
    /// Pending interrupt bits; reading the ISR register clears them.
    pub isr: u8,
    /// Clear FEATURES_OK whenever the driver sets it.
    pub reject_features: bool,
    /// Never settle after a reset write.
    pub stuck_reset: bool,
}

impl LegacyPortModel {
    pub fn new(base: u32, num_queues: usize) -> LegacyPortModel {
        LegacyPortModel {
            base,
            status: 0,
            device_features: 0,
            driver_features: 0,
            queue_sel: 0,
            queue_sizes: vec![256; num_queues],
            queue_pfn: vec![0; num_queues],
            notified: Vec::new(),
            isr: 0,
            reject_features: false,
            stuck_reset: false,
        }
    }

    fn contains(&self, port: u32) -> bool {
        (self.base..self.base + 0x100).contains(&port)
    }

    fn read8(&mut self, off: usize) -> u8 {
        match off {
            0x12 => self.status,
            0x13 => std::mem::take(&mut self.isr),
            _ => 0,
        }
    }

    fn read16(&mut self, off: usize) -> u16 {
        match off {
            0x0c => self.queue_sizes[self.queue_sel as usize],
            0x0e => self.queue_sel,
            _ => 0,
        }
    }

    fn read32(&mut self, off: usize) -> u32 {
        match off {
            0x00 => self.device_features,
            0x08 => self.queue_pfn[self.queue_sel as usize],
            _ => 0,
        }
    }

    fn write8(&mut self, off: usize, value: u8) {
        if off != 0x12 {
            return;
        }
        if value == 0 {
            self.status = if self.stuck_reset {
                VIRTIO_STATUS_NEEDS_RESET
            } else {
                0
            };
            return;
        }
        let mut value = value;
        if self.reject_features {
            value &= !VIRTIO_STATUS_FEAT_OK;
        }
        self.status = value;
    }

    fn write16(&mut self, off: usize, value: u16) {
        match off {
            0x0e => self.queue_sel = value,
            0x10 => self.notified.push(value),
            _ => {}
        }
    }

    fn write32(&mut self, off: usize, value: u32) {
        match off {
            0x04 => self.driver_features = value,
            0x08 => self.queue_pfn[self.queue_sel as usize] = value,
            _ => {}
        }
    }
}

// Owns its buffer as a raw allocation so the driver and the test's
// device side can both write through shared references.
struct PhysRegion {
    base: u64,
    len: usize,
    ptr: *mut u8,
    words: usize,
}

impl PhysRegion {
    fn new(base: u64, len: usize) -> PhysRegion {
        // u64 words keep the backing buffer aligned for ring accesses.
        let words = len.div_ceil(8);
        let buf = vec![0u64; words].into_boxed_slice();
        PhysRegion {
            base,
            len,
            ptr: Box::into_raw(buf) as *mut u8,
            words,
        }
    }

    fn ptr_at(&self, paddr: u64) -> *mut u8 {
        let offset = (paddr - self.base) as usize;
        unsafe { self.ptr.add(offset) }
    }
}

impl Drop for PhysRegion {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr as *mut u64, self.words);
        drop(unsafe { Box::from_raw(slice) });
    }
}

unsafe impl Send for PhysRegion {}
unsafe impl Sync for PhysRegion {}

pub(crate) struct MockBus {
    pci: bool,
    slots: Vec<MmioSlot>,
    mem: Mutex<Vec<PhysRegion>>,
    next_dma: Mutex<u64>,
    config: Mutex<BTreeMap<PciAddress, [u8; 256]>>,
    ports: Mutex<BTreeMap<u32, u32>>,
    port_device: Mutex<Option<LegacyPortModel>>,
    pub port_log: Mutex<Vec<PortOp>>,
    pub map_calls: AtomicUsize,
    pub unmap_calls: AtomicUsize,
}

impl MockBus {
    pub fn new_pci() -> MockBus {
        MockBus::new(true, Vec::new())
    }

    pub fn new_mmio(slots: Vec<MmioSlot>) -> MockBus {
        MockBus::new(false, slots)
    }

    fn new(pci: bool, slots: Vec<MmioSlot>) -> MockBus {
        MockBus {
            pci,
            slots,
            mem: Mutex::new(Vec::new()),
            next_dma: Mutex::new(0x4000_0000),
            config: Mutex::new(BTreeMap::new()),
            ports: Mutex::new(BTreeMap::new()),
            port_device: Mutex::new(None),
            port_log: Mutex::new(Vec::new()),
            map_calls: AtomicUsize::new(0),
            unmap_calls: AtomicUsize::new(0),
        }
    }

    /// Adds a zeroed fake-physical region at `base`.
    pub fn add_region(&self, base: u64, len: usize) {
        self.mem.lock().unwrap().push(PhysRegion::new(base, len));
    }

    /// The host pointer backing `paddr`. Panics if no region covers it.
    pub fn region_ptr(&self, paddr: u64) -> *mut u8 {
        self.find_region(paddr, 1).expect("no region covers paddr")
    }

    fn find_region(&self, paddr: u64, len: usize) -> Option<*mut u8> {
        let mem = self.mem.lock().unwrap();
        mem.iter()
            .find(|r| paddr >= r.base && paddr + len as u64 <= r.base + r.len as u64)
            .map(|r| r.ptr_at(paddr))
    }

    pub fn read_mem(&self, paddr: u64, out: &mut [u8]) {
        let ptr = self.region_ptr(paddr);
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = unsafe { std::ptr::read_volatile(ptr.add(i)) };
        }
    }

    fn write_mem(&self, paddr: u64, bytes: &[u8]) {
        let ptr = self.region_ptr(paddr);
        for (i, byte) in bytes.iter().enumerate() {
            unsafe { std::ptr::write_volatile(ptr.add(i), *byte) };
        }
    }

    pub fn store16_le(&self, paddr: u64, value: u16) {
        self.write_mem(paddr, &value.to_le_bytes());
    }

    pub fn store32_le(&self, paddr: u64, value: u32) {
        self.write_mem(paddr, &value.to_le_bytes());
    }

    pub fn load16_le(&self, paddr: u64) -> u16 {
        let mut bytes = [0; 2];
        self.read_mem(paddr, &mut bytes);
        u16::from_le_bytes(bytes)
    }

    pub fn load32_le(&self, paddr: u64) -> u32 {
        let mut bytes = [0; 4];
        self.read_mem(paddr, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    pub fn load64_le(&self, paddr: u64) -> u64 {
        let mut bytes = [0; 8];
        self.read_mem(paddr, &mut bytes);
        u64::from_le_bytes(bytes)
    }

    pub fn set_port32(&self, port: u32, value: u32) {
        self.ports.lock().unwrap().insert(port, value);
    }

    pub fn install_port_device(&self, model: LegacyPortModel) {
        *self.port_device.lock().unwrap() = Some(model);
    }

    pub fn port_device_state<R>(&self, f: impl FnOnce(&LegacyPortModel) -> R) -> R {
        let guard = self.port_device.lock().unwrap();
        f(guard.as_ref().expect("no port device installed"))
    }

    pub fn config_store8(&self, addr: PciAddress, offset: u8, value: u8) {
        let mut config = self.config.lock().unwrap();
        config.entry(addr).or_insert([0; 256])[offset as usize] = value;
    }

    pub fn config_store32(&self, addr: PciAddress, offset: u8, value: u32) {
        let mut config = self.config.lock().unwrap();
        let space = config.entry(addr).or_insert([0; 256]);
        space[offset as usize..offset as usize + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn config_load32(&self, addr: PciAddress, offset: u8) -> u32 {
        let config = self.config.lock().unwrap();
        match config.get(&addr) {
            Some(space) => {
                let off = (offset & 0xfc) as usize;
                u32::from_le_bytes(space[off..off + 4].try_into().unwrap())
            }
            None => !0,
        }
    }
}

impl HostBus for MockBus {
    fn port_read8(&self, port: u32) -> u8 {
        let mut device = self.port_device.lock().unwrap();
        match device.as_mut() {
            Some(model) if model.contains(port) => model.read8((port - model.base) as usize),
            _ => 0xff,
        }
    }

    fn port_read16(&self, port: u32) -> u16 {
        let mut device = self.port_device.lock().unwrap();
        match device.as_mut() {
            Some(model) if model.contains(port) => model.read16((port - model.base) as usize),
            _ => 0xffff,
        }
    }

    fn port_read32(&self, port: u32) -> u32 {
        let mut device = self.port_device.lock().unwrap();
        match device.as_mut() {
            Some(model) if model.contains(port) => {
                return model.read32((port - model.base) as usize);
            }
            _ => {}
        }
        self.ports.lock().unwrap().get(&port).copied().unwrap_or(!0)
    }

    fn port_write8(&self, port: u32, value: u8) {
        self.port_log.lock().unwrap().push(PortOp::Write8(port, value));
        let mut device = self.port_device.lock().unwrap();
        if let Some(model) = device.as_mut()
            && model.contains(port)
        {
            model.write8((port - model.base) as usize, value);
        }
    }

    fn port_write16(&self, port: u32, value: u16) {
        self.port_log.lock().unwrap().push(PortOp::Write16(port, value));
        let mut device = self.port_device.lock().unwrap();
        if let Some(model) = device.as_mut()
            && model.contains(port)
        {
            model.write16((port - model.base) as usize, value);
        }
    }

    fn port_write32(&self, port: u32, value: u32) {
        self.port_log.lock().unwrap().push(PortOp::Write32(port, value));
        let mut device = self.port_device.lock().unwrap();
        if let Some(model) = device.as_mut()
            && model.contains(port)
        {
            model.write32((port - model.base) as usize, value);
            return;
        }
        drop(device);
        self.ports.lock().unwrap().insert(port, value);
    }

    fn pci_present(&self) -> bool {
        self.pci
    }

    fn pci_config_read32(&self, addr: PciAddress, offset: u8) -> u32 {
        self.config_load32(addr, offset)
    }

    fn pci_config_write32(&self, addr: PciAddress, offset: u8, value: u32) {
        self.config_store32(addr, offset & 0xfc, value);
    }

    fn mmio_slots(&self) -> Vec<MmioSlot> {
        self.slots.clone()
    }

    fn map(&self, paddr: u64, len: usize) -> Result<NonNull<u8>, VirtioError> {
        match self.find_region(paddr, len) {
            Some(ptr) => {
                self.map_calls.fetch_add(1, Ordering::SeqCst);
                Ok(NonNull::new(ptr).unwrap())
            }
            None => Err(VirtioError::Fault),
        }
    }

    fn unmap(&self, _paddr: u64, _len: usize) {
        self.unmap_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn alloc_dma(&self, len: usize) -> Result<DmaBuf, VirtioError> {
        let len = len.next_multiple_of(4096);
        let paddr = {
            let mut next = self.next_dma.lock().unwrap();
            let paddr = *next;
            // A guard page's worth of slack between allocations.
            *next += len as u64 + 4096;
            paddr
        };
        self.add_region(paddr, len);
        let vaddr = NonNull::new(self.region_ptr(paddr)).unwrap();
        Ok(DmaBuf { vaddr, paddr, len })
    }

    fn free_dma(&self, buf: DmaBuf) {
        self.mem.lock().unwrap().retain(|r| r.base != buf.paddr);
    }
}

/// Seeds a virtio-mmio register file at `base`. The registers are dumb
/// memory, which is enough for probing and status-machine tests.
pub(crate) fn install_mmio_device(mock: &MockBus, base: u64, version: u32, device_id: u32) {
    mock.add_region(base, MMIO_WINDOW_LEN);
    mock.store32_le(base, VIRTIO_MMIO_MAGIC);
    mock.store32_le(base + 0x04, version);
    mock.store32_le(base + 0x08, device_id);
    mock.store32_le(base + 0x34, 256);
}

fn write_virtio_cap(
    mock: &MockBus,
    addr: PciAddress,
    off: u8,
    next: u8,
    cfg_type: u8,
    bar: u8,
    offset: u32,
    length: u32,
) {
    mock.config_store8(addr, off, 0x09);
    mock.config_store8(addr, off + 1, next);
    mock.config_store8(addr, off + 2, 16);
    mock.config_store8(addr, off + 3, cfg_type);
    mock.config_store8(addr, off + 4, bar);
    mock.config_store32(addr, off + 8, offset);
    mock.config_store32(addr, off + 12, length);
}

/// Seeds a modern virtio PCI function: a 64-bit memory BAR 0 with the
/// common/notify/isr/device windows at 0x0000/0x3000/0x1000/0x2000 and a
/// notify-offset multiplier of 4. `feature_word` lands in the (dumb)
/// device-feature register, so both selector halves read it.
pub(crate) fn install_modern_function(
    mock: &MockBus,
    addr: PciAddress,
    device_id: u16,
    irq: u8,
    bar_base: u64,
    feature_word: u32,
) {
    mock.config_store32(addr, 0x00, (device_id as u32) << 16 | VIRTIO_PCI_VENDOR as u32);
    // Capability-list bit in the status half of the command/status dword.
    mock.config_store32(addr, 0x04, 0x0010_0000);
    mock.config_store32(addr, 0x3c, irq as u32);
    mock.config_store32(addr, 0x10, (bar_base as u32) | 0x4);
    mock.config_store32(addr, 0x14, (bar_base >> 32) as u32);
    mock.config_store32(addr, 0x34, 0x40);

    write_virtio_cap(mock, addr, 0x40, 0x50, 1, 0, 0x0000, 0x100);
    write_virtio_cap(mock, addr, 0x50, 0x64, 2, 0, 0x3000, 0x100);
    mock.config_store32(addr, 0x50 + 16, 4);
    write_virtio_cap(mock, addr, 0x64, 0x74, 3, 0, 0x1000, 0x10);
    write_virtio_cap(mock, addr, 0x74, 0x00, 4, 0, 0x2000, 0x100);

    mock.add_region(bar_base, 0x4000);
    // Device features and a plausible queue maximum in the common window.
    mock.store32_le(bar_base + 0x04, feature_word);
    mock.store16_le(bar_base + 0x18, 256);
}

/// Seeds a transitional function with no vendor capabilities and an I/O
/// BAR 0 backed by a [`LegacyPortModel`] offering every feature bit.
pub(crate) fn install_legacy_function(
    mock: &MockBus,
    addr: PciAddress,
    device_id: u16,
    class: DeviceType,
    irq: u8,
    io_base: u32,
) {
    mock.config_store32(addr, 0x00, (device_id as u32) << 16 | VIRTIO_PCI_VENDOR as u32);
    mock.config_store32(addr, 0x04, 0);
    mock.config_store32(addr, 0x2c, class.to_id() << 16);
    mock.config_store32(addr, 0x3c, irq as u32);
    mock.config_store32(addr, 0x10, io_base | 1);

    let mut model = LegacyPortModel::new(io_base, 2);
    model.device_features = !0;
    mock.install_port_device(model);
}
