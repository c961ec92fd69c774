//! Device discovery.
//!
//! [`find`] walks the PCI bus (or the platform's fixed virtio-mmio table
//! when there is no PCI) for the next device of a wanted class, decodes
//! its register windows, and returns a [`VirtioDevice`] ready for
//! [`VirtioDevice::bring_up`]. A [`ScanCursor`] keeps scans resumable so
//! repeated calls enumerate every matching device exactly once.

use std::sync::Arc;

use log::debug;
use log::info;

use crate::DeviceType;
use crate::VIRTIO_F_VERSION_1;
use crate::VirtioError;
use crate::bus::HostBus;
use crate::bus::MemoryWindow;
use crate::bus::MmioSlot;
use crate::bus::PciAddress;
use crate::regs::Window;
use crate::transports::VirtioTransport;
use crate::transports::mmio::MMIO_WINDOW_LEN;
use crate::transports::mmio::MmioTransport;
use crate::transports::pci::PciLegacy;
use crate::transports::pci::PciModern;
use crate::virtqueue::VirtQueue;

pub const VIRTIO_PCI_VENDOR: u16 = 0x1af4;

const PCI_CAP_ID_VENDOR: u8 = 0x09;

/// Longest capability list a 256-byte config space can hold. A walk that
/// runs past this is chasing a cycle in the next pointers.
const MAX_PCI_CAPS: usize = 48;

const VIRTIO_PCI_CAP_COMMON_CFG: u8 = 1;
const VIRTIO_PCI_CAP_NOTIFY_CFG: u8 = 2;
const VIRTIO_PCI_CAP_ISR_CFG: u8 = 3;
const VIRTIO_PCI_CAP_DEVICE_CFG: u8 = 4;

/// The legacy register block: fixed registers plus device config.
const LEGACY_WINDOW_LEN: usize = 0x100;

/// A resumable scan position.
///
/// A fresh cursor scans from the start. After a successful [`find`] the
/// cursor points past the accepted device, so the next call returns the
/// next match. Setting [`ScanCursor::restart`] makes the next call rescan
/// from the beginning (it clears the flag itself), for when devices may
/// have appeared or the caller switches to a different class.
#[derive(Debug, Default, Clone)]
pub struct ScanCursor {
    pos: u32,
    pub restart: bool,
}

/// A discovered device, not yet initialized.
pub struct VirtioDevice {
    transport: Box<dyn VirtioTransport>,
    device_type: DeviceType,
    irq: u8,
    features: u64,
}

impl VirtioDevice {
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn irq(&self) -> u8 {
        self.irq
    }

    /// The feature set granted by the last [`VirtioDevice::bring_up`];
    /// zero before bring-up and after a reset.
    pub fn features(&self) -> u64 {
        self.features
    }

    /// Whether the negotiated revision is modern. Meaningful after
    /// bring-up; `VIRTIO_F_VERSION_1` is the marker bit.
    pub fn is_modern(&self) -> bool {
        self.features & VIRTIO_F_VERSION_1 != 0
    }

    pub fn transport_mut(&mut self) -> &mut dyn VirtioTransport {
        self.transport.as_mut()
    }

    /// Negotiates `wanted` features and walks the device status machine
    /// up to DRIVER_OK. Returns the granted set, which it also records.
    pub fn bring_up(&mut self, wanted: u64) -> Result<u64, VirtioError> {
        let granted = self.transport.negotiate(wanted)?;
        self.features = granted;
        Ok(granted)
    }

    /// Resets the device, returning it to the undiscovered-features state.
    pub fn reset(&mut self) -> Result<(), VirtioError> {
        self.transport.reset()?;
        self.features = 0;
        Ok(())
    }

    /// Creates and registers the virtqueue at `index`. See
    /// [`VirtQueue::new`] for sizing rules.
    pub fn add_queue<T>(
        &mut self,
        bus: &Arc<dyn HostBus>,
        index: u16,
        requested_size: u16,
    ) -> Result<VirtQueue<T>, VirtioError> {
        VirtQueue::new(bus, self.transport.as_mut(), index, requested_size)
    }

    pub fn read_device_config8(&mut self, offset: u16) -> u8 {
        self.transport.read_device_config8(offset)
    }

    pub fn read_device_config16(&mut self, offset: u16) -> u16 {
        self.transport.read_device_config16(offset)
    }

    pub fn read_device_config32(&mut self, offset: u16) -> u32 {
        self.transport.read_device_config32(offset)
    }
}

/// Returns the next undiscovered device of class `pattern`, advancing the
/// cursor past it. [`VirtioError::NotFound`] once the scan is exhausted.
pub fn find(
    bus: &Arc<dyn HostBus>,
    pattern: DeviceType,
    cursor: &mut ScanCursor,
) -> Result<VirtioDevice, VirtioError> {
    if cursor.restart {
        cursor.pos = 0;
        cursor.restart = false;
    }

    if bus.pci_present() {
        find_pci(bus, pattern, cursor)
    } else {
        find_mmio(bus, pattern, cursor)
    }
}

// The cursor position encodes bus << 8 | device << 3 | function.
fn find_pci(
    bus: &Arc<dyn HostBus>,
    pattern: DeviceType,
    cursor: &mut ScanCursor,
) -> Result<VirtioDevice, VirtioError> {
    let mut pos = cursor.pos;
    while pos < 0x1_0000 {
        let addr = PciAddress::new((pos >> 8) as u8, ((pos >> 3) & 0x1f) as u8, (pos & 7) as u8);
        pos += 1;

        let id = bus.pci_config_read32(addr, 0x00);
        if id == !0 {
            continue;
        }
        let vendor = id as u16;
        let device_id = (id >> 16) as u16;
        if vendor != VIRTIO_PCI_VENDOR || !pci_id_matches(bus, addr, device_id, pattern) {
            continue;
        }

        match attach_pci(bus, addr, device_id, pattern) {
            Ok(device) => {
                info!(
                    "virtio-pci: {:02x}:{:02x}.{}: attached {:?} device",
                    addr.bus, addr.device, addr.function, pattern
                );
                cursor.pos = pos;
                return Ok(device);
            }
            Err(err) => {
                debug!(
                    "virtio-pci: {:02x}:{:02x}.{}: skipping: {}",
                    addr.bus, addr.device, addr.function, err
                );
            }
        }
    }

    cursor.pos = pos;
    Err(VirtioError::NotFound)
}

fn pci_id_matches(
    bus: &Arc<dyn HostBus>,
    addr: PciAddress,
    device_id: u16,
    pattern: DeviceType,
) -> bool {
    let wanted = pattern.to_id();
    if (0x1040..0x1080).contains(&device_id) {
        // Modern-only IDs encode the class directly.
        return (device_id - 0x1040) as u32 == wanted;
    }
    if (0x1000..0x1040).contains(&device_id) {
        // Transitional IDs carry the class in the subsystem device ID.
        return bus.pci_config_read16(addr, 0x2e) as u32 == wanted;
    }
    false
}

fn attach_pci(
    bus: &Arc<dyn HostBus>,
    addr: PciAddress,
    device_id: u16,
    pattern: DeviceType,
) -> Result<VirtioDevice, VirtioError> {
    let irq = bus.pci_config_read8(addr, 0x3c);
    let transitional = (0x1000..0x1040).contains(&device_id);

    let transport: Box<dyn VirtioTransport> = match modern_cap_windows(bus, addr) {
        Ok(Some(windows)) => Box::new(PciModern::new(
            windows.common,
            windows.notify,
            windows.isr,
            windows.device_cfg,
            windows.notify_off_multiplier,
        )),
        // A transitional device with no usable modern capability set is
        // driven through the legacy register block in BAR0.
        Ok(None) if transitional => {
            Box::new(PciLegacy::new(bar_window(bus, addr, 0, 0, LEGACY_WINDOW_LEN)?))
        }
        Err(err) if transitional => {
            debug!(
                "virtio-pci: {:02x}:{:02x}.{}: broken modern capabilities ({}), driving legacy",
                addr.bus, addr.device, addr.function, err
            );
            Box::new(PciLegacy::new(bar_window(bus, addr, 0, 0, LEGACY_WINDOW_LEN)?))
        }
        Ok(None) => return Err(VirtioError::Fault),
        Err(err) => return Err(err),
    };

    enable_pci_function(bus, addr);

    Ok(VirtioDevice {
        transport,
        device_type: pattern,
        irq,
        features: 0,
    })
}

struct ModernWindows {
    common: Window,
    notify: Window,
    isr: Window,
    device_cfg: Window,
    notify_off_multiplier: u32,
}

/// Walks the capability list for the four vendor-defined windows.
/// `Ok(None)` means the function carries no modern capabilities at all; a
/// partial or malformed set is an error.
fn modern_cap_windows(
    bus: &Arc<dyn HostBus>,
    addr: PciAddress,
) -> Result<Option<ModernWindows>, VirtioError> {
    let mut common = None;
    let mut notify = None;
    let mut isr = None;
    let mut device_cfg = None;
    let mut notify_off_multiplier = 0;

    let status = bus.pci_config_read16(addr, 0x06);
    if status & 0x10 == 0 {
        return Ok(None);
    }

    let mut cap_ptr = bus.pci_config_read8(addr, 0x34);
    let mut remaining = MAX_PCI_CAPS;
    while cap_ptr != 0 && cap_ptr != 0xff {
        if remaining == 0 {
            // The next pointers form a cycle.
            return Err(VirtioError::Fault);
        }
        remaining -= 1;

        let next = bus.pci_config_read8(addr, cap_ptr + 1);
        if bus.pci_config_read8(addr, cap_ptr) == PCI_CAP_ID_VENDOR {
            // The fields below reach 16 bytes past the header.
            if cap_ptr >= 0xf0 {
                return Err(VirtioError::Fault);
            }
            let cfg_type = bus.pci_config_read8(addr, cap_ptr + 3);
            let slot = match cfg_type {
                VIRTIO_PCI_CAP_COMMON_CFG => Some(&mut common),
                VIRTIO_PCI_CAP_NOTIFY_CFG => Some(&mut notify),
                VIRTIO_PCI_CAP_ISR_CFG => Some(&mut isr),
                VIRTIO_PCI_CAP_DEVICE_CFG => Some(&mut device_cfg),
                _ => None,
            };
            if let Some(slot) = slot
                && slot.is_none()
            {
                let bar = bus.pci_config_read8(addr, cap_ptr + 4);
                let offset = bus.pci_config_read32(addr, cap_ptr + 8);
                let length = bus.pci_config_read32(addr, cap_ptr + 12);
                *slot = Some(map_cap_window(bus, addr, bar, offset, length)?);
                if cfg_type == VIRTIO_PCI_CAP_NOTIFY_CFG {
                    notify_off_multiplier = bus.pci_config_read32(addr, cap_ptr + 16);
                }
            }
        }
        cap_ptr = next;
    }

    match (common, notify, isr, device_cfg) {
        (Some(common), Some(notify), Some(isr), Some(device_cfg)) => Ok(Some(ModernWindows {
            common,
            notify,
            isr,
            device_cfg,
            notify_off_multiplier,
        })),
        (None, None, None, None) => Ok(None),
        _ => Err(VirtioError::Fault),
    }
}

fn map_cap_window(
    bus: &Arc<dyn HostBus>,
    addr: PciAddress,
    bar: u8,
    offset: u32,
    length: u32,
) -> Result<Window, VirtioError> {
    if length == 0 {
        return Err(VirtioError::Fault);
    }
    bar_window(bus, addr, bar, offset as u64, length as usize)
}

fn bar_window(
    bus: &Arc<dyn HostBus>,
    addr: PciAddress,
    bar: u8,
    offset: u64,
    length: usize,
) -> Result<Window, VirtioError> {
    if bar >= 6 {
        return Err(VirtioError::Fault);
    }
    let bar_off = 0x10 + bar * 4;
    let raw = bus.pci_config_read32(addr, bar_off);

    if raw & 1 != 0 {
        // I/O space: bits 1:0 are type bits.
        let base = raw & !0x3;
        if base == 0 {
            return Err(VirtioError::Fault);
        }
        return Ok(Window::Port {
            bus: bus.clone(),
            base: base + offset as u32,
        });
    }

    let mut base = (raw & !0xf) as u64;
    if (raw >> 1) & 0x3 == 0x2 {
        // 64-bit memory BAR: the high half lives in the next slot.
        if bar >= 5 {
            return Err(VirtioError::Fault);
        }
        base |= (bus.pci_config_read32(addr, bar_off + 4) as u64) << 32;
    }
    if base == 0 {
        return Err(VirtioError::Fault);
    }

    let window = MemoryWindow::map(bus, base + offset, length)?;
    Ok(Window::Memory(window))
}

fn enable_pci_function(bus: &Arc<dyn HostBus>, addr: PciAddress) {
    // I/O space, memory space, bus mastering.
    let command = bus.pci_config_read32(addr, 0x04);
    bus.pci_config_write32(addr, 0x04, command | 0x7);
}

fn find_mmio(
    bus: &Arc<dyn HostBus>,
    pattern: DeviceType,
    cursor: &mut ScanCursor,
) -> Result<VirtioDevice, VirtioError> {
    let slots = bus.mmio_slots();
    let mut pos = cursor.pos as usize;
    while pos < slots.len() {
        let slot = slots[pos];
        pos += 1;

        match probe_mmio_slot(bus, slot, pattern) {
            Ok(device) => {
                info!(
                    "virtio-mmio: attached {:?} device at {:#x} (irq {})",
                    pattern, slot.base, slot.irq
                );
                cursor.pos = pos as u32;
                return Ok(device);
            }
            Err(err) => {
                debug!("virtio-mmio: skipping slot at {:#x}: {}", slot.base, err);
            }
        }
    }

    cursor.pos = pos as u32;
    Err(VirtioError::NotFound)
}

fn probe_mmio_slot(
    bus: &Arc<dyn HostBus>,
    slot: MmioSlot,
    pattern: DeviceType,
) -> Result<VirtioDevice, VirtioError> {
    let window = Window::Memory(MemoryWindow::map(bus, slot.base, MMIO_WINDOW_LEN)?);
    let (transport, device_type) = MmioTransport::probe(window)?;
    if device_type != pattern {
        // Dropping the transport unmaps the window.
        return Err(VirtioError::NotFound);
    }

    Ok(VirtioDevice {
        transport: Box::new(transport),
        device_type,
        irq: slot.irq,
        features: 0,
    })
}
