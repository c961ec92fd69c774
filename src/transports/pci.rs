//! PCI transports.
//!
//! Modern devices expose four register windows described by vendor
//! capabilities; the legacy (transitional) register block is a single
//! window, usually an I/O BAR, with everything at fixed offsets.

use crate::regs::Window;
use crate::transports::IsrStatus;
use crate::transports::VirtioTransport;

// Common configuration layout ("4.1.4.3 Common configuration structure
// layout"). All fields little-endian.
mod common {
    pub const DEVICE_FEATURE_SELECT: usize = 0x00;
    pub const DEVICE_FEATURE: usize = 0x04;
    pub const DRIVER_FEATURE_SELECT: usize = 0x08;
    pub const DRIVER_FEATURE: usize = 0x0c;
    pub const DEVICE_STATUS: usize = 0x14;
    pub const QUEUE_SELECT: usize = 0x16;
    pub const QUEUE_SIZE: usize = 0x18;
    pub const QUEUE_ENABLE: usize = 0x1c;
    pub const QUEUE_NOTIFY_OFF: usize = 0x1e;
    pub const QUEUE_DESC: usize = 0x20;
    pub const QUEUE_DRIVER: usize = 0x28;
    pub const QUEUE_DEVICE: usize = 0x30;
}

pub struct PciModern {
    common: Window,
    notify: Window,
    isr: Window,
    device_cfg: Window,
    notify_off_multiplier: u32,
}

impl PciModern {
    pub(crate) fn new(
        common: Window,
        notify: Window,
        isr: Window,
        device_cfg: Window,
        notify_off_multiplier: u32,
    ) -> PciModern {
        PciModern {
            common,
            notify,
            isr,
            device_cfg,
            notify_off_multiplier,
        }
    }

    fn common_read16(&self, offset: usize) -> u16 {
        u16::from_le(self.common.read16(offset))
    }

    fn common_write16(&self, offset: usize, value: u16) {
        self.common.write16(offset, value.to_le());
    }

    fn common_read32(&self, offset: usize) -> u32 {
        u32::from_le(self.common.read32(offset))
    }

    fn common_write32(&self, offset: usize, value: u32) {
        self.common.write32(offset, value.to_le());
    }

    // Written as two 32-bit halves, low first, so the same code is right
    // for port windows and for big-endian hosts.
    fn common_write64(&self, offset: usize, value: u64) {
        self.common_write32(offset, value as u32);
        self.common_write32(offset + 4, (value >> 32) as u32);
    }
}

impl VirtioTransport for PciModern {
    fn is_modern(&self) -> bool {
        true
    }

    fn read_device_config8(&mut self, offset: u16) -> u8 {
        self.device_cfg.read8(offset as usize)
    }

    fn read_isr_status(&mut self) -> IsrStatus {
        // Reading the ISR register is what acknowledges the interrupt.
        IsrStatus(self.isr.read8(0))
    }

    fn ack_interrupt(&mut self, _status: IsrStatus) {}

    fn read_device_status(&mut self) -> u8 {
        self.common.read8(common::DEVICE_STATUS)
    }

    fn write_device_status(&mut self, value: u8) {
        self.common.write8(common::DEVICE_STATUS, value);
    }

    fn read_device_features(&mut self) -> u64 {
        self.common_write32(common::DEVICE_FEATURE_SELECT, 0);
        let low = self.common_read32(common::DEVICE_FEATURE);
        self.common_write32(common::DEVICE_FEATURE_SELECT, 1);
        let high = self.common_read32(common::DEVICE_FEATURE);
        ((high as u64) << 32) | (low as u64)
    }

    fn write_driver_features(&mut self, value: u64) {
        self.common_write32(common::DRIVER_FEATURE_SELECT, 0);
        self.common_write32(common::DRIVER_FEATURE, value as u32);
        self.common_write32(common::DRIVER_FEATURE_SELECT, 1);
        self.common_write32(common::DRIVER_FEATURE, (value >> 32) as u32);
    }

    fn select_queue(&mut self, index: u16) {
        self.common_write16(common::QUEUE_SELECT, index);
    }

    fn queue_max_size(&mut self) -> u16 {
        self.common_read16(common::QUEUE_SIZE)
    }

    fn set_queue_size(&mut self, queue_size: u16) {
        self.common_write16(common::QUEUE_SIZE, queue_size);
    }

    fn queue_ready(&mut self) -> bool {
        self.common_read16(common::QUEUE_ENABLE) != 0
    }

    fn set_queue_ring(&mut self, desc: u64, avail: u64, used: u64) {
        self.common_write64(common::QUEUE_DESC, desc);
        self.common_write64(common::QUEUE_DRIVER, avail);
        self.common_write64(common::QUEUE_DEVICE, used);
    }

    fn enable_queue(&mut self) {
        self.common_write16(common::QUEUE_ENABLE, 1);
    }

    fn notify_queue(&mut self, index: u16) {
        self.select_queue(index);
        let notify_off = self.common_read16(common::QUEUE_NOTIFY_OFF);
        let offset = (notify_off as usize) * (self.notify_off_multiplier as usize);
        self.notify.write16(offset, index.to_le());
    }
}

// Legacy register block ("4.1.4.8 Legacy Interface"). Fields are in the
// host's native byte order, matching the rings.
mod legacy {
    pub const HOST_FEATURES: usize = 0x00;
    pub const GUEST_FEATURES: usize = 0x04;
    pub const QUEUE_PFN: usize = 0x08;
    pub const QUEUE_SIZE: usize = 0x0c;
    pub const QUEUE_SEL: usize = 0x0e;
    pub const QUEUE_NOTIFY: usize = 0x10;
    pub const STATUS: usize = 0x12;
    pub const ISR: usize = 0x13;
    pub const DEVICE_CONFIG: usize = 0x14;
}

/// The ring PFN register counts 4 KiB pages.
const LEGACY_PAGE_SHIFT: u32 = 12;

pub struct PciLegacy {
    window: Window,
}

impl PciLegacy {
    pub(crate) fn new(window: Window) -> PciLegacy {
        PciLegacy { window }
    }
}

impl VirtioTransport for PciLegacy {
    fn is_modern(&self) -> bool {
        false
    }

    fn read_device_config8(&mut self, offset: u16) -> u8 {
        self.window.read8(legacy::DEVICE_CONFIG + offset as usize)
    }

    fn read_isr_status(&mut self) -> IsrStatus {
        IsrStatus(self.window.read8(legacy::ISR))
    }

    fn ack_interrupt(&mut self, _status: IsrStatus) {}

    fn read_device_status(&mut self) -> u8 {
        self.window.read8(legacy::STATUS)
    }

    fn write_device_status(&mut self, value: u8) {
        self.window.write8(legacy::STATUS, value);
    }

    fn read_device_features(&mut self) -> u64 {
        self.window.read32(legacy::HOST_FEATURES) as u64
    }

    fn write_driver_features(&mut self, value: u64) {
        self.window.write32(legacy::GUEST_FEATURES, value as u32);
    }

    fn select_queue(&mut self, index: u16) {
        self.window.write16(legacy::QUEUE_SEL, index);
    }

    fn queue_max_size(&mut self) -> u16 {
        self.window.read16(legacy::QUEUE_SIZE)
    }

    fn set_queue_size(&mut self, _queue_size: u16) {
        // The ring size is fixed by the device; see queue_size_fixed.
    }

    fn queue_ready(&mut self) -> bool {
        self.window.read32(legacy::QUEUE_PFN) != 0
    }

    fn set_queue_ring(&mut self, desc: u64, _avail: u64, _used: u64) {
        // The device derives avail and used from the descriptor table
        // base and the fixed legacy layout.
        self.window
            .write32(legacy::QUEUE_PFN, (desc >> LEGACY_PAGE_SHIFT) as u32);
    }

    fn enable_queue(&mut self) {
        // Writing a nonzero PFN already enabled the queue.
    }

    fn notify_queue(&mut self, index: u16) {
        self.window.write16(legacy::QUEUE_NOTIFY, index);
    }

    fn queue_size_fixed(&self) -> bool {
        true
    }
}
