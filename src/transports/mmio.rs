//! The virtio-mmio transport, register versions 1 (legacy) and 2 (modern).

use log::warn;

use crate::DeviceType;
use crate::VirtioError;
use crate::regs::Window;
use crate::transports::IsrStatus;
use crate::transports::VirtioTransport;

// "All register values are organized as Little Endian."
// (4.2.2 MMIO Device Register Layout).
mod regs {
    pub const MAGIC_VALUE: usize = 0x00;
    pub const DEVICE_VERSION: usize = 0x04;
    pub const DEVICE_ID: usize = 0x08;
    pub const DEVICE_FEATURES: usize = 0x10;
    pub const DEVICE_FEATURES_SEL: usize = 0x14;
    pub const DRIVER_FEATURES: usize = 0x20;
    pub const DRIVER_FEATURES_SEL: usize = 0x24;
    /// Version 1 only.
    pub const GUEST_PAGE_SIZE: usize = 0x28;
    pub const QUEUE_SEL: usize = 0x30;
    pub const QUEUE_NUM_MAX: usize = 0x34;
    pub const QUEUE_NUM: usize = 0x38;
    /// Version 1 only.
    pub const QUEUE_ALIGN: usize = 0x3c;
    /// Version 1 only.
    pub const QUEUE_PFN: usize = 0x40;
    /// Version 2 only.
    pub const QUEUE_READY: usize = 0x44;
    pub const QUEUE_NOTIFY: usize = 0x50;
    pub const INTERRUPT_STATUS: usize = 0x60;
    pub const INTERRUPT_ACK: usize = 0x64;
    pub const STATUS: usize = 0x70;
    pub const QUEUE_DESC_LOW: usize = 0x80;
    pub const QUEUE_DESC_HIGH: usize = 0x84;
    pub const QUEUE_DRIVER_LOW: usize = 0x90;
    pub const QUEUE_DRIVER_HIGH: usize = 0x94;
    pub const QUEUE_DEVICE_LOW: usize = 0xa0;
    pub const QUEUE_DEVICE_HIGH: usize = 0xa4;
    pub const CONFIG: usize = 0x100;
}

/// "virt" in little-endian.
pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;

/// The register block plus the device-specific configuration space.
pub(crate) const MMIO_WINDOW_LEN: usize = 0x200;

const PAGE_SIZE: u32 = 4096;
const PAGE_SHIFT: u32 = 12;

pub struct MmioTransport {
    window: Window,
    version: u32,
}

impl MmioTransport {
    /// Validates the magic and revision registers. Returns the transport
    /// and the advertised device class.
    pub(crate) fn probe(window: Window) -> Result<(MmioTransport, DeviceType), VirtioError> {
        let magic = u32::from_le(window.read32(regs::MAGIC_VALUE));
        if magic != VIRTIO_MMIO_MAGIC {
            return Err(VirtioError::NotFound);
        }

        let version = u32::from_le(window.read32(regs::DEVICE_VERSION));
        if version != 1 && version != 2 {
            warn!("virtio-mmio: unsupported device version: {}", version);
            return Err(VirtioError::Unsupported(version));
        }

        let device_id = u32::from_le(window.read32(regs::DEVICE_ID));
        if device_id == 0 {
            // A valid register block with ID zero is an empty slot.
            return Err(VirtioError::NotFound);
        }

        Ok((
            MmioTransport { window, version },
            DeviceType::from_id(device_id),
        ))
    }

    fn read32(&self, offset: usize) -> u32 {
        u32::from_le(self.window.read32(offset))
    }

    fn write32(&self, offset: usize, value: u32) {
        self.window.write32(offset, value.to_le());
    }
}

impl VirtioTransport for MmioTransport {
    fn is_modern(&self) -> bool {
        self.version == 2
    }

    fn read_device_config8(&mut self, offset: u16) -> u8 {
        self.window.read8(regs::CONFIG + offset as usize)
    }

    fn read_isr_status(&mut self) -> IsrStatus {
        IsrStatus(self.read32(regs::INTERRUPT_STATUS) as u8)
    }

    fn ack_interrupt(&mut self, status: IsrStatus) {
        self.write32(regs::INTERRUPT_ACK, status.0 as u32);
    }

    fn read_device_status(&mut self) -> u8 {
        self.read32(regs::STATUS) as u8
    }

    fn write_device_status(&mut self, value: u8) {
        self.write32(regs::STATUS, value as u32);
    }

    fn read_device_features(&mut self) -> u64 {
        self.write32(regs::DEVICE_FEATURES_SEL, 0);
        let low = self.read32(regs::DEVICE_FEATURES);
        if self.version == 1 {
            // The legacy revision has 32 feature bits, full stop.
            return low as u64;
        }
        self.write32(regs::DEVICE_FEATURES_SEL, 1);
        let high = self.read32(regs::DEVICE_FEATURES);
        ((high as u64) << 32) | (low as u64)
    }

    fn write_driver_features(&mut self, value: u64) {
        self.write32(regs::DRIVER_FEATURES_SEL, 0);
        self.write32(regs::DRIVER_FEATURES, value as u32);
        if self.version == 1 {
            return;
        }
        self.write32(regs::DRIVER_FEATURES_SEL, 1);
        self.write32(regs::DRIVER_FEATURES, (value >> 32) as u32);
    }

    fn select_queue(&mut self, index: u16) {
        self.write32(regs::QUEUE_SEL, index as u32);
    }

    fn queue_max_size(&mut self) -> u16 {
        self.read32(regs::QUEUE_NUM_MAX) as u16
    }

    fn set_queue_size(&mut self, queue_size: u16) {
        self.write32(regs::QUEUE_NUM, queue_size as u32);
    }

    fn queue_ready(&mut self) -> bool {
        if self.version == 1 {
            self.read32(regs::QUEUE_PFN) != 0
        } else {
            self.read32(regs::QUEUE_READY) != 0
        }
    }

    fn set_queue_ring(&mut self, desc: u64, avail: u64, used: u64) {
        if self.version == 1 {
            self.write32(regs::GUEST_PAGE_SIZE, PAGE_SIZE);
            self.write32(regs::QUEUE_ALIGN, PAGE_SIZE);
            self.write32(regs::QUEUE_PFN, (desc >> PAGE_SHIFT) as u32);
            return;
        }
        self.write32(regs::QUEUE_DESC_LOW, desc as u32);
        self.write32(regs::QUEUE_DESC_HIGH, (desc >> 32) as u32);
        self.write32(regs::QUEUE_DRIVER_LOW, avail as u32);
        self.write32(regs::QUEUE_DRIVER_HIGH, (avail >> 32) as u32);
        self.write32(regs::QUEUE_DEVICE_LOW, used as u32);
        self.write32(regs::QUEUE_DEVICE_HIGH, (used >> 32) as u32);
    }

    fn enable_queue(&mut self) {
        if self.version == 2 {
            self.write32(regs::QUEUE_READY, 1);
        }
        // Version 1 queues went live on the PFN write.
    }

    fn notify_queue(&mut self, index: u16) {
        self.write32(regs::QUEUE_NOTIFY, index as u32);
    }
}
