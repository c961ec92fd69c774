//! Transport revisions: how registers are reached and what they mean.
//!
//! A [`VirtioTransport`] hides whether the device is driven through modern
//! PCI capability windows, the transitional legacy register block, or a
//! virtio-mmio region, and which revision (and therefore endianness and
//! feature width) it speaks.

use log::warn;

use crate::VIRTIO_F_VERSION_1;
use crate::VirtioError;

pub mod mmio;
pub mod pci;

pub const VIRTIO_STATUS_ACK: u8 = 1;
pub const VIRTIO_STATUS_DRIVER: u8 = 2;
pub const VIRTIO_STATUS_DRIVER_OK: u8 = 4;
pub const VIRTIO_STATUS_FEAT_OK: u8 = 8;
pub const VIRTIO_STATUS_NEEDS_RESET: u8 = 64;
pub const VIRTIO_STATUS_FAILED: u8 = 128;

/// How many times `reset` re-reads the status register while waiting for
/// the device to settle.
const RESET_SETTLE_RETRIES: usize = 100;

#[derive(Debug, Copy, Clone)]
#[repr(transparent)]
pub struct IsrStatus(pub u8);

const QUEUE_INTR: u8 = 1 << 0;
const DEVICE_CONFIG_INTR: u8 = 1 << 1;

impl IsrStatus {
    pub fn queue_intr(&self) -> bool {
        (self.0 & QUEUE_INTR) != 0
    }

    pub fn device_config_intr(&self) -> bool {
        (self.0 & DEVICE_CONFIG_INTR) != 0
    }
}

pub trait VirtioTransport: Send + Sync {
    /// True when the device speaks the modern revision: little-endian
    /// rings and registers, 64-bit features, per-queue ring addresses.
    fn is_modern(&self) -> bool;
    fn read_device_config8(&mut self, offset: u16) -> u8;
    fn read_isr_status(&mut self) -> IsrStatus;
    fn ack_interrupt(&mut self, status: IsrStatus);
    fn read_device_status(&mut self) -> u8;
    fn write_device_status(&mut self, value: u8);
    fn read_device_features(&mut self) -> u64;
    fn write_driver_features(&mut self, value: u64);
    fn select_queue(&mut self, index: u16);
    fn queue_max_size(&mut self) -> u16;
    fn set_queue_size(&mut self, queue_size: u16);
    /// Whether the selected queue is already live (ready bit or a nonzero
    /// legacy PFN).
    fn queue_ready(&mut self) -> bool;
    /// Legacy transports derive a single PFN from `desc` and ignore the
    /// other two addresses; their ring layout fixes where avail and used
    /// live.
    fn set_queue_ring(&mut self, desc: u64, avail: u64, used: u64);
    fn enable_queue(&mut self);
    fn notify_queue(&mut self, index: u16);
    /// Legacy PCI devices cannot be told a ring size; the driver must use
    /// exactly `queue_max_size`.
    fn queue_size_fixed(&self) -> bool {
        false
    }
}

impl dyn VirtioTransport {
    fn set_device_status_bit(&mut self, new_bits: u8) {
        let status = self.read_device_status();
        self.write_device_status(status | new_bits);
    }

    /// Writes zero to the status register and polls until the device
    /// reads it back as zero, bounded so a wedged device cannot hang the
    /// caller.
    pub fn reset(&mut self) -> Result<(), VirtioError> {
        self.write_device_status(0);
        for _ in 0..RESET_SETTLE_RETRIES {
            if self.read_device_status() == 0 {
                return Ok(());
            }
            std::hint::spin_loop();
        }
        warn!("virtio: device did not settle after reset");
        Err(VirtioError::Rejected)
    }

    /// Drives the device through initialization:
    /// reset, ACKNOWLEDGE, DRIVER, feature negotiation, FEATURES_OK,
    /// DRIVER_OK ("3.1.1 Driver Requirements: Device Initialization").
    ///
    /// The granted set is the intersection of `wanted` with what the
    /// device offers; bits the device does not offer are dropped silently,
    /// including everything above bit 31 on a legacy transport. On a
    /// modern transport the revision marker (`VIRTIO_F_VERSION_1`) is
    /// always taken when offered, even if the caller left it out.
    pub fn negotiate(&mut self, wanted: u64) -> Result<u64, VirtioError> {
        if let Err(err) = self.reset() {
            self.fail();
            return Err(err);
        }
        self.set_device_status_bit(VIRTIO_STATUS_ACK);
        self.set_device_status_bit(VIRTIO_STATUS_DRIVER);

        let offered = self.read_device_features();
        let mut granted = wanted & offered;
        if self.is_modern() {
            granted |= offered & VIRTIO_F_VERSION_1;
        } else {
            granted &= 0xffff_ffff;
        }

        self.write_driver_features(granted);
        self.set_device_status_bit(VIRTIO_STATUS_FEAT_OK);

        if (self.read_device_status() & VIRTIO_STATUS_FEAT_OK) == 0 {
            warn!(
                "virtio: device rejected features: wanted={:#x}, offered={:#x}, granted={:#x}",
                wanted, offered, granted
            );
            self.fail();
            return Err(VirtioError::Rejected);
        }

        self.set_device_status_bit(VIRTIO_STATUS_DRIVER_OK);
        Ok(granted)
    }

    /// Marks the device FAILED. Best effort: the device may already be
    /// unresponsive.
    pub fn fail(&mut self) {
        self.set_device_status_bit(VIRTIO_STATUS_FAILED);
    }

    /// Multi-byte reads from the device-specific config window, assembled
    /// byte-wise in the revision's register byte order.
    pub fn read_device_config16(&mut self, offset: u16) -> u16 {
        let bytes = [
            self.read_device_config8(offset),
            self.read_device_config8(offset + 1),
        ];
        if self.is_modern() {
            u16::from_le_bytes(bytes)
        } else {
            u16::from_ne_bytes(bytes)
        }
    }

    pub fn read_device_config32(&mut self, offset: u16) -> u32 {
        let bytes = [
            self.read_device_config8(offset),
            self.read_device_config8(offset + 1),
            self.read_device_config8(offset + 2),
            self.read_device_config8(offset + 3),
        ];
        if self.is_modern() {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_ne_bytes(bytes)
        }
    }
}
