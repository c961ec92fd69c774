//! A transport layer for virtio devices using split virtqueues.
//!
//! The crate discovers virtio devices over PCI or a fixed MMIO table
//! ([`probe::find`]), negotiates features through the device status state
//! machine, and drives descriptor rings ([`virtqueue::VirtQueue`]) over
//! either the legacy or the modern transport revision.
//!
//! The host environment (port I/O, PCI config space, mappings, DMA memory)
//! is abstracted behind [`bus::HostBus`] so the same code runs in a kernel,
//! a userspace VMM driver, or the test suite.

use thiserror::Error;

pub mod bus;
pub mod probe;
pub mod regs;
pub mod transports;
pub mod virtqueue;

#[cfg(test)]
pub(crate) mod testing;

/// Device classes as advertised by the device ID registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Net,
    Blk,
    Console,
    Gpu,
    Unknown(u32),
}

impl DeviceType {
    pub fn from_id(id: u32) -> DeviceType {
        match id {
            1 => DeviceType::Net,
            2 => DeviceType::Blk,
            3 => DeviceType::Console,
            16 => DeviceType::Gpu,
            _ => DeviceType::Unknown(id),
        }
    }

    pub fn to_id(self) -> u32 {
        match self {
            DeviceType::Net => 1,
            DeviceType::Blk => 2,
            DeviceType::Console => 3,
            DeviceType::Gpu => 16,
            DeviceType::Unknown(id) => id,
        }
    }
}

/// Feature bits common to all device classes.
pub const VIRTIO_F_RING_EVENT_IDX: u64 = 1 << 29;
/// Negotiating this bit commits the device to the modern (little-endian)
/// revision. Legacy transports can never offer it.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VirtioError {
    #[error("no matching device")]
    NotFound,
    #[error("unsupported transport revision {0}")]
    Unsupported(u32),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("request exceeds queue capacity")]
    ResourceExhausted,
    #[error("register window access failed")]
    Fault,
    #[error("device rejected the driver's configuration")]
    Rejected,
}
