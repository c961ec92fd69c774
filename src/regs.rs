//! Register window access and ring endianness.

use std::ptr;
use std::sync::Arc;

use crate::bus::HostBus;
use crate::bus::MemoryWindow;

/// A device register window, resolved to its access flavor when the
/// capability that described it was decoded. Offsets are relative to the
/// window base; callers never learn which flavor they got.
pub enum Window {
    /// An I/O-space BAR region, reached through port instructions.
    Port { bus: Arc<dyn HostBus>, base: u32 },
    /// A memory-space BAR region or a raw MMIO block.
    Memory(MemoryWindow),
}

impl Window {
    pub fn read8(&self, offset: usize) -> u8 {
        match self {
            Window::Port { bus, base } => bus.port_read8(base + offset as u32),
            Window::Memory(window) => unsafe {
                ptr::read_volatile(window.ptr().as_ptr().add(offset))
            },
        }
    }

    pub fn read16(&self, offset: usize) -> u16 {
        match self {
            Window::Port { bus, base } => bus.port_read16(base + offset as u32),
            Window::Memory(window) => unsafe {
                ptr::read_volatile(window.ptr().as_ptr().add(offset) as *const u16)
            },
        }
    }

    pub fn read32(&self, offset: usize) -> u32 {
        match self {
            Window::Port { bus, base } => bus.port_read32(base + offset as u32),
            Window::Memory(window) => unsafe {
                ptr::read_volatile(window.ptr().as_ptr().add(offset) as *const u32)
            },
        }
    }

    /// Port hardware has no 64-bit transaction, so a port window reads the
    /// two halves separately, low word first.
    pub fn read64(&self, offset: usize) -> u64 {
        match self {
            Window::Port { .. } => {
                let low = self.read32(offset) as u64;
                let high = self.read32(offset + 4) as u64;
                (high << 32) | low
            }
            Window::Memory(window) => unsafe {
                ptr::read_volatile(window.ptr().as_ptr().add(offset) as *const u64)
            },
        }
    }

    pub fn write8(&self, offset: usize, value: u8) {
        match self {
            Window::Port { bus, base } => bus.port_write8(base + offset as u32, value),
            Window::Memory(window) => unsafe {
                ptr::write_volatile(window.ptr().as_ptr().add(offset), value)
            },
        }
    }

    pub fn write16(&self, offset: usize, value: u16) {
        match self {
            Window::Port { bus, base } => bus.port_write16(base + offset as u32, value),
            Window::Memory(window) => unsafe {
                ptr::write_volatile(window.ptr().as_ptr().add(offset) as *mut u16, value)
            },
        }
    }

    pub fn write32(&self, offset: usize, value: u32) {
        match self {
            Window::Port { bus, base } => bus.port_write32(base + offset as u32, value),
            Window::Memory(window) => unsafe {
                ptr::write_volatile(window.ptr().as_ptr().add(offset) as *mut u32, value)
            },
        }
    }

    /// On a port window the low word goes out first: devices that latch a
    /// 64-bit register on the high-word write must see a complete value.
    pub fn write64(&self, offset: usize, value: u64) {
        match self {
            Window::Port { .. } => {
                self.write32(offset, value as u32);
                self.write32(offset + 4, (value >> 32) as u32);
            }
            Window::Memory(window) => unsafe {
                ptr::write_volatile(window.ptr().as_ptr().add(offset) as *mut u64, value)
            },
        }
    }
}

/// Converts virtqueue ring fields between their wire representation and
/// host integers. Legacy rings are host-native end to end; modern rings
/// are little-endian regardless of the host.
#[derive(Debug, Clone, Copy)]
pub struct RingEndian {
    modern: bool,
}

impl RingEndian {
    pub fn new(modern: bool) -> RingEndian {
        RingEndian { modern }
    }

    pub fn from_wire16(self, n: u16) -> u16 {
        if self.modern { u16::from_le(n) } else { n }
    }

    pub fn to_wire16(self, n: u16) -> u16 {
        if self.modern { n.to_le() } else { n }
    }

    pub fn from_wire32(self, n: u32) -> u32 {
        if self.modern { u32::from_le(n) } else { n }
    }

    pub fn to_wire32(self, n: u32) -> u32 {
        if self.modern { n.to_le() } else { n }
    }

    pub fn from_wire64(self, n: u64) -> u64 {
        if self.modern { u64::from_le(n) } else { n }
    }

    pub fn to_wire64(self, n: u64) -> u64 {
        if self.modern { n.to_le() } else { n }
    }
}
