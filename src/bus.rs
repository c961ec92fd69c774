//! Host environment collaborators.
//!
//! Everything the crate needs from the outside world goes through
//! [`HostBus`]: port I/O, PCI configuration space, register-window mapping,
//! and DMA-able memory. Discovery and virtqueue code never touch hardware
//! directly, which is also what makes the test suite possible.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::VirtioError;

/// A PCI function address (bus/device/function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> PciAddress {
        PciAddress {
            bus,
            device,
            function,
        }
    }
}

/// One entry of the platform's fixed virtio-mmio table: the physical base
/// of a candidate register block and its interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioSlot {
    pub base: u64,
    pub irq: u8,
}

/// A physically contiguous, DMA-able allocation as handed out by
/// [`HostBus::alloc_dma`]. Page-aligned and zeroed.
#[derive(Debug, Clone, Copy)]
pub struct DmaBuf {
    pub vaddr: NonNull<u8>,
    pub paddr: u64,
    pub len: usize,
}

/// The platform services this crate is built on top of.
///
/// Port I/O is only exercised when discovery finds an I/O-space BAR, so
/// implementations for platforms without port I/O may make those methods
/// unreachable. The PCI methods have inert defaults for MMIO-only
/// platforms.
pub trait HostBus: Send + Sync {
    fn port_read8(&self, port: u32) -> u8;
    fn port_read16(&self, port: u32) -> u16;
    fn port_read32(&self, port: u32) -> u32;
    fn port_write8(&self, port: u32, value: u8);
    fn port_write16(&self, port: u32, value: u16);
    fn port_write32(&self, port: u32, value: u32);

    /// Whether a PCI bus exists. When false, discovery goes straight to
    /// the MMIO table.
    fn pci_present(&self) -> bool {
        false
    }

    /// Reads an aligned 32-bit word from configuration space. Absent
    /// functions read as all-ones.
    fn pci_config_read32(&self, addr: PciAddress, offset: u8) -> u32 {
        let _ = (addr, offset);
        !0
    }

    fn pci_config_write32(&self, addr: PciAddress, offset: u8, value: u32) {
        let _ = (addr, offset, value);
    }

    fn pci_config_read16(&self, addr: PciAddress, offset: u8) -> u16 {
        let word = self.pci_config_read32(addr, offset & 0xfc);
        (word >> ((offset & 2) * 8)) as u16
    }

    fn pci_config_read8(&self, addr: PciAddress, offset: u8) -> u8 {
        let word = self.pci_config_read32(addr, offset & 0xfc);
        (word >> ((offset & 3) * 8)) as u8
    }

    /// The platform's fixed virtio-mmio probe table, in discovery order.
    fn mmio_slots(&self) -> Vec<MmioSlot> {
        Vec::new()
    }

    /// Maps `len` bytes of physical register space and returns the virtual
    /// base. Balanced by [`HostBus::unmap`].
    fn map(&self, paddr: u64, len: usize) -> Result<NonNull<u8>, VirtioError>;
    fn unmap(&self, paddr: u64, len: usize);

    /// Allocates zeroed, page-aligned, physically contiguous memory for
    /// ring structures. Balanced by [`HostBus::free_dma`].
    fn alloc_dma(&self, len: usize) -> Result<DmaBuf, VirtioError>;
    fn free_dma(&self, buf: DmaBuf);
}

/// A mapped register window. Unmaps itself when dropped.
pub struct MemoryWindow {
    bus: Arc<dyn HostBus>,
    ptr: NonNull<u8>,
    paddr: u64,
    len: usize,
}

impl MemoryWindow {
    pub fn map(bus: &Arc<dyn HostBus>, paddr: u64, len: usize) -> Result<MemoryWindow, VirtioError> {
        let ptr = bus.map(paddr, len)?;
        Ok(MemoryWindow {
            bus: bus.clone(),
            ptr,
            paddr,
            len,
        })
    }

    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MemoryWindow {
    fn drop(&mut self) {
        self.bus.unmap(self.paddr, self.len);
    }
}

// SAFETY: the mapping is process-global and all register accesses through
// it are volatile; the raw pointer is the only non-Sync field.
unsafe impl Send for MemoryWindow {}
unsafe impl Sync for MemoryWindow {}

/// An owned DMA allocation for virtqueue ring memory. Freed when dropped.
pub struct DmaRegion {
    bus: Arc<dyn HostBus>,
    buf: DmaBuf,
}

impl DmaRegion {
    pub fn alloc(bus: &Arc<dyn HostBus>, len: usize) -> Result<DmaRegion, VirtioError> {
        let buf = bus.alloc_dma(len)?;
        Ok(DmaRegion {
            bus: bus.clone(),
            buf,
        })
    }

    pub fn vaddr(&self) -> NonNull<u8> {
        self.buf.vaddr
    }

    pub fn paddr(&self) -> u64 {
        self.buf.paddr
    }

    pub fn len(&self) -> usize {
        self.buf.len
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len == 0
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        self.bus.free_dma(self.buf);
    }
}

// SAFETY: the region is exclusively owned and accessed volatilely; see
// MemoryWindow.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}
