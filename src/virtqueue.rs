//! Split virtqueues.
//!
//! A [`VirtQueue`] owns one ring's DMA memory and descriptor accounting.
//! Submission blocks until enough descriptors are free; completion reaping
//! never blocks. The caller-side handle stashed with each chain comes back
//! out of [`VirtQueue::dequeue`] with the device's byte count.

use std::ptr;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;

use log::warn;

use crate::VirtioError;
use crate::bus::DmaRegion;
use crate::bus::HostBus;
use crate::regs::RingEndian;
use crate::transports::VirtioTransport;

const VIRTQ_DESC_F_NEXT: u16 = 1;
const VIRTQ_DESC_F_WRITE: u16 = 2;

const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;
const VIRTQ_USED_F_NO_NOTIFY: u16 = 1;

/// addr (8) + len (4) + flags (2) + next (2).
const DESC_SIZE: usize = 16;

/// The legacy layout fixes this alignment; the modern layout tolerates it.
const PAGE_SIZE: usize = 4096;

/// One buffer of a descriptor chain.
#[derive(Debug, Clone, Copy)]
pub enum VirtqDescBuffer {
    /// Filled by the driver, read by the device.
    ReadOnlyFromDevice { paddr: u64, len: u32 },
    /// Written by the device, read back by the driver.
    WritableFromDevice { paddr: u64, len: u32 },
}

struct QueueState<T> {
    free_head: u16,
    num_free: u16,
    avail_index: u16,
    last_used_index: u16,
    /// Caller handles, indexed by chain head descriptor.
    heads: Vec<Option<T>>,
}

/// A split virtqueue bound to one device queue.
///
/// Dropping the queue releases its ring memory; callers reset the device
/// before dropping queues the device may still be using.
pub struct VirtQueue<T> {
    index: u16,
    num_descs: u16,
    endian: RingEndian,
    region: DmaRegion,
    avail_ring_off: usize,
    used_ring_off: usize,
    state: Mutex<QueueState<T>>,
    free_descs: Condvar,
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn floor_power_of_two(n: u16) -> u16 {
    1 << (u16::BITS - 1 - n.leading_zeros())
}

impl<T> VirtQueue<T> {
    /// Sizes, allocates, and registers the ring for queue `index`.
    ///
    /// `requested_size` must be a nonzero power of two; it is clamped to
    /// the device maximum (to the next lower power of two if the device
    /// reports an odd maximum). Fails if the queue does not exist or is
    /// already live.
    pub fn new(
        bus: &Arc<dyn HostBus>,
        transport: &mut dyn VirtioTransport,
        index: u16,
        requested_size: u16,
    ) -> Result<VirtQueue<T>, VirtioError> {
        if requested_size == 0 || !requested_size.is_power_of_two() {
            return Err(VirtioError::InvalidArgument(
                "queue size must be a nonzero power of two",
            ));
        }

        transport.select_queue(index);
        let max = transport.queue_max_size();
        if max == 0 {
            return Err(VirtioError::NotFound);
        }
        if transport.queue_ready() {
            return Err(VirtioError::InvalidArgument("queue is already live"));
        }

        let mut num_descs = if transport.queue_size_fixed() {
            max
        } else {
            requested_size.min(max)
        };
        if !num_descs.is_power_of_two() {
            num_descs = floor_power_of_two(num_descs);
        }
        transport.set_queue_size(num_descs);

        let n = num_descs as usize;
        let avail_ring_off = DESC_SIZE * n;
        let avail_ring_size = size_of::<u16>() * (3 + n);
        let used_ring_off = align_up(avail_ring_off + avail_ring_size, PAGE_SIZE);
        let used_ring_size = size_of::<u16>() * 3 + 8 * n;
        let virtq_size = align_up(used_ring_off + used_ring_size, PAGE_SIZE);

        let region = DmaRegion::alloc(bus, virtq_size)?;
        let endian = RingEndian::new(transport.is_modern());

        let this = VirtQueue {
            index,
            num_descs,
            endian,
            region,
            avail_ring_off,
            used_ring_off,
            state: Mutex::new(QueueState {
                free_head: 0,
                num_free: num_descs,
                avail_index: 0,
                last_used_index: 0,
                heads: (0..num_descs).map(|_| None).collect(),
            }),
            free_descs: Condvar::new(),
        };

        // Thread the free list through the descriptor next fields.
        for i in 0..num_descs {
            this.desc_set_next(i, if i == num_descs - 1 { 0 } else { i + 1 });
        }

        let desc = this.region.paddr();
        let avail = desc + avail_ring_off as u64;
        let used = desc + used_ring_off as u64;
        transport.set_queue_ring(desc, avail, used);
        transport.enable_queue();

        Ok(this)
    }

    /// Enqueues one request as a chain of descriptors (e.g. a request
    /// header plus its payload buffers). `head` is handed back by
    /// [`VirtQueue::dequeue`] when the device finishes the chain.
    ///
    /// Blocks until enough descriptors are free. Fails without blocking
    /// when the chain is empty, longer than the whole ring, or orders a
    /// device-readable buffer after a device-writable one.
    ///
    /// Once you've enqueued all requests, notify the device through
    /// [`VirtQueue::notify`].
    pub fn enqueue(&self, chain: &[VirtqDescBuffer], head: T) -> Result<(), VirtioError> {
        if chain.is_empty() {
            return Err(VirtioError::InvalidArgument("empty descriptor chain"));
        }
        if chain.len() > self.num_descs as usize {
            return Err(VirtioError::ResourceExhausted);
        }
        let mut seen_writable = false;
        for buffer in chain {
            match buffer {
                VirtqDescBuffer::ReadOnlyFromDevice { .. } if seen_writable => {
                    return Err(VirtioError::InvalidArgument(
                        "device-readable buffer after a device-writable one",
                    ));
                }
                VirtqDescBuffer::WritableFromDevice { .. } => seen_writable = true,
                VirtqDescBuffer::ReadOnlyFromDevice { .. } => {}
            }
        }

        let mut state = self.state.lock().unwrap();
        while (state.num_free as usize) < chain.len() {
            state = self.free_descs.wait(state).unwrap();
        }

        let head_index = state.free_head;
        let mut desc_index = state.free_head;
        for (i, buffer) in chain.iter().enumerate() {
            let (paddr, len, flags) = match *buffer {
                VirtqDescBuffer::ReadOnlyFromDevice { paddr, len } => (paddr, len, 0),
                VirtqDescBuffer::WritableFromDevice { paddr, len } => {
                    (paddr, len, VIRTQ_DESC_F_WRITE)
                }
            };

            // The free list is threaded through next, so the link to the
            // following free descriptor is exactly the chain link we want.
            let free_next = self.desc_next(desc_index);
            if i == chain.len() - 1 {
                self.desc_write(desc_index, paddr, len, flags, 0);
                state.free_head = free_next;
            } else {
                self.desc_write(desc_index, paddr, len, flags | VIRTQ_DESC_F_NEXT, free_next);
                desc_index = free_next;
            }
        }
        state.num_free -= chain.len() as u16;
        state.heads[head_index as usize] = Some(head);

        // Publish: ring slot first, then the index, with a store barrier
        // in between so the device never sees a half-written chain.
        let slot = state.avail_index & (self.num_descs - 1);
        self.avail_elem_write(slot, head_index);
        fence(Ordering::Release);
        state.avail_index = state.avail_index.wrapping_add(1);
        self.avail_index_write(state.avail_index);
        Ok(())
    }

    /// Tells the device to start processing, unless the device asked for
    /// notifications to be suppressed.
    pub fn notify(&self, transport: &mut dyn VirtioTransport) {
        // Order the avail index store against the suppression-flag load
        // and the register write.
        fence(Ordering::SeqCst);
        if self.used_flags() & VIRTQ_USED_F_NO_NOTIFY != 0 {
            return;
        }
        transport.notify_queue(self.index);
    }

    /// Reaps one completed chain: the stashed handle and the number of
    /// bytes the device wrote. Returns `None` when nothing has completed.
    /// Never blocks.
    pub fn dequeue(&self) -> Option<(T, u32)> {
        let mut state = self.state.lock().unwrap();

        if state.last_used_index == self.used_index() {
            return None;
        }
        // The index moved; acquire the element and descriptor contents
        // the device published before it.
        fence(Ordering::Acquire);

        let slot = state.last_used_index & (self.num_descs - 1);
        let (id, written) = self.used_elem(slot);
        state.last_used_index = state.last_used_index.wrapping_add(1);

        if id >= self.num_descs as u32 {
            warn!("virtio: used ring carries bogus descriptor id {}", id);
            return None;
        }
        let head_index = id as u16;

        // Splice the chain back onto the free list.
        let mut tail = head_index;
        let mut num_freed: u16 = 1;
        while self.desc_flags(tail) & VIRTQ_DESC_F_NEXT != 0 {
            if num_freed == self.num_descs {
                warn!("virtio: descriptor chain at {} has a cycle", head_index);
                break;
            }
            tail = self.desc_next(tail);
            num_freed += 1;
        }
        self.desc_set_next(tail, state.free_head);
        state.free_head = head_index;
        state.num_free += num_freed;

        let head = state.heads[head_index as usize].take();
        drop(state);
        self.free_descs.notify_all();

        if head.is_none() {
            warn!("virtio: used ring completed an idle chain at {}", head_index);
        }
        head.map(|head| (head, written))
    }

    /// Asks the device to raise completion interrupts. Advisory.
    pub fn enable_irq(&self) {
        self.avail_flags_write(0);
    }

    /// Asks the device to skip completion interrupts, e.g. while polling.
    pub fn disable_irq(&self) {
        self.avail_flags_write(VIRTQ_AVAIL_F_NO_INTERRUPT);
    }

    /// Returns the negotiated number of descriptors in the ring.
    pub fn num_descs(&self) -> u16 {
        self.num_descs
    }

    pub fn queue_index(&self) -> u16 {
        self.index
    }

    /// Descriptors currently available for enqueue. This plus the
    /// descriptors of in-flight chains always equals `num_descs`.
    pub fn num_free_descs(&self) -> u16 {
        self.state.lock().unwrap().num_free
    }

    fn ring_ptr(&self, offset: usize) -> *mut u8 {
        // Offsets are computed from num_descs and never leave the region.
        unsafe { self.region.vaddr().as_ptr().add(offset) }
    }

    fn desc_write(&self, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let base = self.ring_ptr(DESC_SIZE * index as usize);
        unsafe {
            ptr::write_volatile(base as *mut u64, self.endian.to_wire64(addr));
            ptr::write_volatile(base.add(8) as *mut u32, self.endian.to_wire32(len));
            ptr::write_volatile(base.add(12) as *mut u16, self.endian.to_wire16(flags));
            ptr::write_volatile(base.add(14) as *mut u16, self.endian.to_wire16(next));
        }
    }

    fn desc_flags(&self, index: u16) -> u16 {
        let base = self.ring_ptr(DESC_SIZE * index as usize);
        self.endian
            .from_wire16(unsafe { ptr::read_volatile(base.add(12) as *const u16) })
    }

    fn desc_next(&self, index: u16) -> u16 {
        let base = self.ring_ptr(DESC_SIZE * index as usize);
        self.endian
            .from_wire16(unsafe { ptr::read_volatile(base.add(14) as *const u16) })
    }

    fn desc_set_next(&self, index: u16, next: u16) {
        let base = self.ring_ptr(DESC_SIZE * index as usize);
        unsafe {
            ptr::write_volatile(base.add(14) as *mut u16, self.endian.to_wire16(next));
        }
    }

    fn avail_flags_write(&self, flags: u16) {
        let base = self.ring_ptr(self.avail_ring_off);
        unsafe {
            ptr::write_volatile(base as *mut u16, self.endian.to_wire16(flags));
        }
    }

    fn avail_index_write(&self, index: u16) {
        let base = self.ring_ptr(self.avail_ring_off + 2);
        unsafe {
            ptr::write_volatile(base as *mut u16, self.endian.to_wire16(index));
        }
    }

    fn avail_elem_write(&self, slot: u16, value: u16) {
        let base = self.ring_ptr(self.avail_ring_off + 4 + 2 * slot as usize);
        unsafe {
            ptr::write_volatile(base as *mut u16, self.endian.to_wire16(value));
        }
    }

    fn used_flags(&self) -> u16 {
        let base = self.ring_ptr(self.used_ring_off);
        self.endian
            .from_wire16(unsafe { ptr::read_volatile(base as *const u16) })
    }

    fn used_index(&self) -> u16 {
        let base = self.ring_ptr(self.used_ring_off + 2);
        self.endian
            .from_wire16(unsafe { ptr::read_volatile(base as *const u16) })
    }

    fn used_elem(&self, slot: u16) -> (u32, u32) {
        let base = self.ring_ptr(self.used_ring_off + 4 + 8 * slot as usize);
        let id = self
            .endian
            .from_wire32(unsafe { ptr::read_volatile(base as *const u32) });
        let len = self
            .endian
            .from_wire32(unsafe { ptr::read_volatile(base.add(4) as *const u32) });
        (id, len)
    }
}
