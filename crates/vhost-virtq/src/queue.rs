//! Split virtqueue ring engine.
//!
//! Ring layout (all fields little-endian):
//!
//! - descriptor table: `size` entries of `{ addr: u64, len: u32, flags: u16, next: u16 }`
//! - available ring: `flags: u16, idx: u16, ring: [u16; size], used_event: u16`
//! - used ring: `flags: u16, idx: u16, ring: [{ id: u32, len: u32 }; size], avail_event: u16`
//!
//! The guest is the only writer of the available ring and the device is the only writer of the
//! used ring, so neither side needs a lock. Ring indices are free-running `u16` counters reduced
//! to a slot with `idx & (size - 1)`.

use core::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, warn};

use crate::memory::{AddressNotMapped, GuestMemoryError, HostMemory};

/// Interrupt the driver when the available ring runs empty, even if it asked for no interrupts.
pub const VIRTIO_F_NOTIFY_ON_EMPTY: u64 = 1 << 24;

/// Available ring flag: the driver does not want completion interrupts.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DescFlags: u16 {
        /// The chain continues at `next`.
        const NEXT = 1;
        /// Device-writable (guest-readable) buffer.
        const WRITE = 2;
        /// Buffer holds an indirect descriptor table. Not supported by this engine.
        const INDIRECT = 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: DescFlags,
    pub next: u16,
}

impl Descriptor {
    pub fn has_next(&self) -> bool {
        self.flags.contains(DescFlags::NEXT)
    }

    /// `true` for buffers the device writes and the guest reads.
    pub fn is_writable(&self) -> bool {
        self.flags.contains(DescFlags::WRITE)
    }
}

/// Local addresses of the three areas of one split virtqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VringLayout {
    pub size: u16,
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
}

impl VringLayout {
    pub const DESC_SIZE: u64 = 16;
    pub const USED_ELEM_SIZE: u64 = 8;

    pub const fn desc_table_bytes(size: u16) -> u64 {
        Self::DESC_SIZE * size as u64
    }

    pub const fn avail_ring_bytes(size: u16) -> u64 {
        6 + 2 * size as u64
    }

    pub const fn used_ring_bytes(size: u16) -> u64 {
        6 + Self::USED_ELEM_SIZE * size as u64
    }

    /// Places the descriptor table at `base`, the available ring right after it and the used ring
    /// at the next 4-byte boundary.
    pub const fn contiguous(base: u64, size: u16) -> Self {
        let avail = base + Self::desc_table_bytes(size);
        let used = (avail + Self::avail_ring_bytes(size) + 3) & !3;
        Self {
            size,
            desc: base,
            avail,
            used,
        }
    }

    /// First address past the used ring.
    pub const fn end(&self) -> u64 {
        self.used + Self::used_ring_bytes(self.size)
    }
}

/// Notification channel towards the guest (the vring "call" file descriptor).
pub trait Notifier: Send + Sync {
    fn notify(&self) -> io::Result<()>;
}

/// [`Notifier`] that counts signals; used by in-process transports.
#[derive(Debug, Default)]
pub struct NotifyCounter {
    count: AtomicU64,
}

impl NotifyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Notifier for NotifyCounter {
    fn notify(&self) -> io::Result<()> {
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A vring as handed over by the transport.
#[derive(Clone)]
pub struct Vring {
    pub mem: Arc<dyn HostMemory>,
    pub layout: VringLayout,
    pub last_avail_idx: u16,
    pub last_used_idx: u16,
    pub call: Arc<dyn Notifier>,
}

impl fmt::Debug for Vring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vring")
            .field("layout", &self.layout)
            .field("last_avail_idx", &self.last_avail_idx)
            .field("last_used_idx", &self.last_used_idx)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VirtQueueError {
    #[error("queue size {0} is not a non-zero power of two")]
    InvalidQueueSize(u16),

    #[error("{ring} ring at 0x{addr:x} is not backed by host memory")]
    RingNotMapped { ring: &'static str, addr: u64 },

    #[error("{ring} ring at 0x{addr:x} is misaligned")]
    RingMisaligned { ring: &'static str, addr: u64 },

    #[error("descriptor index {index} out of range (queue size {size})")]
    DescriptorIndexOutOfRange { index: u16, size: u16 },

    #[error("descriptor does not continue a chain")]
    NoNextDescriptor,

    #[error("descriptor chain starting at {head} is longer than {limit} descriptors")]
    ChainTooLong { head: u16, limit: u16 },

    #[error(transparent)]
    AddressNotMapped(#[from] AddressNotMapped),

    #[error("guest memory access failed: {0}")]
    Memory(#[from] GuestMemoryError),
}

/// Device side of one split virtqueue.
pub struct VirtQueue {
    mem: Arc<dyn HostMemory>,
    layout: VringLayout,
    mask: u16,
    last_avail_idx: u16,
    last_used_idx: u16,
    call: Arc<dyn Notifier>,
    faulted: bool,
}

impl VirtQueue {
    /// Validates a transport-provided vring and takes over its cursors.
    pub fn new(vring: Vring) -> Result<Self, VirtQueueError> {
        let layout = vring.layout;
        let size = layout.size;
        if size == 0 || !size.is_power_of_two() {
            return Err(VirtQueueError::InvalidQueueSize(size));
        }

        let areas = [
            ("descriptor", layout.desc, VringLayout::desc_table_bytes(size), 16),
            ("available", layout.avail, VringLayout::avail_ring_bytes(size), 2),
            ("used", layout.used, VringLayout::used_ring_bytes(size), 4),
        ];
        for (ring, addr, len, align) in areas {
            if addr % align != 0 {
                return Err(VirtQueueError::RingMisaligned { ring, addr });
            }
            if !vring.mem.contains(addr, len) {
                return Err(VirtQueueError::RingNotMapped { ring, addr });
            }
        }

        Ok(Self {
            mem: vring.mem,
            layout,
            mask: size - 1,
            last_avail_idx: vring.last_avail_idx,
            last_used_idx: vring.last_used_idx,
            call: vring.call,
            faulted: false,
        })
    }

    pub fn size(&self) -> u16 {
        self.layout.size
    }

    pub fn layout(&self) -> VringLayout {
        self.layout
    }

    pub fn last_avail_idx(&self) -> u16 {
        self.last_avail_idx
    }

    pub fn last_used_idx(&self) -> u16 {
        self.last_used_idx
    }

    /// A queue is faulted once the guest violated the ring protocol on it; callers stop
    /// draining it until the session is rebuilt.
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn mark_faulted(&mut self) {
        self.faulted = true;
    }

    pub fn avail_flags(&self) -> Result<u16, VirtQueueError> {
        Ok(self.mem.read_u16(self.layout.avail)?)
    }

    pub fn avail_idx(&self) -> Result<u16, VirtQueueError> {
        Ok(self.mem.load_u16_acquire(self.layout.avail + 2)?)
    }

    pub fn used_idx(&self) -> Result<u16, VirtQueueError> {
        Ok(self.mem.read_u16(self.layout.used + 2)?)
    }

    /// Copies newly available descriptor heads into `reqs` and consumes them.
    ///
    /// At most `reqs.len()` heads are taken. Returns the number copied; `0` means there is no new
    /// work and leaves the queue untouched.
    pub fn fetch_available(&mut self, reqs: &mut [u16]) -> Result<usize, VirtQueueError> {
        let last_idx = self.last_avail_idx;
        let avail_idx = self.avail_idx()?;
        let pending = usize::from(avail_idx.wrapping_sub(last_idx) & self.mask);
        let count = pending.min(reqs.len());
        if count == 0 {
            return Ok(0);
        }

        for (i, req) in reqs[..count].iter_mut().enumerate() {
            let slot = last_idx.wrapping_add(i as u16) & self.mask;
            *req = self.mem.read_u16(self.layout.avail + 4 + 2 * u64::from(slot))?;
        }
        self.last_avail_idx = last_idx.wrapping_add(count as u16);

        debug!(target: "vhost_ring", last_idx, avail_idx, count, "AVAIL");
        Ok(count)
    }

    /// Reads descriptor `index` from the descriptor table.
    ///
    /// The returned value is a snapshot; later guest writes to the table do not affect it.
    pub fn descriptor(&self, index: u16) -> Result<Descriptor, VirtQueueError> {
        if index >= self.layout.size {
            return Err(VirtQueueError::DescriptorIndexOutOfRange {
                index,
                size: self.layout.size,
            });
        }

        let base = self.layout.desc + VringLayout::DESC_SIZE * u64::from(index);
        Ok(Descriptor {
            addr: self.mem.read_u64(base)?,
            len: self.mem.read_u32(base + 8)?,
            flags: DescFlags::from_bits_retain(self.mem.read_u16(base + 12)?),
            next: self.mem.read_u16(base + 14)?,
        })
    }

    /// Follows `desc` to the next descriptor of its chain.
    pub fn next_descriptor(&self, desc: &Descriptor) -> Result<Descriptor, VirtQueueError> {
        if !desc.has_next() {
            return Err(VirtQueueError::NoNextDescriptor);
        }
        self.descriptor(desc.next)
    }

    /// Iterates the chain starting at `head`, yielding `(index, descriptor)` pairs.
    pub fn chain(&self, head: u16) -> DescChain<'_> {
        DescChain {
            queue: self,
            head,
            next: Some(head),
            walked: 0,
        }
    }

    /// Whether the guest wants an interrupt for completions published right now.
    pub fn should_notify(&self, negotiated_features: u64) -> Result<bool, VirtQueueError> {
        if negotiated_features & VIRTIO_F_NOTIFY_ON_EMPTY != 0
            && self.avail_idx()? == self.last_avail_idx
        {
            return Ok(true);
        }

        Ok(self.avail_flags()? & VRING_AVAIL_F_NO_INTERRUPT == 0)
    }

    /// Publishes one completion to the used ring and signals the guest if it asked for it.
    ///
    /// Returns whether a notification was requested. A failed signal is logged and otherwise
    /// ignored; the completion itself is already visible.
    pub fn enqueue_completion(
        &mut self,
        negotiated_features: u64,
        id: u16,
        len: u32,
    ) -> Result<bool, VirtQueueError> {
        let last_idx = self.last_used_idx;
        debug!(target: "vhost_ring", last_idx, id, len, "USED");

        let elem = self.layout.used + 4 + VringLayout::USED_ELEM_SIZE * u64::from(last_idx & self.mask);
        self.mem.write_u32(elem, u32::from(id))?;
        self.mem.write_u32(elem + 4, len)?;

        // The element must be visible before the guest can observe the new index.
        let used_idx = last_idx.wrapping_add(1);
        self.mem.store_u16_release(self.layout.used + 2, used_idx)?;
        self.last_used_idx = used_idx;

        if !self.should_notify(negotiated_features)? {
            return Ok(false);
        }
        if let Err(err) = self.call.notify() {
            warn!(target: "vhost_ring", "failed to signal guest: {err}");
        }
        Ok(true)
    }
}

impl fmt::Debug for VirtQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtQueue")
            .field("layout", &self.layout)
            .field("last_avail_idx", &self.last_avail_idx)
            .field("last_used_idx", &self.last_used_idx)
            .field("faulted", &self.faulted)
            .finish_non_exhaustive()
    }
}

/// Iterator over one descriptor chain.
///
/// Stops after the descriptor without [`DescFlags::NEXT`]. A chain longer than the queue size
/// can only be a loop and ends with [`VirtQueueError::ChainTooLong`].
pub struct DescChain<'a> {
    queue: &'a VirtQueue,
    head: u16,
    next: Option<u16>,
    walked: u16,
}

impl Iterator for DescChain<'_> {
    type Item = Result<(u16, Descriptor), VirtQueueError>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next.take()?;
        let limit = self.queue.size();
        if self.walked == limit {
            return Some(Err(VirtQueueError::ChainTooLong {
                head: self.head,
                limit,
            }));
        }
        self.walked += 1;

        match self.queue.descriptor(index) {
            Ok(desc) => {
                if desc.has_next() {
                    self.next = Some(desc.next);
                }
                Some(Ok((index, desc)))
            }
            Err(err) => Some(Err(err)),
        }
    }
}
