#![forbid(unsafe_code)]

//! Split-virtqueue data plane for vhost-user devices.
//!
//! The transport hands the device three ring areas (descriptor table, available ring, used ring)
//! that live in process-local memory shared with the guest, plus a table describing how guest
//! physical addresses map into that memory. This crate provides:
//!
//! - [`HostMemory`]: word-granular access to the shared memory, including the acquire/release
//!   index accesses the ring protocol depends on
//! - [`SharedMemory`]: an atomics-backed [`HostMemory`] implementation
//! - [`MemoryTable`]: the guest memory region table and guest-physical address translation
//! - [`VirtQueue`]: the ring engine (fetch available heads, walk chains, publish completions)

pub mod memory;
pub mod queue;

pub use memory::{
    AddressNotMapped, GuestMemoryError, GuestMemoryResult, HostMemory, MemoryRegion, MemoryTable,
    SharedMemory,
};
pub use queue::{
    DescChain, DescFlags, Descriptor, Notifier, NotifyCounter, VirtQueue, VirtQueueError, Vring,
    VringLayout, VIRTIO_F_NOTIFY_ON_EMPTY, VRING_AVAIL_F_NO_INTERRUPT,
};
