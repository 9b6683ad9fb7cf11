#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use vhost_ctrl::{
    normalize_socket_dir, CoreMask, LoopbackTransport, Registry, RegistryConfig, SessionSetup,
};
use vhost_virtq::{
    DescFlags, HostMemory, MemoryRegion, MemoryTable, NotifyCounter, SharedMemory, Vring,
    VringLayout, VRING_AVAIL_F_NO_INTERRUPT,
};

/// Guest RAM as seen by the guest.
pub const RAM_GPA: u64 = 0x4000_0000;
/// Where guest RAM lives in the shared memory.
pub const RAM_HOST: u64 = 0x10000;
pub const RAM_SIZE: u64 = 0x10000;

const RING_STRIDE: u64 = 0x2000;

/// Simulated guest driver: owns the ring memory and plays the guest side of the protocol.
pub struct Guest {
    pub mem: Arc<SharedMemory>,
    pub layouts: Vec<VringLayout>,
    pub call: Arc<NotifyCounter>,
}

impl Guest {
    pub fn new(queues: u16, size: u16) -> Self {
        assert!(u64::from(queues) * RING_STRIDE <= RAM_HOST);
        let layouts = (0..queues)
            .map(|queue| VringLayout::contiguous(RING_STRIDE * u64::from(queue), size))
            .collect();
        Self {
            mem: Arc::new(SharedMemory::new((RAM_HOST + RAM_SIZE) as usize)),
            layouts,
            call: Arc::new(NotifyCounter::new()),
        }
    }

    pub fn setup(&self, features: u64) -> SessionSetup {
        let vrings = self
            .layouts
            .iter()
            .map(|&layout| Vring {
                mem: self.mem.clone(),
                layout,
                last_avail_idx: 0,
                last_used_idx: 0,
                call: self.call.clone(),
            })
            .collect();
        let regions = vec![MemoryRegion {
            guest_phys_addr: RAM_GPA,
            size: RAM_SIZE,
            host_addr: RAM_HOST,
        }];
        SessionSetup {
            vrings,
            features,
            mem_table: MemoryTable::new(regions, self.mem.clone()),
        }
    }

    pub fn write_desc(&self, queue: u16, index: u16, gpa: u64, len: u32, flags: DescFlags, next: u16) {
        let base = self.layouts[usize::from(queue)].desc + 16 * u64::from(index);
        self.mem.write_u64(base, gpa).unwrap();
        self.mem.write_u32(base + 8, len).unwrap();
        self.mem.write_u16(base + 12, flags.bits()).unwrap();
        self.mem.write_u16(base + 14, next).unwrap();
    }

    pub fn avail_idx(&self, queue: u16) -> u16 {
        let layout = self.layouts[usize::from(queue)];
        self.mem.read_u16(layout.avail + 2).unwrap()
    }

    /// Makes the chain starting at `head` available to the device.
    pub fn post(&self, queue: u16, head: u16) {
        let layout = self.layouts[usize::from(queue)];
        let idx = self.avail_idx(queue);
        let slot = u64::from(idx & (layout.size - 1));
        self.mem.write_u16(layout.avail + 4 + 2 * slot, head).unwrap();
        self.mem
            .store_u16_release(layout.avail + 2, idx.wrapping_add(1))
            .unwrap();
    }

    pub fn set_no_interrupt(&self, queue: u16, on: bool) {
        let layout = self.layouts[usize::from(queue)];
        let flags = if on { VRING_AVAIL_F_NO_INTERRUPT } else { 0 };
        self.mem.write_u16(layout.avail, flags).unwrap();
    }

    pub fn used_idx(&self, queue: u16) -> u16 {
        let layout = self.layouts[usize::from(queue)];
        self.mem.load_u16_acquire(layout.used + 2).unwrap()
    }

    pub fn used_elem(&self, queue: u16, slot: u16) -> (u32, u32) {
        let layout = self.layouts[usize::from(queue)];
        let base = layout.used + 4 + 8 * u64::from(slot);
        (
            self.mem.read_u32(base).unwrap(),
            self.mem.read_u32(base + 4).unwrap(),
        )
    }

    pub fn fill_ram(&self, gpa: u64, len: u64, byte: u8) {
        self.mem.fill(RAM_HOST + (gpa - RAM_GPA), len, byte).unwrap();
    }

    pub fn ram(&self, gpa: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.mem
            .read_into(RAM_HOST + (gpa - RAM_GPA), &mut buf)
            .unwrap();
        buf
    }
}

pub fn registry(dir: &Path, capacity: usize, app_mask: u64) -> (Arc<LoopbackTransport>, Registry) {
    let transport = Arc::new(LoopbackTransport::new());
    let config = RegistryConfig {
        socket_dir: normalize_socket_dir(&dir.to_string_lossy()).unwrap(),
        capacity,
        app_mask: CoreMask::from_bits(app_mask),
    };
    (transport.clone(), Registry::new(transport, config))
}
