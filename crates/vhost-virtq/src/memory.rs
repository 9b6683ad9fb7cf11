use core::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    #[error("out of bounds: addr=0x{addr:x} len={len}")]
    OutOfBounds { addr: u64, len: u64 },

    #[error("unaligned {width}-byte access at 0x{addr:x}")]
    Unaligned { addr: u64, width: u8 },
}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// Process-local memory shared with the guest.
///
/// Both the vrings handed over by the transport and the guest RAM regions listed in a
/// [`MemoryTable`] live in this address space. Addresses are process-local, not guest physical;
/// use [`MemoryTable::translate`] to go from one to the other.
///
/// Multi-byte values are little-endian (virtio 1.0 byte order). Word accessors require 2-byte
/// alignment, which every vring field satisfies.
pub trait HostMemory: Send + Sync {
    /// Returns `true` if `[addr, addr + len)` is backed by this memory.
    fn contains(&self, addr: u64, len: u64) -> bool;

    fn read_u16(&self, addr: u64) -> GuestMemoryResult<u16>;
    fn write_u16(&self, addr: u64, val: u16) -> GuestMemoryResult<()>;

    /// Loads a ring index. Every write the other side made before publishing the index is visible
    /// to reads issued after this load returns.
    fn load_u16_acquire(&self, addr: u64) -> GuestMemoryResult<u16>;

    /// Publishes a ring index. Every write issued before this store is visible to a reader that
    /// observes the new value with an acquire load.
    fn store_u16_release(&self, addr: u64, val: u16) -> GuestMemoryResult<()>;

    fn read_into(&self, addr: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;
    fn write_from(&self, addr: u64, src: &[u8]) -> GuestMemoryResult<()>;

    fn read_u32(&self, addr: u64) -> GuestMemoryResult<u32> {
        let lo = self.read_u16(addr)?;
        let hi = self.read_u16(word_addr(addr, 1, 4)?)?;
        Ok(u32::from(lo) | (u32::from(hi) << 16))
    }

    fn write_u32(&self, addr: u64, val: u32) -> GuestMemoryResult<()> {
        self.write_u16(addr, val as u16)?;
        self.write_u16(word_addr(addr, 1, 4)?, (val >> 16) as u16)
    }

    fn read_u64(&self, addr: u64) -> GuestMemoryResult<u64> {
        let mut val = 0u64;
        for word in 0..4 {
            let part = self.read_u16(word_addr(addr, word, 8)?)?;
            val |= u64::from(part) << (word * 16);
        }
        Ok(val)
    }

    fn write_u64(&self, addr: u64, val: u64) -> GuestMemoryResult<()> {
        for word in 0..4 {
            self.write_u16(word_addr(addr, word, 8)?, (val >> (word * 16)) as u16)?;
        }
        Ok(())
    }

    /// Sets `len` bytes starting at `addr` to `byte`.
    fn fill(&self, addr: u64, len: u64, byte: u8) -> GuestMemoryResult<()> {
        const CHUNK: usize = 256;
        let buf = [byte; CHUNK];
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(CHUNK as u64) as usize;
            let at = addr
                .checked_add(done)
                .ok_or(GuestMemoryError::OutOfBounds { addr, len })?;
            self.write_from(at, &buf[..n])?;
            done += n as u64;
        }
        Ok(())
    }
}

fn word_addr(addr: u64, word: u64, width: u64) -> GuestMemoryResult<u64> {
    addr.checked_add(word * 2)
        .ok_or(GuestMemoryError::OutOfBounds { addr, len: width })
}

/// Atomics-backed [`HostMemory`].
///
/// Storage is an array of `AtomicU16` words so that both sides of a ring can access it
/// concurrently without `unsafe`. Plain accessors use relaxed ordering; ordering between ring
/// entries and ring indices comes exclusively from the acquire/release index accessors.
pub struct SharedMemory {
    base: u64,
    words: Box<[AtomicU16]>,
}

impl SharedMemory {
    /// Allocates `size` zeroed bytes (rounded up to a whole word) at local address 0.
    pub fn new(size: usize) -> Self {
        Self {
            base: 0,
            words: zeroed_words(size),
        }
    }

    /// Allocates `size` zeroed bytes at local address `base`, which must be word aligned.
    pub fn with_base(base: u64, size: usize) -> GuestMemoryResult<Self> {
        if base % 2 != 0 {
            return Err(GuestMemoryError::Unaligned {
                addr: base,
                width: 2,
            });
        }
        let words = zeroed_words(size);
        base.checked_add(words.len() as u64 * 2)
            .ok_or(GuestMemoryError::OutOfBounds {
                addr: base,
                len: size as u64,
            })?;
        Ok(Self { base, words })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.words.len() as u64 * 2
    }

    fn offset(&self, addr: u64, len: u64) -> GuestMemoryResult<u64> {
        let oob = GuestMemoryError::OutOfBounds { addr, len };
        let off = addr.checked_sub(self.base).ok_or(oob)?;
        let end = off.checked_add(len).ok_or(oob)?;
        if end > self.size() {
            return Err(oob);
        }
        Ok(off)
    }

    fn word(&self, addr: u64) -> GuestMemoryResult<&AtomicU16> {
        if addr % 2 != 0 {
            return Err(GuestMemoryError::Unaligned { addr, width: 2 });
        }
        let off = self.offset(addr, 2)?;
        Ok(&self.words[(off / 2) as usize])
    }
}

fn zeroed_words(size: usize) -> Box<[AtomicU16]> {
    (0..size.div_ceil(2)).map(|_| AtomicU16::new(0)).collect()
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("base", &format_args!("0x{:x}", self.base))
            .field("size", &self.size())
            .finish()
    }
}

impl HostMemory for SharedMemory {
    fn contains(&self, addr: u64, len: u64) -> bool {
        self.offset(addr, len).is_ok()
    }

    fn read_u16(&self, addr: u64) -> GuestMemoryResult<u16> {
        Ok(self.word(addr)?.load(Ordering::Relaxed))
    }

    fn write_u16(&self, addr: u64, val: u16) -> GuestMemoryResult<()> {
        self.word(addr)?.store(val, Ordering::Relaxed);
        Ok(())
    }

    fn load_u16_acquire(&self, addr: u64) -> GuestMemoryResult<u16> {
        Ok(self.word(addr)?.load(Ordering::Acquire))
    }

    fn store_u16_release(&self, addr: u64, val: u16) -> GuestMemoryResult<()> {
        self.word(addr)?.store(val, Ordering::Release);
        Ok(())
    }

    fn read_into(&self, addr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let off = self.offset(addr, dst.len() as u64)?;
        for (i, byte) in dst.iter_mut().enumerate() {
            let pos = off + i as u64;
            let word = self.words[(pos / 2) as usize].load(Ordering::Relaxed);
            *byte = (word >> ((pos % 2) * 8)) as u8;
        }
        Ok(())
    }

    fn write_from(&self, addr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let off = self.offset(addr, src.len() as u64)?;
        let mut i = 0;
        while i < src.len() {
            let pos = off + i as u64;
            let word = &self.words[(pos / 2) as usize];
            if pos % 2 == 0 && i + 1 < src.len() {
                word.store(u16::from_le_bytes([src[i], src[i + 1]]), Ordering::Relaxed);
                i += 2;
            } else {
                // Partial word: merge the byte without clobbering its neighbour.
                let shift = (pos % 2) * 8;
                let mask = 0x00ffu16 << shift;
                let val = u16::from(src[i]) << shift;
                let _ = word.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| {
                    Some((w & !mask) | val)
                });
                i += 1;
            }
        }
        Ok(())
    }
}

/// One entry of a guest memory table: guest physical range `[guest_phys_addr,
/// guest_phys_addr + size)` is mapped at local address `host_addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub guest_phys_addr: u64,
    pub size: u64,
    pub host_addr: u64,
}

impl MemoryRegion {
    pub fn contains(&self, gpa: u64) -> bool {
        gpa.checked_sub(self.guest_phys_addr)
            .is_some_and(|off| off < self.size)
    }

    fn translate_range(&self, gpa: u64, len: u64) -> Option<u64> {
        let off = gpa.checked_sub(self.guest_phys_addr)?;
        let end = off.checked_add(len)?;
        if off >= self.size || end > self.size {
            return None;
        }
        self.host_addr.checked_add(off)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest physical range 0x{gpa:x}+{len} is not mapped")]
pub struct AddressNotMapped {
    pub gpa: u64,
    pub len: u64,
}

/// Guest memory region table of an attached device.
///
/// Cloning is cheap: the regions are a small list and the backing memory is shared.
#[derive(Clone)]
pub struct MemoryTable {
    regions: Vec<MemoryRegion>,
    mem: Arc<dyn HostMemory>,
}

impl MemoryTable {
    pub fn new(regions: Vec<MemoryRegion>, mem: Arc<dyn HostMemory>) -> Self {
        Self { regions, mem }
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// The memory the regions are mapped into.
    pub fn host_memory(&self) -> &Arc<dyn HostMemory> {
        &self.mem
    }

    /// Translates a guest physical address to a local address.
    ///
    /// Regions are searched in table order; the first one containing `gpa` wins.
    pub fn translate(&self, gpa: u64) -> Result<u64, AddressNotMapped> {
        self.translate_range(gpa, 1)
    }

    /// Translates a guest physical buffer that must lie entirely within one region.
    ///
    /// Empty buffers translate like a single byte at `gpa`.
    pub fn translate_range(&self, gpa: u64, len: u64) -> Result<u64, AddressNotMapped> {
        let check_len = len.max(1);
        self.regions
            .iter()
            .find_map(|region| region.translate_range(gpa, check_len))
            .ok_or(AddressNotMapped { gpa, len })
    }
}

impl fmt::Debug for MemoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTable")
            .field("regions", &self.regions)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_and_bytes_share_little_endian_layout() {
        let mem = SharedMemory::new(32);
        mem.write_u64(8, 0x1122_3344_5566_7788).unwrap();

        let mut bytes = [0u8; 8];
        mem.read_into(8, &mut bytes).unwrap();
        assert_eq!(bytes, 0x1122_3344_5566_7788u64.to_le_bytes());

        mem.write_from(17, &[0xaa, 0xbb, 0xcc]).unwrap();
        assert_eq!(mem.read_u16(16).unwrap(), 0xaa00);
        assert_eq!(mem.read_u16(18).unwrap(), 0xccbb);
        assert_eq!(mem.read_u32(8).unwrap(), 0x5566_7788);
    }

    #[test]
    fn odd_byte_write_preserves_neighbour() {
        let mem = SharedMemory::new(4);
        mem.write_u16(0, 0x1234).unwrap();
        mem.write_from(1, &[0xff]).unwrap();
        assert_eq!(mem.read_u16(0).unwrap(), 0xff34);
    }

    #[test]
    fn rejects_unaligned_and_out_of_bounds_access() {
        let mem = SharedMemory::with_base(0x1000, 16).unwrap();
        assert_eq!(
            mem.read_u16(0x1001),
            Err(GuestMemoryError::Unaligned {
                addr: 0x1001,
                width: 2
            })
        );
        assert!(matches!(
            mem.read_u16(0x0ffe),
            Err(GuestMemoryError::OutOfBounds { .. })
        ));
        assert!(matches!(
            mem.write_u32(0x100e, 1),
            Err(GuestMemoryError::OutOfBounds { .. })
        ));
        assert!(mem.contains(0x1000, 16));
        assert!(!mem.contains(0x1000, 17));
        assert!(SharedMemory::with_base(0x1001, 16).is_err());
    }

    #[test]
    fn fill_spans_multiple_chunks() {
        let mem = SharedMemory::new(1024);
        mem.fill(1, 700, 0x5a).unwrap();
        let mut buf = [0u8; 703];
        mem.read_into(0, &mut buf).unwrap();
        assert_eq!(buf[0], 0);
        assert!(buf[1..701].iter().all(|&b| b == 0x5a));
        assert_eq!(buf[701], 0);
    }

    #[test]
    fn translate_uses_containing_region() {
        let mem: Arc<dyn HostMemory> = Arc::new(SharedMemory::new(0x3000));
        let table = MemoryTable::new(
            vec![
                MemoryRegion {
                    guest_phys_addr: 0,
                    size: 0x1000,
                    host_addr: 0x2000,
                },
                MemoryRegion {
                    guest_phys_addr: 0x10_0000,
                    size: 0x2000,
                    host_addr: 0,
                },
            ],
            mem,
        );

        assert_eq!(table.translate(0x10).unwrap(), 0x2010);
        assert_eq!(table.translate(0x10_1fff).unwrap(), 0x1fff);
        assert_eq!(
            table.translate(0x1000),
            Err(AddressNotMapped { gpa: 0x1000, len: 1 })
        );
        assert_eq!(table.translate_range(0xf00, 0x100).unwrap(), 0x2f00);
        assert!(table.translate_range(0xf00, 0x101).is_err());
        assert!(table.translate(u64::MAX).is_err());
    }
}
