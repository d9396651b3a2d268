//! MMIO Mapping - Register Access Layer
//!
//! This module handles access to memory-mapped device registers and the
//! virtual address accounting of mapped regions.
//!
//! [`RegisterWindow`] is policy-free: no bounds or permission
//! checks, no ordering beyond what the bus gives. Offsets are the caller's
//! responsibility. A bad mapping is an attach-time failure, never something
//! an accessor reports.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::{CapabilityError, Result};

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Raw register accessor over a mapped window
///
/// Accessors take `&self`: device registers are shared between the consumer
/// side and interrupt/timer context, and coordination between them is the
/// hardware's job (write-one-to-clear and mask bits), not a software lock's.
pub trait RegisterWindow: Send + Sync {
    /// Read an 8-bit register
    fn read8(&self, offset: usize) -> u8;

    /// Write an 8-bit register
    fn write8(&self, offset: usize, value: u8);

    /// Size of the window in bytes
    fn size(&self) -> usize;

    /// Read a 32-bit little-endian register
    fn read32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.read8(offset),
            self.read8(offset + 1),
            self.read8(offset + 2),
            self.read8(offset + 3),
        ])
    }

    /// Write a 32-bit little-endian register
    fn write32(&self, offset: usize, value: u32) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write8(offset + i, byte);
        }
    }
}

/// MMIO register accessor
///
/// Provides volatile read/write operations to memory-mapped I/O regions.
/// This is the window a broker backed by real page mappings hands out from
/// `map_registers`; [`SoftBroker`](crate::SoftBroker) serves hardware models
/// instead.
#[derive(Debug)]
pub struct MmioRegion {
    base: usize,
    size: usize,
}

impl MmioRegion {
    /// Create a new MMIO region
    ///
    /// # Safety
    /// Caller must ensure `base..base + size` is mapped device memory that
    /// stays mapped for the lifetime of this region
    pub unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Get base address
    pub fn base(&self) -> usize {
        self.base
    }
}

impl RegisterWindow for MmioRegion {
    fn read8(&self, offset: usize) -> u8 {
        debug_assert!(offset < self.size);
        // SAFETY: the constructor contract guarantees the window is mapped.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u8) }
    }

    fn write8(&self, offset: usize, value: u8) {
        debug_assert!(offset < self.size);
        // SAFETY: the constructor contract guarantees the window is mapped.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u8, value) }
    }

    fn size(&self) -> usize {
        self.size
    }

    fn read32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.size);
        debug_assert!(offset % 4 == 0);
        // SAFETY: as above, and the register is naturally aligned.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.size);
        debug_assert!(offset % 4 == 0);
        // SAFETY: as above, and the register is naturally aligned.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

/// Memory-backed register window
///
/// Plain storage with no register side effects. Used to stand in for device
/// memory on hosts, and as the backing store of richer hardware models.
#[derive(Debug)]
pub struct RamWindow {
    cells: Box<[AtomicU8]>,
}

impl RamWindow {
    /// Create a zero-filled window of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            cells: (0..size).map(|_| AtomicU8::new(0)).collect(),
        }
    }
}

impl RegisterWindow for RamWindow {
    fn read8(&self, offset: usize) -> u8 {
        self.cells[offset].load(Ordering::SeqCst)
    }

    fn write8(&self, offset: usize, value: u8) {
        self.cells[offset].store(value, Ordering::SeqCst);
    }

    fn size(&self) -> usize {
        self.cells.len()
    }
}

/// Memory-mapped I/O region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    /// Virtual address where region is mapped
    pub vaddr: usize,

    /// Physical address of the region
    pub paddr: usize,

    /// Size in bytes
    pub size: usize,
}

/// MMIO mapper - virtual address accounting for device mappings
pub struct MmioMapper {
    /// Next available virtual address for MMIO
    next_vaddr: usize,

    /// Base virtual address for MMIO region
    mmio_base: usize,

    /// Size of MMIO region
    mmio_size: usize,

    /// Live mappings as (page-aligned vaddr, page-aligned size)
    live: Vec<(usize, usize)>,
}

impl MmioMapper {
    /// Create a new MMIO mapper
    ///
    /// # Arguments
    /// * `base` - Base virtual address for MMIO mappings
    /// * `size` - Total size available for MMIO
    pub fn new(base: usize, size: usize) -> Self {
        Self {
            next_vaddr: base,
            mmio_base: base,
            mmio_size: size,
            live: Vec::new(),
        }
    }

    /// Reserve virtual space for a physical MMIO region
    ///
    /// The returned virtual address preserves the offset of `paddr` within
    /// its page.
    ///
    /// # Errors
    /// Returns error if the region is empty or the virtual window is exhausted
    pub fn map_region(&mut self, paddr: usize, size: usize) -> Result<MappedRegion> {
        if size == 0 {
            return Err(CapabilityError::InvalidRange { base: paddr, size });
        }

        let start_offset = paddr % PAGE_SIZE;
        let aligned_size = pages_needed(size + start_offset) * PAGE_SIZE;

        if self.next_vaddr + aligned_size > self.mmio_base + self.mmio_size {
            return Err(CapabilityError::OutOfMemory {
                requested: aligned_size,
            });
        }

        let vaddr = self.next_vaddr;
        self.next_vaddr += aligned_size;
        self.live.push((vaddr, aligned_size));

        log::trace!(
            "mapped {:#x}+{:#x} at {:#x}",
            paddr,
            size,
            vaddr + start_offset
        );

        Ok(MappedRegion {
            vaddr: vaddr + start_offset,
            paddr,
            size,
        })
    }

    /// Release a previously mapped region
    ///
    /// Space is reclaimed when the most recent mappings are released.
    pub fn unmap_region(&mut self, region: &MappedRegion) -> Result<()> {
        let page = align_down(region.vaddr);
        let index = self
            .live
            .iter()
            .position(|&(vaddr, _)| vaddr == page)
            .ok_or(CapabilityError::InvalidRange {
                base: region.paddr,
                size: region.size,
            })?;
        self.live.remove(index);

        self.next_vaddr = self
            .live
            .iter()
            .map(|&(vaddr, size)| vaddr + size)
            .max()
            .unwrap_or(self.mmio_base);
        Ok(())
    }

    /// Get the next available virtual address
    pub fn next_vaddr(&self) -> usize {
        self.next_vaddr
    }

    /// Get remaining virtual address space
    pub fn available_space(&self) -> usize {
        (self.mmio_base + self.mmio_size) - self.next_vaddr
    }
}

/// Helper to calculate number of pages needed
pub fn pages_needed(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Helper to align address down to page boundary
pub fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Helper to align address up to page boundary
pub fn align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Helper to check if address is page-aligned
pub fn is_aligned(addr: usize) -> bool {
    addr % PAGE_SIZE == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mmio_mapper_creation() {
        let mapper = MmioMapper::new(0x2000_0000, 256 * 1024 * 1024);
        assert_eq!(mapper.next_vaddr(), 0x2000_0000);
        assert_eq!(mapper.available_space(), 256 * 1024 * 1024);
    }

    #[test]
    fn test_page_alignment() {
        assert_eq!(align_down(0x1234), 0x1000);
        assert_eq!(align_up(0x1234), 0x2000);
        assert_eq!(align_up(0x1000), 0x1000);
        assert!(is_aligned(0x1000));
        assert!(!is_aligned(0x1234));
    }

    #[test]
    fn test_pages_needed() {
        assert_eq!(pages_needed(4096), 1);
        assert_eq!(pages_needed(4097), 2);
        assert_eq!(pages_needed(100), 1);
    }

    #[test]
    fn test_map_region_unaligned() {
        let mut mapper = MmioMapper::new(0x2000_0000, 1024 * 1024);

        // Mailbox controllers sit at odd offsets inside the LPC page
        let region = mapper.map_region(0x1e78_9200, 0x60).unwrap();

        assert_eq!(region.paddr, 0x1e78_9200);
        assert_eq!(region.size, 0x60);
        assert_eq!(region.vaddr % PAGE_SIZE, 0x200);
    }

    #[test]
    fn test_map_and_unmap_reclaims_space() {
        let mut mapper = MmioMapper::new(0x2000_0000, 4 * PAGE_SIZE);

        let first = mapper.map_region(0xFEBC_0000, PAGE_SIZE).unwrap();
        let second = mapper.map_region(0xFEBD_0000, 2 * PAGE_SIZE).unwrap();
        assert!(first.vaddr + first.size <= second.vaddr);
        assert_eq!(mapper.available_space(), PAGE_SIZE);

        mapper.unmap_region(&second).unwrap();
        assert_eq!(mapper.available_space(), 3 * PAGE_SIZE);

        mapper.unmap_region(&first).unwrap();
        assert_eq!(mapper.next_vaddr(), 0x2000_0000);
    }

    #[test]
    fn test_unmap_unknown_region() {
        let mut mapper = MmioMapper::new(0x2000_0000, PAGE_SIZE);
        let bogus = MappedRegion {
            vaddr: 0x3000_0000,
            paddr: 0,
            size: 16,
        };
        assert!(matches!(
            mapper.unmap_region(&bogus),
            Err(CapabilityError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_out_of_virtual_space() {
        let mut mapper = MmioMapper::new(0x2000_0000, 4096); // Only 1 page

        let result = mapper.map_region(0xFEBC0000, 8192);
        assert!(matches!(result, Err(CapabilityError::OutOfMemory { .. })));
    }

    #[test]
    fn test_ram_window_words() {
        let window = RamWindow::new(0x100);
        window.write32(0x88, 0x3000_0e00);
        assert_eq!(window.read8(0x88), 0x00);
        assert_eq!(window.read8(0x89), 0x0e);
        assert_eq!(window.read32(0x88), 0x3000_0e00);
        assert_eq!(window.size(), 0x100);
    }

    #[test]
    fn test_mmio_region_volatile_access() {
        let mut backing = [0u32; 4];
        let base = backing.as_mut_ptr() as usize;
        // SAFETY: `backing` outlives `region` and is 16 bytes long.
        let region = unsafe { MmioRegion::new(base, 16) };

        region.write32(4, 0xfe00_01ff);
        region.write8(8, 0x80);
        assert_eq!(region.read32(4), 0xfe00_01ff);
        assert_eq!(region.read8(8), 0x80);
        assert_eq!(region.base(), base);
        assert_eq!(backing[1], 0xfe00_01ff);
    }
}
