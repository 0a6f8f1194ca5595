//! # Linear Mapping
//!
//! The kernel maps all usable RAM at a fixed offset. Physical address
//! `memstart_addr` appears at `PAGE_OFFSET`, everything else follows:
//!
//! ```text
//!   va = pa - physvirt_offset        physvirt_offset = memstart_addr - PAGE_OFFSET
//!   pa = va + physvirt_offset
//! ```
//!
//! All arithmetic wraps: `memstart_addr` may lie below zero once the
//! placement is randomized, and `PAGE_OFFSET` sits at the top of the
//! address space.

use kernel_memblock::{Region, RegionArrayMapper};
use kernel_memory_addresses::PhysicalAddress;

/// Translation between physical addresses and the linear mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LinearMap {
    physvirt_offset: u64,
}

impl LinearMap {
    #[inline]
    #[must_use]
    pub const fn new(memstart_addr: i64, page_offset: u64) -> Self {
        Self {
            physvirt_offset: memstart_addr.cast_unsigned().wrapping_sub(page_offset),
        }
    }

    #[inline]
    #[must_use]
    pub const fn from_offset(physvirt_offset: u64) -> Self {
        Self { physvirt_offset }
    }

    #[inline]
    #[must_use]
    pub const fn physvirt_offset(self) -> u64 {
        self.physvirt_offset
    }

    /// Virtual address of `pa` in the linear mapping.
    #[inline]
    #[must_use]
    pub const fn phys_to_virt(self, pa: PhysicalAddress) -> u64 {
        pa.as_u64().wrapping_sub(self.physvirt_offset)
    }

    /// Physical address behind the linear mapping address `va`.
    #[inline]
    #[must_use]
    pub const fn virt_to_phys(self, va: u64) -> PhysicalAddress {
        PhysicalAddress::new(va.wrapping_add(self.physvirt_offset))
    }
}

/// Grown region arrays are accessed through the linear mapping.
impl RegionArrayMapper for LinearMap {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn map_region_array(&self, base: PhysicalAddress, len: usize) -> &'static mut [Region] {
        let ptr = core::ptr::with_exposed_provenance_mut::<Region>(self.phys_to_virt(base) as usize);
        // SAFETY: the caller guarantees that `base` is mapped writable,
        // initialized and exclusively owned for `len` regions.
        unsafe { core::slice::from_raw_parts_mut(ptr, len) }
    }
}
