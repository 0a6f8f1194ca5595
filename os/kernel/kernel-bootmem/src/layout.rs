//! # Memory Layout
//!
//! The tunables early memory initialization works with, and the layout it
//! reports back once memory has been trimmed and reserved.

use crate::LinearMap;
use kernel_info::boot::PhysRange;
use kernel_info::memory::{
    CRASH_ALIGN, LINEAR_REGION_SIZE, MEMSTART_ALIGN, PAGE_OFFSET, PHYS_MASK_SHIFT,
    ZONE_DMA_BITS, ZONE_DMA32_BITS,
};
use kernel_memory_addresses::{PhysicalAddress, align_down};

/// Architecture parameters of the physical and linear layout.
///
/// [`Default`] takes them from [`kernel_info::memory`]; tests and other
/// configurations may shrink them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LayoutConfig {
    /// Memory at or above `1 << phys_mask_shift` is dropped.
    pub phys_mask_shift: u32,
    /// Span of physical memory the linear mapping covers.
    pub linear_region_size: u64,
    /// Alignment of `memstart_addr`, also the KASLR step.
    pub memstart_align: u64,
    pub page_offset: u64,
    pub crash_align: u64,
    pub zone_dma_bits: u32,
    pub zone_dma32_bits: u32,
    /// Apply `memstart_offset_seed`. Off, the seed is ignored.
    pub randomize: bool,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            phys_mask_shift: PHYS_MASK_SHIFT,
            linear_region_size: LINEAR_REGION_SIZE,
            memstart_align: MEMSTART_ALIGN,
            page_offset: PAGE_OFFSET,
            crash_align: CRASH_ALIGN,
            zone_dma_bits: ZONE_DMA_BITS,
            zone_dma32_bits: ZONE_DMA32_BITS,
            randomize: true,
        }
    }
}

/// Upper bounds (exclusive) of the memory zones.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ZoneLimits {
    pub dma: PhysicalAddress,
    pub dma32: PhysicalAddress,
    pub normal: PhysicalAddress,
}

impl ZoneLimits {
    /// Zone limits for memory spanning `[start, end)`.
    #[must_use]
    pub fn compute(start: PhysicalAddress, end: PhysicalAddress, config: &LayoutConfig) -> Self {
        Self {
            dma: max_zone_phys(start, end, config.zone_dma_bits),
            dma32: max_zone_phys(start, end, config.zone_dma32_bits),
            normal: end,
        }
    }
}

/// End of the `bits`-wide window starting at the `2^bits` block that holds
/// `start`, capped at `end`.
///
/// Devices with a `bits`-wide view of memory see the block their offset
/// places them in, so memory that starts high still gets a DMA zone.
#[must_use]
pub fn max_zone_phys(start: PhysicalAddress, end: PhysicalAddress, bits: u32) -> PhysicalAddress {
    let Some(span) = 1u64.checked_shl(bits) else {
        return end;
    };
    let offset = align_down(start.as_u64(), span);
    PhysicalAddress::new(offset.saturating_add(span)).min(end)
}

/// Memory set aside for a crash (capture) kernel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CrashKernelRegion {
    pub start: PhysicalAddress,
    /// Last byte, inclusive.
    pub end: PhysicalAddress,
}

impl CrashKernelRegion {
    #[must_use]
    pub const fn new(base: PhysicalAddress, size: u64) -> Self {
        Self {
            start: base,
            end: PhysicalAddress::new(base.as_u64() + size - 1),
        }
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64() + 1
    }
}

/// What early memory initialization decided.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BootMemoryLayout {
    /// Physical address mapped at `PAGE_OFFSET`. Negative after a large
    /// randomization shift.
    pub memstart_addr: i64,
    pub physvirt_offset: u64,
    pub zones: ZoneLimits,
    /// First page frame with memory.
    pub min_pfn: u64,
    /// One past the last page frame with memory.
    pub max_pfn: u64,
    /// Linear map address just past the end of memory.
    pub high_memory: u64,
    /// The ramdisk as loaded, if it was kept.
    pub ramdisk: Option<PhysRange>,
    pub crashkernel: Option<CrashKernelRegion>,
    pub elfcorehdr: Option<PhysRange>,
}

impl BootMemoryLayout {
    #[inline]
    #[must_use]
    pub const fn linear_map(&self) -> LinearMap {
        LinearMap::from_offset(self.physvirt_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    #[test]
    fn zones_from_zero() {
        let config = LayoutConfig::default();
        let zones = ZoneLimits::compute(pa(0), pa(0x2_0000_0000), &config);
        assert_eq!(zones.dma, pa(0x4000_0000));
        assert_eq!(zones.dma32, pa(0x1_0000_0000));
        assert_eq!(zones.normal, pa(0x2_0000_0000));
    }

    #[test]
    fn small_memory_caps_every_zone() {
        let config = LayoutConfig::default();
        let zones = ZoneLimits::compute(pa(0), pa(0x1000_0000), &config);
        assert_eq!(zones.dma, pa(0x1000_0000));
        assert_eq!(zones.dma32, pa(0x1000_0000));
    }

    #[test]
    fn zones_follow_memory_that_starts_high() {
        assert_eq!(
            max_zone_phys(pa(0x80_4000_0000), pa(0x81_0000_0000), 30),
            pa(0x80_8000_0000)
        );
        assert_eq!(
            max_zone_phys(pa(0x80_4000_0000), pa(0x90_0000_0000), 32),
            pa(0x81_0000_0000)
        );
        assert_eq!(max_zone_phys(pa(0x1000), pa(0x2000), 64), pa(0x2000));
    }

    #[test]
    fn crash_kernel_end_is_inclusive() {
        let crash = CrashKernelRegion::new(pa(0x2000_0000), 0x1000_0000);
        assert_eq!(crash.end, pa(0x2fff_ffff));
        assert_eq!(crash.size(), 0x1000_0000);
    }
}
