//! # Physical Memory Layout

use kernel_memory_addresses::{PageSize, Size1G, Size2M, Size4G, Size4K};

/// Base page size of the kernel.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// Number of physical address bits the MMU can output. Memory above
/// `1 << PHYS_MASK_SHIFT` is dropped during early boot.
pub const PHYS_MASK_SHIFT: u32 = 48;

/// Number of virtual address bits in the kernel half of the address space.
pub const VA_BITS: u32 = 48;

/// Start of the kernel's linear (direct) mapping of physical memory.
///
/// Physical address `memstart_addr` is mapped at this virtual address, every
/// other usable physical address follows at the same offset.
pub const PAGE_OFFSET: u64 = 0u64.wrapping_sub(1 << VA_BITS);

/// Span of physical memory the linear mapping can cover: half of the kernel
/// virtual address space.
pub const LINEAR_REGION_SIZE: u64 = 1 << (VA_BITS - 1);

/// Alignment of the linear mapping base (`memstart_addr`). With 4 KiB pages a
/// single level-1 block maps 1 GiB.
pub const MEMSTART_ALIGN: u64 = Size1G::SIZE;

/// The DMA zone covers the first 1 GiB of memory; some SoCs have peripherals
/// with this limited view of memory.
pub const ZONE_DMA_BITS: u32 = Size1G::SHIFT;

/// The DMA32 zone covers the rest of the 32-bit addressable memory.
pub const ZONE_DMA32_BITS: u32 = Size4G::SHIFT;

/// Boot protocol alignment of a crash (capture) kernel.
pub const CRASH_ALIGN: u64 = Size2M::SIZE;

/// Number of statically allocated entries per region set before growth
/// becomes possible.
pub const INIT_MEMBLOCK_REGIONS: usize = 128;

/// Number of statically allocated entries of the all-physical region set.
pub const INIT_PHYSMEM_REGIONS: usize = 4;

/// Fallback alignment for allocations that request none.
pub const SMP_CACHE_BYTES: u64 = 64;

const _: () = {
    assert!(MEMSTART_ALIGN.is_power_of_two());
    assert!(CRASH_ALIGN.is_power_of_two());
    assert!(SMP_CACHE_BYTES.is_power_of_two());
    assert!(LINEAR_REGION_SIZE.is_multiple_of(MEMSTART_ALIGN));
    assert!(PAGE_OFFSET.checked_add(LINEAR_REGION_SIZE).is_some());
    assert!(PHYS_MASK_SHIFT < 64);
    assert!(INIT_PHYSMEM_REGIONS <= INIT_MEMBLOCK_REGIONS);
};
