//! # Crash Dump Support
//!
//! Two reservations serve kdump. The running kernel sets memory aside for a
//! capture kernel (`crashkernel=`), and a capture kernel keeps the ELF core
//! header its predecessor left behind.
//!
//! Neither is required to boot: every rejection is logged and the kernel
//! carries on without the reservation.

use crate::init::reserve_optional;
use crate::{BootMemoryError, CrashKernelRegion};
use kernel_info::boot::PhysRange;
use kernel_info::cmdline::BootConfig;
use kernel_info::memory::PAGE_SIZE;
use kernel_memblock::MemBlock;
use kernel_memory_addresses::{PhysicalAddress, align_up};
use log::{info, warn};

/// Reserve memory for a capture kernel as requested by `crashkernel=`.
///
/// Without a base the highest `align`-aligned block below `dma32_limit`
/// is taken. An explicit base must be memory, must not be reserved yet, and
/// must be `align`-aligned.
///
/// # Errors
/// Only fatal bookkeeping failures; see [`MemBlockError::is_fatal`](kernel_memblock::MemBlockError::is_fatal).
pub fn reserve_crashkernel(
    memblock: &mut MemBlock,
    config: &BootConfig<'_>,
    dma32_limit: PhysicalAddress,
    align: u64,
) -> Result<Option<CrashKernelRegion>, BootMemoryError> {
    let request = match config.crash_kernel_request(memblock.phys_mem_size()) {
        Ok(Some(request)) if request.size != 0 => request,
        Ok(_) => return Ok(None),
        Err(e) => {
            warn!("crashkernel: ignoring malformed option: {e}");
            return Ok(None);
        }
    };

    let size = align_up(request.size, PAGE_SIZE);
    let base = if let Some(base) = request.base {
        let base = PhysicalAddress::new(base);
        if !memblock.is_region_memory(base, size) {
            warn!("cannot reserve crashkernel: region is not memory");
            return Ok(None);
        }
        if memblock.is_region_reserved(base, size) {
            warn!("cannot reserve crashkernel: region overlaps reserved memory");
            return Ok(None);
        }
        if !base.is_aligned_to(align) {
            warn!("cannot reserve crashkernel: base address is not {}MB aligned", align >> 20);
            return Ok(None);
        }
        base
    } else {
        // Highest fit below the DMA32 limit, whatever the allocation direction.
        let bottom_up = memblock.bottom_up();
        memblock.set_bottom_up(false);
        let found = memblock.find_in_range(PhysicalAddress::zero(), dma32_limit, size, align);
        memblock.set_bottom_up(bottom_up);
        let Some(base) = found else {
            warn!("cannot allocate crashkernel (size:{size:#x})");
            return Ok(None);
        };
        base
    };

    if !reserve_optional(memblock, base, size, "crashkernel")? {
        return Ok(None);
    }
    info!(
        "crashkernel reserved: {:#018x} - {:#018x} ({} MB)",
        base.as_u64(),
        base.as_u64() + size,
        size >> 20
    );
    Ok(Some(CrashKernelRegion::new(base, size)))
}

/// Keep the ELF core header of a crashed kernel out of the allocator.
///
/// # Errors
/// Only fatal bookkeeping failures.
pub fn reserve_elfcorehdr(
    memblock: &mut MemBlock,
    elfcorehdr: Option<PhysRange>,
) -> Result<Option<PhysRange>, BootMemoryError> {
    let Some(hdr) = elfcorehdr.filter(|hdr| !hdr.is_empty()) else {
        return Ok(None);
    };

    if memblock.is_region_reserved(hdr.base, hdr.size) {
        warn!("elfcorehdr is overlapped");
        return Ok(None);
    }
    if !reserve_optional(memblock, hdr.base, hdr.size, "elfcorehdr")? {
        return Ok(None);
    }
    info!(
        "Reserving {}KB of memory at {:#x} for elfcorehdr",
        hdr.size >> 10,
        hdr.base.as_u64()
    );
    Ok(Some(hdr))
}
