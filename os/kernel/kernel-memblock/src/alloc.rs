//! # Allocation
//!
//! First-fit search over free memory, followed by a reservation of what was
//! found. The scan direction follows [`MemBlock::bottom_up`]:
//!
//! | Direction | Walk | Candidate per free range |
//! |-----------|------|--------------------------|
//! | top-down (default) | descending | `align_down(end - size)` |
//! | bottom-up | ascending | `align_up(start)` |
//!
//! Requests for a specific node fall back to any node unless the node is
//! exact; with `kernelcore=mirror` requests first try mirrored memory and
//! fall back to any memory with a warning.

use crate::{MemBlock, MemBlockError, NodeId, RegionFlags};
use kernel_info::memory::SMP_CACHE_BYTES;
use kernel_memory_addresses::{PhysicalAddress, align_down, align_up};
use log::warn;

/// Window end meaning "up to the current limit".
pub const MEMBLOCK_ALLOC_ACCESSIBLE: PhysicalAddress = PhysicalAddress::zero();

/// Window end meaning "anywhere"; still bounded by the current limit.
pub const MEMBLOCK_ALLOC_ANYWHERE: PhysicalAddress = PhysicalAddress::MAX;

impl MemBlock {
    /// Flags allocations start out with.
    const fn allocation_flags(&self) -> RegionFlags {
        if self.mirrored_kernelmem {
            RegionFlags::MIRROR
        } else {
            RegionFlags::NONE
        }
    }

    /// Clamp the window `[start, end)` to the current limit.
    fn window(&self, start: PhysicalAddress, end: PhysicalAddress) -> (PhysicalAddress, PhysicalAddress) {
        let end = if end == MEMBLOCK_ALLOC_ACCESSIBLE {
            self.current_limit
        } else {
            end.min(self.current_limit)
        };
        (start, end.max(start))
    }

    /// Find, but do not reserve, `size` bytes aligned to `align` inside
    /// `[start, end)` on `node`, using free memory that passes `flags`.
    #[must_use]
    pub fn find_in_range_node(
        &self,
        size: u64,
        align: u64,
        start: PhysicalAddress,
        end: PhysicalAddress,
        node: Option<NodeId>,
        flags: RegionFlags,
    ) -> Option<PhysicalAddress> {
        let (start, end) = self.window(start, end);
        if self.bottom_up {
            self.find_bottom_up(size, align, start, end, node, flags)
        } else {
            self.find_top_down(size, align, start, end, node, flags)
        }
    }

    fn find_bottom_up(
        &self,
        size: u64,
        align: u64,
        start: PhysicalAddress,
        end: PhysicalAddress,
        node: Option<NodeId>,
        flags: RegionFlags,
    ) -> Option<PhysicalAddress> {
        self.free_ranges(node, flags).find_map(|r| {
            let this_start = r.start.clamp(start, end).as_u64();
            let this_end = r.end.clamp(start, end).as_u64();
            let candidate = align_up(this_start, align);
            (candidate < this_end && this_end - candidate >= size)
                .then_some(PhysicalAddress::new(candidate))
        })
    }

    fn find_top_down(
        &self,
        size: u64,
        align: u64,
        start: PhysicalAddress,
        end: PhysicalAddress,
        node: Option<NodeId>,
        flags: RegionFlags,
    ) -> Option<PhysicalAddress> {
        self.free_ranges_rev(node, flags).find_map(|r| {
            let this_start = r.start.clamp(start, end).as_u64();
            let this_end = r.end.clamp(start, end).as_u64();
            if this_end < size {
                return None;
            }
            let candidate = align_down(this_end - size, align);
            (candidate >= this_start).then_some(PhysicalAddress::new(candidate))
        })
    }

    /// Find, but do not reserve, `size` bytes aligned to `align` in
    /// `[start, end)` on any node.
    ///
    /// With mirrored kernel memory, mirrored ranges are tried first.
    #[must_use]
    pub fn find_in_range(
        &self,
        start: PhysicalAddress,
        end: PhysicalAddress,
        size: u64,
        align: u64,
    ) -> Option<PhysicalAddress> {
        let flags = self.allocation_flags();
        self.find_in_range_node(size, align, start, end, None, flags)
            .or_else(|| {
                if !flags.mirror() {
                    return None;
                }
                warn!("memblock: could not find {size:#x} bytes of mirrored memory, falling back");
                self.find_in_range_node(size, align, start, end, None, flags.difference(RegionFlags::MIRROR))
            })
    }

    /// Allocate and reserve `size` bytes aligned to `align` in `[start,
    /// end)`, preferring `node`.
    ///
    /// Without `exact_node` a failed search on `node` is retried on any
    /// node. An `align` of zero is taken as the cache line size.
    ///
    /// # Errors
    /// - [`MemBlockError::ZeroSize`] for empty requests.
    /// - [`MemBlockError::InvalidAlignment`] if `align` is not a power of two.
    /// - [`MemBlockError::OutOfMemory`] if nothing fits.
    /// - [`MemBlockError::ResizeDisabled`] if the reservation does not fit.
    /// - [`MemBlockError::Finalized`] after hand-off.
    pub fn alloc_range_nid(
        &mut self,
        size: u64,
        align: u64,
        start: PhysicalAddress,
        end: PhysicalAddress,
        node: Option<NodeId>,
        exact_node: bool,
    ) -> Result<PhysicalAddress, MemBlockError> {
        self.ensure_live()?;
        if size == 0 {
            return Err(MemBlockError::ZeroSize);
        }
        let align = if align == 0 {
            warn!("memblock: zero alignment requested, using {SMP_CACHE_BYTES}");
            SMP_CACHE_BYTES
        } else {
            align
        };
        if !align.is_power_of_two() {
            return Err(MemBlockError::InvalidAlignment(align));
        }

        let mut flags = self.allocation_flags();
        loop {
            let found = self
                .find_in_range_node(size, align, start, end, node, flags)
                .or_else(|| {
                    if exact_node || node.is_none() {
                        return None;
                    }
                    self.find_in_range_node(size, align, start, end, None, flags)
                });

            if let Some(base) = found {
                self.reserve_range(base, size)?;
                return Ok(base);
            }

            if flags.mirror() {
                flags = flags.difference(RegionFlags::MIRROR);
                warn!("memblock: could not allocate {size:#x} bytes of mirrored memory, falling back");
                continue;
            }

            return Err(MemBlockError::OutOfMemory);
        }
    }

    /// Allocate `size` bytes in `[start, end)` on any node.
    ///
    /// # Errors
    /// As [`alloc_range_nid`](Self::alloc_range_nid).
    pub fn phys_alloc_range(
        &mut self,
        size: u64,
        align: u64,
        start: PhysicalAddress,
        end: PhysicalAddress,
    ) -> Result<PhysicalAddress, MemBlockError> {
        self.alloc_range_nid(size, align, start, end, None, false)
    }

    /// Allocate `size` bytes anywhere below the current limit.
    ///
    /// # Errors
    /// As [`alloc_range_nid`](Self::alloc_range_nid).
    pub fn phys_alloc(&mut self, size: u64, align: u64) -> Result<PhysicalAddress, MemBlockError> {
        self.phys_alloc_range(size, align, PhysicalAddress::zero(), MEMBLOCK_ALLOC_ACCESSIBLE)
    }

    /// Allocate `size` bytes below the current limit, preferring `node`.
    ///
    /// # Errors
    /// As [`alloc_range_nid`](Self::alloc_range_nid).
    pub fn phys_alloc_try_nid(
        &mut self,
        size: u64,
        align: u64,
        node: NodeId,
    ) -> Result<PhysicalAddress, MemBlockError> {
        self.alloc_range_nid(
            size,
            align,
            PhysicalAddress::zero(),
            MEMBLOCK_ALLOC_ACCESSIBLE,
            Some(node),
            false,
        )
    }
}
