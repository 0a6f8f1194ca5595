//! # Region Array Relocation
//!
//! The region sets start out in statically sized arrays. Once the kernel can
//! touch the physical memory it tracks, the arrays may be replaced by larger
//! ones carved out of that very memory. Turning a physical address into a
//! writable slice is the caller's business and is abstracted by
//! [`RegionArrayMapper`], in the same spirit as a `PhysMapper` for page
//! tables.
//!
//! ```text
//!   static array (128)           free memory
//!  ┌──────────────────┐        ┌───────────────────────────────┐
//!  │ r0 r1 ... r127   │ ─copy─►│ r0 r1 ... r127  <empty x 128> │ reserved
//!  └──────────────────┘        └───────────────────────────────┘
//! ```

use crate::Region;
use kernel_memory_addresses::PhysicalAddress;

/// Maps freshly allocated physical memory as a region array.
///
/// Passed to [`MemBlock::allow_resize`](crate::MemBlock::allow_resize); until
/// then every set that runs out of slots fails with
/// [`MemBlockError::ResizeDisabled`](crate::MemBlockError::ResizeDisabled).
pub trait RegionArrayMapper: Sync {
    /// Return a slice of `len` regions backed by the physical memory at
    /// `base`.
    ///
    /// # Safety
    /// - `[base, base + len * size_of::<Region>())` must be mapped writable.
    /// - The range is owned by the caller from now on; nothing else may
    ///   alias it.
    /// - The memory must be initialized, e.g. zeroed. Every slot is
    ///   overwritten before it is read.
    unsafe fn map_region_array(&self, base: PhysicalAddress, len: usize) -> &'static mut [Region];
}
