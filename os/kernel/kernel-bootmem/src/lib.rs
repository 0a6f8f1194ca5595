//! # Early Boot Memory Policy
//!
//! Decides which physical memory the kernel keeps, where the linear mapping
//! starts, and what must stay reserved before the page allocator takes over.
//! The bookkeeping itself lives in `kernel-memblock`; this crate drives it
//! from the firmware's memory description and the command line.
//!
//! ## Architecture
//!
//! ```text
//!  BootMemoryInfo ──┐                       ┌──► BootMemoryLayout
//!  (firmware)       │   ┌──────────────┐    │    memstart_addr, zones,
//!                   ├──►│  MemoryInit  │────┤    crash kernel, ...
//!  BootConfig ──────┘   │  phases 0-13 │    │
//!  (command line)       └──────┬───────┘    └──► FreeRange iterator
//!                              │ &mut            (page allocator)
//!                       ┌──────▼───────┐
//!                       │   MemBlock   │
//!                       └──────────────┘
//! ```
//!
//! ### Phases ([`init`])
//! A fixed, single-pass sequence; see [`MemoryInit`] and [`Phase`].
//!
//! ### Layout ([`layout`])
//! * **Tunables**: [`LayoutConfig`], defaulting to the compiled-in layout
//! * **Result**: [`BootMemoryLayout`] with zone limits and page frame range
//!
//! ### Crash Dumps ([`crash`])
//! `crashkernel=` placement and the core-dump header of a crashed kernel.
//!
//! ### Linear Mapping ([`linear_map`])
//! Physical to virtual translation; also maps grown region arrays.
//!
//! ## Error Policy
//!
//! Missing memory and a kernel image or page tables that cannot be reserved
//! stop the boot. Everything else (ramdisk, crash kernel, core-dump header,
//! firmware carve-outs) is logged and skipped.
//!
//! ## Example
//! ```rust
//! use kernel_bootmem::MemoryInit;
//! use kernel_info::boot::{BootMemoryInfo, MemoryRangeDesc, PhysRange};
//! use kernel_info::cmdline::BootConfig;
//! use kernel_memblock::MemBlock;
//!
//! let memory = [MemoryRangeDesc::usable(0x4000_0000, 0x8000_0000)];
//! let info = BootMemoryInfo {
//!     memory: &memory,
//!     kernel_image: PhysRange::new(0x4020_0000, 0x200_0000),
//!     ..BootMemoryInfo::default()
//! };
//! let config = BootConfig::parse("crashkernel=128M").unwrap();
//!
//! let mut memblock = MemBlock::new();
//! let mut init = MemoryInit::new(&mut memblock, info, config);
//! let layout = init.run().unwrap();
//!
//! assert_eq!(layout.memstart_addr, 0x4000_0000);
//! assert_eq!(layout.zones.dma.as_u64(), 0x8000_0000);
//! assert!(layout.crashkernel.is_some());
//!
//! let free: u64 = init.hand_off().unwrap().map(|r| r.size).sum();
//! assert_eq!(free, 0x8000_0000 - 0x200_0000 - 0x800_0000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod crash;
mod error;
pub mod init;
pub mod layout;
pub mod linear_map;

pub use error::BootMemoryError;
pub use init::{MemoryInit, Phase};
pub use layout::{BootMemoryLayout, CrashKernelRegion, LayoutConfig, ZoneLimits};
pub use linear_map::LinearMap;
