//! # Early Boot Physical Memory Bookkeeping
//!
//! This crate tracks physical memory from the moment firmware describes it
//! until the page allocator takes over. It knows which ranges exist, which
//! are in use, and hands out memory for boot-time data structures without
//! any allocator of its own.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    MemBlock                          │
//! │   add / remove / reserve / free / mark_* / trims     │
//! │   alloc_range_nid / phys_alloc / find_in_range       │
//! └──────────┬────────────────────────────┬──────────────┘
//!            │                            │
//! ┌──────────▼──────────┐      ┌──────────▼──────────────┐
//! │   RegionSet  x3     │◄─────┤   MemRanges             │
//! │ memory / reserved / │      │ memory \ reserved,      │
//! │ physmem             │      │ forward or reverse      │
//! └──────────┬──────────┘      └─────────────────────────┘
//!            │ relocate (when full, after allow_resize)
//! ┌──────────▼──────────┐
//! │ RegionArrayMapper   │
//! └─────────────────────┘
//! ```
//!
//! ### Regions ([`region`], [`region_set`])
//! * **Region**: base, size, [`RegionFlags`] and [`NodeId`]
//! * **RegionSet**: sorted, non-overlapping, merged; cached total size
//! * **Storage**: inline arrays, relocatable into tracked memory
//!
//! ### Range Arithmetic ([`ranges`])
//! [`MemRanges`] yields the parts of one set not covered by another, lazily
//! and in either direction, filtered by node and flags.
//!
//! ### Allocation ([`alloc`])
//! First fit, top-down by default, with node and mirror fallbacks. Every
//! successful allocation is reserved before it is returned.
//!
//! ## Lifecycle
//!
//! 1. Firmware ranges are added to `memory` and `physmem`.
//! 2. Boot policy trims memory and reserves the kernel and friends.
//! 3. Early allocations are served from free memory.
//! 4. [`MemBlock::hand_off`] yields all remaining free memory and freezes
//!    the bookkeeping.
//!
//! ## Example
//! ```rust
//! use kernel_memblock::MemBlock;
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let mut mb = MemBlock::new();
//! mb.add(PhysicalAddress::new(0x4000_0000), 0x4000_0000).unwrap();
//! mb.reserve(PhysicalAddress::new(0x4008_0000), 0x20_0000).unwrap();
//!
//! let table = mb.phys_alloc(0x1000, 0x1000).unwrap();
//! assert_eq!(table.as_u64(), 0x7fff_f000);
//! assert!(mb.is_reserved(table));
//!
//! let free: u64 = mb.hand_off().map(|r| r.size).sum();
//! assert_eq!(free, 0x4000_0000 - 0x20_0000 - 0x1000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod alloc;
mod error;
mod memblock;
pub mod ranges;
pub mod region;
pub mod region_set;
mod resize;

pub use self::alloc::{MEMBLOCK_ALLOC_ACCESSIBLE, MEMBLOCK_ALLOC_ANYWHERE};
pub use error::MemBlockError;
pub use memblock::{FreeRange, MemBlock};
pub use ranges::{Direction, MemRange, MemRanges, RangeFilter};
pub use region::{NodeId, Region, RegionFlags};
pub use region_set::{RegionKind, RegionSet};
pub use resize::RegionArrayMapper;
