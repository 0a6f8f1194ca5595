//! # Kernel Memory Configuration and Boot Interface
//!
//! This crate defines the data the early memory code is configured with: the
//! compile-time physical layout, the firmware's description of memory, and
//! the memory-related command line options. It is the single source of truth
//! shared by the region bookkeeping (`kernel-memblock`) and the boot policy
//! (`kernel-bootmem`).
//!
//! ## Architecture
//!
//! ### Memory Layout ([`memory`])
//! Compile-time constants of the physical and linear-map layout:
//! * **Address Width**: [`PHYS_MASK_SHIFT`](memory::PHYS_MASK_SHIFT) bounds addressable memory
//! * **Linear Mapping**: [`PAGE_OFFSET`](memory::PAGE_OFFSET) and
//!   [`LINEAR_REGION_SIZE`](memory::LINEAR_REGION_SIZE)
//! * **Zones**: DMA and DMA32 reach
//! * **Bookkeeping**: static region array sizes
//!
//! ### Boot Information ([`boot`])
//! The firmware-to-kernel hand-off of memory facts:
//! * **Memory Map**: usable ranges with node ids and attributes
//! * **Reservations**: firmware carve-outs, kernel image, early page tables
//! * **Optional Extras**: usable-range override, ramdisk, ELF core header, KASLR seed
//!
//! ### Command Line ([`cmdline`])
//! `mem=`, `crashkernel=`, `movable_node`, `kernelcore=mirror` and
//! `memblock=debug`, parsed without allocation.
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000_0000 ┌─────────────────────────────────┐
//!                  │  (holes, MMIO, firmware)        │
//! memstart_addr    ├─────────────────────────────────┤ ◄─ mapped at PAGE_OFFSET
//!                  │  Usable RAM                     │
//!                  │  Kernel image, ramdisk, ...     │
//! memstart_addr +  ├─────────────────────────────────┤
//! LINEAR_REGION    │  Not reachable via linear map   │
//! 1 << PHYS_MASK   └─────────────────────────────────┘
//! ```
//!
//! ## Safety Guarantees
//!
//! * **Compile-time checks**: layout constants are validated with `const` assertions
//! * **No Unsafe Code**: marked `#![deny(unsafe_code)]`

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod cmdline;
pub mod memory;
