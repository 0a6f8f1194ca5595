//! # Physical Memory Address Types
//!
//! Strongly typed physical addresses and allocation granules used by the
//! early boot memory bookkeeping.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`PhysicalAddress`] | A raw 64-bit physical address with alignment helpers. |
//! | [`PageSize`] | Marker trait for power-of-two granules ([`Size4K`], [`Size2M`], [`Size1G`], [`Size4G`]). |
//!
//! The [`PageSize`] trait defines constants [`SIZE`](PageSize::SIZE),
//! [`SHIFT`](PageSize::SHIFT) and [`MASK`](PageSize::MASK) used throughout the
//! helpers. Alignment for run-time values (e.g. an allocation request's
//! alignment) goes through [`align_up`] / [`align_down`].
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let start = PhysicalAddress::new(0x8000_1000);
//! assert_eq!(start.align_down::<Size2M>().as_u64(), 0x8000_0000);
//! assert_eq!(start.pfn_down::<Size4K>(), 0x80001);
//! assert_eq!(align_up(0x1001, 0x1000), 0x2000);
//! ```
//!
//! ## Design Notes
//!
//! - The address type is `#[repr(transparent)]` and implements `Copy`, `Eq`,
//!   `Ord`, and `Hash`, so region arrays can be sorted and searched by base.
//! - Rounding up never wraps; near the top of the address space it saturates
//!   to the highest aligned address.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;

pub use page_size::{PageSize, Size1G, Size2M, Size4G, Size4K};
pub use physical_address::{PhysicalAddress, align_down, align_up};
