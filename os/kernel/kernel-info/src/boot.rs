//! # Boot Memory Information
//!
//! What firmware and the boot loader tell the kernel about physical memory.
//! All of it is plain data: the hardware description parser fills it in, the
//! early memory code only consumes it.

use kernel_memory_addresses::PhysicalAddress;

/// A physical byte range `[base, base + size)`.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PhysRange {
    pub base: PhysicalAddress,
    pub size: u64,
}

impl PhysRange {
    #[must_use]
    pub const fn new(base: u64, size: u64) -> Self {
        Self {
            base: PhysicalAddress::new(base),
            size,
        }
    }

    /// Exclusive end, saturating at the top of the address space.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        self.base.saturating_add(self.size)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// How firmware classifies a memory range.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum MemoryKind {
    /// Ordinary RAM.
    #[default]
    Usable,
    /// RAM that must stay out of the kernel's linear mapping.
    NoMap,
    /// RAM that may be hot-removed later.
    Hotplug,
    /// Address-range mirrored RAM.
    Mirror,
}

/// One memory entry of the firmware memory map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRangeDesc {
    pub range: PhysRange,
    /// NUMA node, if firmware knows it.
    pub node: Option<u32>,
    pub kind: MemoryKind,
}

impl MemoryRangeDesc {
    #[must_use]
    pub const fn usable(base: u64, size: u64) -> Self {
        Self {
            range: PhysRange::new(base, size),
            node: None,
            kind: MemoryKind::Usable,
        }
    }

    #[must_use]
    pub const fn on_node(mut self, node: u32) -> Self {
        self.node = Some(node);
        self
    }

    #[must_use]
    pub const fn with_kind(mut self, kind: MemoryKind) -> Self {
        self.kind = kind;
        self
    }
}

/// A firmware-declared reservation (e.g. a `/reserved-memory` child).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReservedRangeDesc<'a> {
    pub range: PhysRange,
    pub name: Option<&'a str>,
    /// NUMA node the firmware attached the reservation to; informational.
    pub node: Option<u32>,
}

impl<'a> ReservedRangeDesc<'a> {
    #[must_use]
    pub const fn new(range: PhysRange) -> Self {
        Self {
            range,
            name: None,
            node: None,
        }
    }

    #[must_use]
    pub const fn named(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    #[must_use]
    pub const fn on_node(mut self, node: u32) -> Self {
        self.node = Some(node);
        self
    }
}

/// Everything the early memory code learns from firmware and the boot loader.
#[derive(Debug, Clone, Default)]
pub struct BootMemoryInfo<'a> {
    /// Memory map entries, in any order.
    pub memory: &'a [MemoryRangeDesc],

    /// `linux,usable-memory-range`-style override: memory outside it is dropped.
    pub usable_range: Option<PhysRange>,

    /// Firmware reservations.
    pub reserved: &'a [ReservedRangeDesc<'a>],

    /// Physical extent of the loaded kernel image (text through end of BSS).
    pub kernel_image: PhysRange,

    /// Page tables built before the allocator existed.
    pub page_tables: &'a [PhysRange],

    /// Initial ramdisk, if the boot loader loaded one.
    pub ramdisk: Option<PhysRange>,

    /// ELF core header left behind by a crashed kernel.
    pub elfcorehdr: Option<PhysRange>,

    /// Random seed for linear map placement, 0 if no entropy was available.
    pub memstart_offset_seed: u16,
}
