//! # Memory Regions
//!
//! A [`Region`] is one contiguous physical interval together with the
//! attributes that decide whether it can merge with its neighbours: its
//! [`RegionFlags`] and its NUMA [`NodeId`].

use bitfield_struct::bitfield;
use core::fmt;
use core::ops::BitOr;
use kernel_memory_addresses::PhysicalAddress;

/// Attributes of a memory region.
///
/// Flags combine with union semantics ([`RegionFlags::union`], `|`). Two
/// regions only ever merge if their flags are identical.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq, Hash)]
pub struct RegionFlags {
    /// Bit 0, HOTPLUG: the region may be hot-removed.
    pub hotplug: bool,

    /// Bit 1, MIRROR: the region is address-range mirrored.
    pub mirror: bool,

    /// Bit 2, NOMAP: the region must not enter the kernel linear mapping.
    pub nomap: bool,

    /// Bits 3-31: reserved.
    #[bits(29)]
    __: u32,
}

impl RegionFlags {
    /// No special attributes.
    pub const NONE: Self = Self::new();
    pub const HOTPLUG: Self = Self::new().with_hotplug(true);
    pub const MIRROR: Self = Self::new().with_mirror(true);
    pub const NOMAP: Self = Self::new().with_nomap(true);

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() | other.into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() & !other.into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.into_bits() & other.into_bits() == other.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.into_bits() == 0
    }
}

impl BitOr for RegionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// NUMA node a region belongs to.
///
/// Regions added without a node carry [`NodeId::UNASSIGNED`]; they only match
/// iteration filters that accept any node.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub const UNASSIGNED: Self = Self(u32::MAX);

    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_assigned(self) -> bool {
        self.0 != Self::UNASSIGNED.0
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_assigned() {
            write!(f, "NodeId({})", self.0)
        } else {
            f.write_str("NodeId(unassigned)")
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_assigned() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("-")
        }
    }
}

/// A contiguous physical memory interval `[base, base + size)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Region {
    pub base: PhysicalAddress,
    pub size: u64,
    pub flags: RegionFlags,
    pub node: NodeId,
}

impl Region {
    /// Filler for unused array slots.
    pub const EMPTY: Self = Self {
        base: PhysicalAddress::zero(),
        size: 0,
        flags: RegionFlags::NONE,
        node: NodeId::UNASSIGNED,
    };

    #[inline]
    #[must_use]
    pub const fn new(base: PhysicalAddress, size: u64, flags: RegionFlags, node: NodeId) -> Self {
        Self {
            base,
            size,
            flags,
            node,
        }
    }

    /// Exclusive end of the region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        self.base.saturating_add(self.size)
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: PhysicalAddress) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() < self.end().as_u64()
    }

    /// Whether `[base, base + size)` intersects this region.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, base: PhysicalAddress, size: u64) -> bool {
        base.as_u64() < self.end().as_u64()
            && self.base.as_u64() < base.saturating_add(size).as_u64()
    }

    /// Whether a neighbour touching this region may be merged into it.
    #[inline]
    #[must_use]
    pub fn same_attributes(&self, other: &Self) -> bool {
        self.flags == other.flags && self.node == other.node
    }

    #[inline]
    #[must_use]
    pub const fn is_hotpluggable(&self) -> bool {
        self.flags.hotplug()
    }

    #[inline]
    #[must_use]
    pub const fn is_mirror(&self) -> bool {
        self.flags.mirror()
    }

    #[inline]
    #[must_use]
    pub const fn is_nomap(&self) -> bool {
        self.flags.nomap()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#018x}-{:#018x}], {:#x} bytes on node {} flags: {:#x}",
            self.base.as_u64(),
            self.end().as_u64().saturating_sub(1),
            self.size,
            self.node,
            self.flags.into_bits()
        )
    }
}

/// Cap `size` so that `base + size` does not overflow.
#[inline]
#[must_use]
pub(crate) const fn cap_size(base: PhysicalAddress, size: u64) -> u64 {
    let room = u64::MAX - base.as_u64();
    if size < room { size } else { room }
}
