//! # Range Arithmetic
//!
//! [`MemRanges`] walks two sorted region sets at once and yields every
//! maximal interval of set A that set B does not cover. With `memory` as A
//! and `reserved` as B this is the free memory the allocator searches.
//!
//! ```text
//!   A (memory):    [=========]     [==============]
//!   B (reserved):     [==]               [===]
//!   gaps of B:  ──────)  (──────────────)     (──────────▶
//!   yielded:       [=]    [=]      [====]     [===]
//! ```
//!
//! The walk is a merge of A's regions with the *gaps* between B's regions,
//! so each step is O(1) and the iterator allocates nothing. It borrows both
//! sets, which keeps them immutable while a walk is in progress, and it is
//! [`Clone`] so a walk can be restarted from any position.

use crate::region::{NodeId, Region, RegionFlags};
use crate::region_set::{RegionKind, RegionSet};
use kernel_memory_addresses::PhysicalAddress;

/// Scan order of a [`MemRanges`] walk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Ascending addresses.
    Forward,
    /// Descending addresses.
    Reverse,
}

/// One interval produced by a [`MemRanges`] walk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemRange {
    pub start: PhysicalAddress,
    /// Exclusive.
    pub end: PhysicalAddress,
    pub node: NodeId,
}

impl MemRange {
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }
}

impl From<&Region> for MemRange {
    fn from(r: &Region) -> Self {
        Self {
            start: r.base,
            end: r.end(),
            node: r.node,
        }
    }
}

/// Which regions of the `memory` set a walk considers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct RangeFilter {
    /// `None` accepts every node.
    pub node: Option<NodeId>,
    /// `MIRROR` restricts the walk to mirrored memory; `NOMAP` admits
    /// regions that are excluded from the linear map.
    pub flags: RegionFlags,
    /// Skip hot-pluggable memory.
    pub skip_hotplug: bool,
}

impl RangeFilter {
    #[must_use]
    pub fn skips(&self, r: &Region) -> bool {
        if self.node.is_some_and(|node| node != r.node) {
            return true;
        }
        if self.skip_hotplug && r.is_hotpluggable() {
            return true;
        }
        if self.flags.mirror() && !r.is_mirror() {
            return true;
        }
        !self.flags.nomap() && r.is_nomap()
    }
}

/// Lazy walk over the parts of one region set not covered by another.
#[derive(Debug, Clone)]
pub struct MemRanges<'a> {
    a: &'a [Region],
    b: Option<&'a [Region]>,
    filter: Option<RangeFilter>,
    direction: Direction,
    /// Forward: next region of A. Reverse: one past it.
    idx_a: usize,
    /// Forward: next gap of B. Reverse: one past it.
    idx_b: usize,
}

impl<'a> MemRanges<'a> {
    /// Walk `a` minus `b`, or just `a` when `b` is `None`.
    ///
    /// The filter only applies when `a` is the `memory` set; other sets are
    /// walked in full.
    #[must_use]
    pub fn new(
        a: &'a RegionSet,
        b: Option<&'a RegionSet>,
        filter: RangeFilter,
        direction: Direction,
    ) -> Self {
        let a_regions = a.regions();
        let b_regions = b.map(RegionSet::regions);
        let (idx_a, idx_b) = match direction {
            Direction::Forward => (0, 0),
            Direction::Reverse => (a_regions.len(), b_regions.map_or(0, |b| b.len() + 1)),
        };
        Self {
            a: a_regions,
            b: b_regions,
            filter: (a.kind() == RegionKind::Memory).then_some(filter),
            direction,
            idx_a,
            idx_b,
        }
    }

    #[inline]
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    fn skips(&self, r: &Region) -> bool {
        self.filter.is_some_and(|f| f.skips(r))
    }

    /// Gap `i` lies between region `i - 1` and region `i` of `b`.
    fn gap(b: &[Region], i: usize) -> (PhysicalAddress, PhysicalAddress) {
        let start = if i == 0 {
            PhysicalAddress::zero()
        } else {
            b[i - 1].end()
        };
        let end = b.get(i).map_or(PhysicalAddress::MAX, |r| r.base);
        (start, end)
    }

    fn next_forward(&mut self) -> Option<MemRange> {
        while self.idx_a < self.a.len() {
            let m = self.a[self.idx_a];
            if self.skips(&m) {
                self.idx_a += 1;
                continue;
            }

            let Some(b) = self.b else {
                self.idx_a += 1;
                return Some(MemRange::from(&m));
            };

            while self.idx_b <= b.len() {
                let (r_start, r_end) = Self::gap(b, self.idx_b);
                if r_start >= m.end() {
                    break;
                }
                if m.base < r_end {
                    let out = MemRange {
                        start: m.base.max(r_start),
                        end: m.end().min(r_end),
                        node: m.node,
                    };
                    if m.end() <= r_end {
                        self.idx_a += 1;
                    } else {
                        self.idx_b += 1;
                    }
                    return Some(out);
                }
                self.idx_b += 1;
            }
            self.idx_a += 1;
        }
        None
    }

    fn next_reverse(&mut self) -> Option<MemRange> {
        while self.idx_a > 0 {
            let m = self.a[self.idx_a - 1];
            if self.skips(&m) {
                self.idx_a -= 1;
                continue;
            }

            let Some(b) = self.b else {
                self.idx_a -= 1;
                return Some(MemRange::from(&m));
            };

            while self.idx_b > 0 {
                let (r_start, r_end) = Self::gap(b, self.idx_b - 1);
                if r_end <= m.base {
                    break;
                }
                if m.end() > r_start {
                    let out = MemRange {
                        start: m.base.max(r_start),
                        end: m.end().min(r_end),
                        node: m.node,
                    };
                    if m.base >= r_start {
                        self.idx_a -= 1;
                    } else {
                        self.idx_b -= 1;
                    }
                    return Some(out);
                }
                self.idx_b -= 1;
            }
            self.idx_a -= 1;
        }
        None
    }
}

impl Iterator for MemRanges<'_> {
    type Item = MemRange;

    fn next(&mut self) -> Option<Self::Item> {
        match self.direction {
            Direction::Forward => self.next_forward(),
            Direction::Reverse => self.next_reverse(),
        }
    }
}

impl core::iter::FusedIterator for MemRanges<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    fn set(kind: RegionKind, spans: &[(u64, u64)]) -> RegionSet {
        let mut set = RegionSet::new(kind);
        for &(base, size) in spans {
            set.insert_range(pa(base), size, NodeId::new(0), RegionFlags::NONE)
                .unwrap();
        }
        set
    }

    fn collect(ranges: MemRanges<'_>) -> Vec<(u64, u64)> {
        ranges.map(|r| (r.start.as_u64(), r.end.as_u64())).collect()
    }

    #[test]
    fn free_ranges_in_both_directions() {
        let memory = set(RegionKind::Memory, &[(0x0, 0x10000), (0x20000, 0x10000)]);
        let reserved = set(
            RegionKind::Reserved,
            &[(0x1000, 0x1000), (0x8000, 0x19000), (0x2f000, 0x1000)],
        );

        let forward = MemRanges::new(&memory, Some(&reserved), RangeFilter::default(), Direction::Forward);
        assert_eq!(
            collect(forward),
            [(0x0, 0x1000), (0x2000, 0x8000), (0x21000, 0x2f000)]
        );

        let reverse = MemRanges::new(&memory, Some(&reserved), RangeFilter::default(), Direction::Reverse);
        assert_eq!(
            collect(reverse),
            [(0x21000, 0x2f000), (0x2000, 0x8000), (0x0, 0x1000)]
        );
    }

    #[test]
    fn empty_subtrahend_yields_whole_regions() {
        let memory = set(RegionKind::Memory, &[(0x1000, 0x1000), (0x4000, 0x1000)]);
        let reserved = RegionSet::new(RegionKind::Reserved);
        for direction in [Direction::Forward, Direction::Reverse] {
            let with_b = collect(MemRanges::new(&memory, Some(&reserved), RangeFilter::default(), direction));
            let without_b = collect(MemRanges::new(&memory, None, RangeFilter::default(), direction));
            assert_eq!(with_b, without_b);
            assert_eq!(with_b.len(), 2);
        }
    }

    #[test]
    fn fully_reserved_memory_yields_nothing() {
        let memory = set(RegionKind::Memory, &[(0x1000, 0x1000)]);
        let reserved = set(RegionKind::Reserved, &[(0x0, 0x4000)]);
        assert_eq!(
            MemRanges::new(&memory, Some(&reserved), RangeFilter::default(), Direction::Forward).count(),
            0
        );
        assert_eq!(
            MemRanges::new(&memory, Some(&reserved), RangeFilter::default(), Direction::Reverse).count(),
            0
        );
    }

    #[test]
    fn filter_skips_nodes_and_flags() {
        let mut memory = RegionSet::new(RegionKind::Memory);
        memory.insert_range(pa(0x0), 0x1000, NodeId::new(0), RegionFlags::NONE).unwrap();
        memory.insert_range(pa(0x1000), 0x1000, NodeId::new(1), RegionFlags::NONE).unwrap();
        memory.insert_range(pa(0x2000), 0x1000, NodeId::new(0), RegionFlags::MIRROR).unwrap();
        memory.insert_range(pa(0x3000), 0x1000, NodeId::new(0), RegionFlags::NOMAP).unwrap();
        memory.insert_range(pa(0x4000), 0x1000, NodeId::new(0), RegionFlags::HOTPLUG).unwrap();

        let all = |filter| collect(MemRanges::new(&memory, None, filter, Direction::Forward));

        assert_eq!(all(RangeFilter::default()).len(), 4);
        assert_eq!(
            all(RangeFilter { node: Some(NodeId::new(1)), ..RangeFilter::default() }),
            [(0x1000, 0x2000)]
        );
        assert_eq!(
            all(RangeFilter { flags: RegionFlags::MIRROR, ..RangeFilter::default() }),
            [(0x2000, 0x3000)]
        );
        assert_eq!(
            all(RangeFilter { flags: RegionFlags::NOMAP, ..RangeFilter::default() }).len(),
            5
        );
        assert_eq!(
            all(RangeFilter { skip_hotplug: true, ..RangeFilter::default() }).len(),
            3
        );
    }

    #[test]
    fn filter_is_ignored_outside_memory() {
        let mut reserved = RegionSet::new(RegionKind::Reserved);
        reserved.insert_range(pa(0x0), 0x1000, NodeId::UNASSIGNED, RegionFlags::NOMAP).unwrap();
        let filter = RangeFilter { node: Some(NodeId::new(3)), ..RangeFilter::default() };
        assert_eq!(MemRanges::new(&reserved, None, filter, Direction::Forward).count(), 1);
    }

    #[test]
    fn walks_can_be_restarted_from_a_clone() {
        let memory = set(RegionKind::Memory, &[(0x0, 0x1000), (0x2000, 0x1000), (0x4000, 0x1000)]);
        let mut walk = MemRanges::new(&memory, None, RangeFilter::default(), Direction::Forward);
        assert_eq!(walk.next().map(|r| r.start), Some(pa(0x0)));
        let resumed = walk.clone();
        assert_eq!(collect(walk), collect(resumed));
    }
}
