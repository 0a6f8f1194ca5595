//! # Region Sets
//!
//! A [`RegionSet`] is the sorted, disjoint and maximally merged collection of
//! [`Region`]s of one [`RegionKind`]. Every mutation is O(n) in the number of
//! regions and keeps three invariants:
//!
//! 1. regions are sorted ascending by base and never overlap,
//! 2. touching neighbours with identical flags and node are merged,
//! 3. [`RegionSet::total_size`] equals the sum of all region sizes.
//!
//! ## Storage
//!
//! Sets begin life in an inline array of
//! [`INIT_MEMBLOCK_REGIONS`] slots. The owning
//! [`MemBlock`](crate::MemBlock) may later [`relocate`](RegionSet::relocate)
//! a set into a larger array it allocated from tracked memory. A set never
//! grows on its own: operations that need more slots than are available fail
//! with [`MemBlockError::ResizeDisabled`] and leave the set untouched.
//!
//! ## Splitting
//!
//! Flag updates and removals first *isolate* the target range so that it is
//! covered by whole regions only:
//!
//! ```text
//!   before:   [========A========][====B====]
//!   isolate:        |<------ range ------>|
//!   after:    [ A1 ][    A2     ][ B1 ][B2 ]
//!                    ^^^^^^^^^^^^^^^^^^
//!                    start_rgn..end_rgn
//! ```

use crate::MemBlockError;
use crate::region::{NodeId, Region, RegionFlags, cap_size};
use core::fmt;
use kernel_info::memory::{INIT_MEMBLOCK_REGIONS, INIT_PHYSMEM_REGIONS, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, align_down, align_up};

/// The category a [`RegionSet`] tracks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Memory that exists and is usable, subject to its flags.
    Memory,
    /// Memory that is in use and must not be handed out.
    Reserved,
    /// All physical memory as first reported, before any trimming.
    PhysMem,
}

impl RegionKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Reserved => "reserved",
            Self::PhysMem => "physmem",
        }
    }

    const fn initial_capacity(self) -> usize {
        match self {
            Self::Memory | Self::Reserved => INIT_MEMBLOCK_REGIONS,
            Self::PhysMem => INIT_PHYSMEM_REGIONS,
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

enum Storage {
    Static([Region; INIT_MEMBLOCK_REGIONS]),
    Relocated {
        base: PhysicalAddress,
        slots: &'static mut [Region],
    },
}

/// A sorted, merged set of memory regions of one category.
pub struct RegionSet {
    kind: RegionKind,
    storage: Storage,
    len: usize,
    capacity: usize,
    total_size: u64,
}

impl RegionSet {
    #[must_use]
    pub const fn new(kind: RegionKind) -> Self {
        Self {
            kind,
            storage: Storage::Static([Region::EMPTY; INIT_MEMBLOCK_REGIONS]),
            len: 0,
            capacity: kind.initial_capacity(),
            total_size: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> RegionKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots available before the set has to be relocated.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sum of the sizes of all regions.
    #[inline]
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Physical location of the region array, if it has been relocated.
    #[inline]
    #[must_use]
    pub const fn array_base(&self) -> Option<PhysicalAddress> {
        match &self.storage {
            Storage::Static(_) => None,
            Storage::Relocated { base, .. } => Some(*base),
        }
    }

    #[inline]
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.slots()[..self.len]
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Region> {
        self.regions().iter()
    }

    /// Base of the lowest region.
    #[must_use]
    pub fn start(&self) -> Option<PhysicalAddress> {
        self.regions().first().map(|r| r.base)
    }

    /// Exclusive end of the highest region.
    #[must_use]
    pub fn end(&self) -> Option<PhysicalAddress> {
        self.regions().last().map(Region::end)
    }

    fn slots(&self) -> &[Region] {
        match &self.storage {
            Storage::Static(slots) => &slots[..self.capacity],
            Storage::Relocated { slots, .. } => slots,
        }
    }

    fn slots_mut(&mut self) -> &mut [Region] {
        match &mut self.storage {
            Storage::Static(slots) => &mut slots[..self.capacity],
            Storage::Relocated { slots, .. } => slots,
        }
    }

    /// Index of the region containing `addr`.
    #[must_use]
    pub fn search(&self, addr: PhysicalAddress) -> Option<usize> {
        self.regions()
            .binary_search_by(|r| {
                if r.end() <= addr {
                    core::cmp::Ordering::Less
                } else if r.base > addr {
                    core::cmp::Ordering::Greater
                } else {
                    core::cmp::Ordering::Equal
                }
            })
            .ok()
    }

    #[must_use]
    pub fn find_region_containing(&self, addr: PhysicalAddress) -> Option<Region> {
        self.search(addr).map(|idx| self.regions()[idx])
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, addr: PhysicalAddress) -> bool {
        self.search(addr).is_some()
    }

    /// Whether any region intersects `[base, base + size)`.
    #[must_use]
    pub fn overlaps(&self, base: PhysicalAddress, size: u64) -> bool {
        let size = cap_size(base, size);
        size != 0 && self.iter().any(|r| r.overlaps(base, size))
    }

    /// Whether `[base, base + size)` is covered without holes.
    ///
    /// Coverage may span several touching regions whose attributes differ.
    #[must_use]
    pub fn covers(&self, base: PhysicalAddress, size: u64) -> bool {
        let end = base.saturating_add(cap_size(base, size));
        let mut cursor = base;
        if cursor >= end {
            return true;
        }
        for r in self.iter() {
            if r.end() <= cursor {
                continue;
            }
            if r.base > cursor {
                return false;
            }
            cursor = r.end();
            if cursor >= end {
                return true;
            }
        }
        false
    }

    /// Number of new slots inserting `[base, base + size)` would take before
    /// merging.
    #[must_use]
    pub fn insertions_needed(&self, base: PhysicalAddress, size: u64) -> usize {
        let end = base.saturating_add(cap_size(base, size));
        let mut cursor = base;
        let mut needed = 0;
        for r in self.iter() {
            if r.base >= end {
                break;
            }
            if r.end() <= cursor {
                continue;
            }
            if r.base > cursor {
                needed += 1;
            }
            cursor = r.end().min(end);
        }
        if cursor < end {
            needed += 1;
        }
        needed
    }

    /// Number of new slots isolating `[base, base + size)` would take.
    #[must_use]
    pub fn splits_needed(&self, base: PhysicalAddress, size: u64) -> usize {
        let end = base.saturating_add(cap_size(base, size));
        self.iter()
            .filter(|r| r.base < end && r.end() > base)
            .map(|r| usize::from(r.base < base) + usize::from(r.end() > end))
            .sum()
    }

    /// Fail if `[base, base + size)` touches a region assigned to a node
    /// other than `node`.
    ///
    /// # Errors
    /// [`MemBlockError::AttributeConflict`] on a node mismatch.
    pub fn check_node_conflict(
        &self,
        base: PhysicalAddress,
        size: u64,
        node: NodeId,
    ) -> Result<(), MemBlockError> {
        if !node.is_assigned() {
            return Ok(());
        }
        let size = cap_size(base, size);
        let conflict = self
            .iter()
            .any(|r| r.overlaps(base, size) && r.node.is_assigned() && r.node != node);
        if conflict {
            return Err(MemBlockError::AttributeConflict { base, size });
        }
        Ok(())
    }

    fn full(&self) -> MemBlockError {
        MemBlockError::ResizeDisabled {
            set: self.kind.name(),
        }
    }

    /// Add `[base, base + size)`. Parts already covered keep their
    /// attributes; the gaps are filled with regions carrying `flags` and
    /// `node`, then neighbours are merged.
    ///
    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] if the new pieces do not fit.
    pub fn insert_range(
        &mut self,
        base: PhysicalAddress,
        size: u64,
        node: NodeId,
        flags: RegionFlags,
    ) -> Result<(), MemBlockError> {
        let size = cap_size(base, size);
        if size == 0 {
            return Ok(());
        }

        let needed = self.insertions_needed(base, size);
        if needed == 0 {
            return Ok(());
        }
        if self.len + needed > self.capacity {
            return Err(self.full());
        }

        let end = base + size;
        let mut cursor = base;
        let mut idx = 0;
        while idx < self.len {
            let r = self.slots()[idx];
            if r.base >= end {
                break;
            }
            if r.end() <= cursor {
                idx += 1;
                continue;
            }
            if r.base > cursor {
                self.insert_at(idx, Region::new(cursor, r.base - cursor, flags, node));
                idx += 1;
            }
            cursor = r.end().min(end);
            idx += 1;
        }
        if cursor < end {
            self.insert_at(idx, Region::new(cursor, end - cursor, flags, node));
        }

        self.merge();
        Ok(())
    }

    /// Split regions so that `[base, base + size)` is covered by whole
    /// regions only. Returns the index range of those regions.
    ///
    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] if the splits do not fit.
    pub fn isolate(
        &mut self,
        base: PhysicalAddress,
        size: u64,
    ) -> Result<(usize, usize), MemBlockError> {
        let size = cap_size(base, size);
        if size == 0 {
            return Ok((0, 0));
        }
        if self.len + self.splits_needed(base, size) > self.capacity {
            return Err(self.full());
        }

        let end = base + size;
        let (mut start_rgn, mut end_rgn) = (0, 0);
        let mut found = false;
        let mut idx = 0;
        while idx < self.len {
            let r = self.slots()[idx];
            if r.base >= end {
                break;
            }
            if r.end() <= base {
                idx += 1;
                continue;
            }

            if r.base < base {
                // The upper half moves to idx + 1 and is looked at next.
                let lower = base - r.base;
                self.shrink_front(idx, lower);
                self.insert_at(idx, Region { size: lower, ..r });
                idx += 1;
            } else if r.end() > end {
                // The lower half takes idx and is looked at again.
                let lower = end - r.base;
                self.shrink_front(idx, lower);
                self.insert_at(idx, Region { size: lower, ..r });
            } else {
                if !found {
                    start_rgn = idx;
                    found = true;
                }
                end_rgn = idx + 1;
                idx += 1;
            }
        }

        Ok((start_rgn, end_rgn))
    }

    /// Remove `[base, base + size)`, splitting or shrinking regions that are
    /// only partially covered. Parts of the range outside the set are ignored.
    ///
    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] if a split does not fit.
    pub fn remove_range(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemBlockError> {
        let (start, end) = self.isolate(base, size)?;
        for idx in (start..end).rev() {
            self.remove_at(idx);
        }
        Ok(())
    }

    /// Apply `update` to every region inside `[base, base + size)` and
    /// re-merge.
    ///
    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] if a split does not fit.
    pub fn update_range(
        &mut self,
        base: PhysicalAddress,
        size: u64,
        mut update: impl FnMut(&mut Region),
    ) -> Result<(), MemBlockError> {
        let (start, end) = self.isolate(base, size)?;
        for r in &mut self.slots_mut()[start..end] {
            update(r);
        }
        self.merge();
        Ok(())
    }

    /// Drop every mapped region outside the index range `start..end`.
    /// `NOMAP` regions stay.
    pub(crate) fn remove_mapped_outside(&mut self, start: usize, end: usize) {
        for idx in (end..self.len).rev() {
            if !self.slots()[idx].is_nomap() {
                self.remove_at(idx);
            }
        }
        for idx in (0..start).rev() {
            if !self.slots()[idx].is_nomap() {
                self.remove_at(idx);
            }
        }
    }

    /// Shrink every region to `align` boundaries; regions that vanish are
    /// removed.
    pub fn trim(&mut self, align: u64) {
        let mut idx = 0;
        while idx < self.len {
            let r = self.slots()[idx];
            let start = align_up(r.base.as_u64(), align);
            let end = align_down(r.end().as_u64(), align);
            if start == r.base.as_u64() && end == r.end().as_u64() {
                idx += 1;
                continue;
            }

            if start < end {
                self.total_size -= r.size - (end - start);
                let slot = &mut self.slots_mut()[idx];
                slot.base = PhysicalAddress::new(start);
                slot.size = end - start;
                idx += 1;
            } else {
                self.remove_at(idx);
            }
        }
    }

    /// Move the set into `slots`, which must have room for every region.
    /// Returns the physical range of the previous array if it was not the
    /// inline one.
    pub(crate) fn relocate(
        &mut self,
        base: PhysicalAddress,
        slots: &'static mut [Region],
    ) -> Option<(PhysicalAddress, u64)> {
        debug_assert!(slots.len() >= self.len);
        let len = self.len;
        slots[..len].copy_from_slice(self.regions());
        slots[len..].fill(Region::EMPTY);

        let old_capacity = self.capacity;
        self.capacity = slots.len();
        match core::mem::replace(&mut self.storage, Storage::Relocated { base, slots }) {
            Storage::Static(_) => None,
            Storage::Relocated { base, .. } => Some((base, array_bytes(old_capacity))),
        }
    }

    fn insert_at(&mut self, idx: usize, region: Region) {
        debug_assert!(self.len < self.capacity);
        let len = self.len;
        let slots = self.slots_mut();
        slots.copy_within(idx..len, idx + 1);
        slots[idx] = region;
        self.len += 1;
        self.total_size += region.size;
    }

    fn remove_at(&mut self, idx: usize) {
        let len = self.len;
        let removed = self.slots()[idx];
        let slots = self.slots_mut();
        slots.copy_within(idx + 1..len, idx);
        slots[len - 1] = Region::EMPTY;
        self.len -= 1;
        self.total_size -= removed.size;
    }

    fn shrink_front(&mut self, idx: usize, by: u64) {
        let slot = &mut self.slots_mut()[idx];
        slot.base += by;
        slot.size -= by;
        self.total_size -= by;
    }

    fn merge(&mut self) {
        let mut len = self.len;
        let slots = self.slots_mut();
        let mut i = 0;
        while i + 1 < len {
            let (this, next) = (slots[i], slots[i + 1]);
            debug_assert!(this.end() <= next.base);
            if this.end() != next.base || !this.same_attributes(&next) {
                i += 1;
                continue;
            }
            slots[i].size += next.size;
            slots.copy_within(i + 2..len, i + 1);
            slots[len - 1] = Region::EMPTY;
            len -= 1;
        }
        self.len = len;
    }
}

impl fmt::Debug for RegionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionSet")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("total_size", &self.total_size)
            .field("regions", &self.regions())
            .finish()
    }
}

/// Bytes allocated for a region array of `capacity` slots.
#[must_use]
pub(crate) const fn array_bytes(capacity: usize) -> u64 {
    align_up((capacity * size_of::<Region>()) as u64, PAGE_SIZE)
}
