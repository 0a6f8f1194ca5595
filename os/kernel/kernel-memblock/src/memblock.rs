use crate::MemBlockError;
use crate::ranges::{Direction, MemRange, MemRanges, RangeFilter};
use crate::region::{NodeId, RegionFlags, cap_size};
use crate::region_set::{RegionKind, RegionSet, array_bytes};
use crate::resize::RegionArrayMapper;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::PhysicalAddress;
use log::{debug, error, info, warn};

#[derive(Copy, Clone)]
enum Resize {
    Disabled,
    Enabled(&'static dyn RegionArrayMapper),
}

/// A free interval handed to the page allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FreeRange {
    pub base: PhysicalAddress,
    pub size: u64,
}

impl From<MemRange> for FreeRange {
    fn from(r: MemRange) -> Self {
        Self {
            base: r.start,
            size: r.size(),
        }
    }
}

/// Early boot physical memory bookkeeping.
///
/// Tracks which memory exists (`memory`), which of it is in use
/// (`reserved`) and what firmware reported before any trimming (`physmem`),
/// and serves allocations out of the difference. One instance is created by
/// the boot code and passed around by reference until
/// [`hand_off`](Self::hand_off), after which every mutation fails with
/// [`MemBlockError::Finalized`].
pub struct MemBlock {
    memory: RegionSet,
    reserved: RegionSet,
    physmem: RegionSet,
    pub(crate) bottom_up: bool,
    pub(crate) current_limit: PhysicalAddress,
    pub(crate) mirrored_kernelmem: bool,
    movable_node: bool,
    resize: Resize,
    finalized: bool,
    debug: bool,
}

impl Default for MemBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBlock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            memory: RegionSet::new(RegionKind::Memory),
            reserved: RegionSet::new(RegionKind::Reserved),
            physmem: RegionSet::new(RegionKind::PhysMem),
            bottom_up: false,
            current_limit: PhysicalAddress::MAX,
            mirrored_kernelmem: false,
            movable_node: false,
            resize: Resize::Disabled,
            finalized: false,
            debug: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn memory(&self) -> &RegionSet {
        &self.memory
    }

    #[inline]
    #[must_use]
    pub const fn reserved(&self) -> &RegionSet {
        &self.reserved
    }

    #[inline]
    #[must_use]
    pub const fn physmem(&self) -> &RegionSet {
        &self.physmem
    }

    #[must_use]
    pub const fn set(&self, kind: RegionKind) -> &RegionSet {
        match kind {
            RegionKind::Memory => &self.memory,
            RegionKind::Reserved => &self.reserved,
            RegionKind::PhysMem => &self.physmem,
        }
    }

    const fn set_mut(&mut self, kind: RegionKind) -> &mut RegionSet {
        match kind {
            RegionKind::Memory => &mut self.memory,
            RegionKind::Reserved => &mut self.reserved,
            RegionKind::PhysMem => &mut self.physmem,
        }
    }

    #[inline]
    #[must_use]
    pub const fn bottom_up(&self) -> bool {
        self.bottom_up
    }

    pub const fn set_bottom_up(&mut self, enable: bool) {
        self.bottom_up = enable;
    }

    #[inline]
    #[must_use]
    pub const fn current_limit(&self) -> PhysicalAddress {
        self.current_limit
    }

    /// Highest address allocations may reach.
    pub const fn set_current_limit(&mut self, limit: PhysicalAddress) {
        self.current_limit = limit;
    }

    #[inline]
    #[must_use]
    pub const fn mirrored_kernelmem(&self) -> bool {
        self.mirrored_kernelmem
    }

    /// Prefer mirrored memory for allocations.
    pub const fn set_mirrored_kernelmem(&mut self, enable: bool) {
        self.mirrored_kernelmem = enable;
    }

    #[inline]
    #[must_use]
    pub const fn movable_node(&self) -> bool {
        self.movable_node
    }

    /// Keep hot-pluggable memory out of allocations and the hand-off.
    pub const fn set_movable_node(&mut self, enable: bool) {
        self.movable_node = enable;
    }

    pub const fn set_debug(&mut self, enable: bool) {
        self.debug = enable;
    }

    #[inline]
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.finalized
    }

    #[inline]
    #[must_use]
    pub const fn can_resize(&self) -> bool {
        matches!(self.resize, Resize::Enabled(_))
    }

    /// Allow full region arrays to be relocated into memory allocated from
    /// the sets themselves. Call once `mapper` can reach that memory.
    pub fn allow_resize(&mut self, mapper: &'static dyn RegionArrayMapper) {
        self.resize = Resize::Enabled(mapper);
    }

    pub(crate) const fn ensure_live(&self) -> Result<(), MemBlockError> {
        if self.finalized {
            Err(MemBlockError::Finalized)
        } else {
            Ok(())
        }
    }

    fn trace(&self, op: &str, base: PhysicalAddress, size: u64) {
        if self.debug {
            info!(
                "memblock: {op}: [{:#x}-{:#x}]",
                base.as_u64(),
                base.saturating_add(size).as_u64().saturating_sub(1)
            );
        }
    }

    /// Filter for free memory walks honouring `movable_node`.
    #[must_use]
    pub const fn filter(&self, node: Option<NodeId>, flags: RegionFlags) -> RangeFilter {
        RangeFilter {
            node,
            flags,
            skip_hotplug: self.movable_node,
        }
    }

    /// Memory regions passing the filter, ascending.
    #[must_use]
    pub fn mem_ranges(&self, node: Option<NodeId>, flags: RegionFlags) -> MemRanges<'_> {
        MemRanges::new(
            &self.memory,
            None,
            self.filter(node, flags),
            Direction::Forward,
        )
    }

    /// Free memory (memory minus reserved), ascending.
    #[must_use]
    pub fn free_ranges(&self, node: Option<NodeId>, flags: RegionFlags) -> MemRanges<'_> {
        MemRanges::new(
            &self.memory,
            Some(&self.reserved),
            self.filter(node, flags),
            Direction::Forward,
        )
    }

    /// Free memory (memory minus reserved), descending.
    #[must_use]
    pub fn free_ranges_rev(&self, node: Option<NodeId>, flags: RegionFlags) -> MemRanges<'_> {
        MemRanges::new(
            &self.memory,
            Some(&self.reserved),
            self.filter(node, flags),
            Direction::Reverse,
        )
    }

    #[must_use]
    pub fn reserved_ranges(&self) -> MemRanges<'_> {
        MemRanges::new(
            &self.reserved,
            None,
            RangeFilter::default(),
            Direction::Forward,
        )
    }

    /// Register `[base, base + size)` as memory without a node.
    ///
    /// # Errors
    /// See [`add_node`](Self::add_node).
    pub fn add(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemBlockError> {
        self.add_node(base, size, NodeId::UNASSIGNED)
    }

    /// Register `[base, base + size)` as memory on `node`.
    ///
    /// Already registered parts keep their attributes.
    ///
    /// # Errors
    /// - [`MemBlockError::AttributeConflict`] if the range overlaps memory on
    ///   another node; nothing is added.
    /// - [`MemBlockError::ResizeDisabled`] if the memory array is full.
    /// - [`MemBlockError::Finalized`] after hand-off.
    pub fn add_node(
        &mut self,
        base: PhysicalAddress,
        size: u64,
        node: NodeId,
    ) -> Result<(), MemBlockError> {
        self.ensure_live()?;
        self.trace("add", base, size);
        self.memory.check_node_conflict(base, size, node)?;
        self.add_range(RegionKind::Memory, base, size, node, RegionFlags::NONE)
    }

    /// Drop `[base, base + size)` from memory.
    ///
    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] if a split does not fit, or
    /// [`MemBlockError::Finalized`].
    pub fn remove(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemBlockError> {
        self.ensure_live()?;
        self.trace("remove", base, size);
        self.remove_range(RegionKind::Memory, base, size)
    }

    /// Mark `[base, base + size)` as in use.
    ///
    /// Empty requests succeed without effect.
    ///
    /// # Errors
    /// - [`MemBlockError::AlreadyReserved`] if any part is already reserved.
    /// - [`MemBlockError::NotMemory`] if any part is not memory.
    /// - [`MemBlockError::ResizeDisabled`] if the reserved array is full.
    /// - [`MemBlockError::Finalized`] after hand-off.
    ///
    /// Nothing is reserved on failure.
    pub fn reserve(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemBlockError> {
        self.ensure_live()?;
        let size = cap_size(base, size);
        if size == 0 {
            return Ok(());
        }
        if self.reserved.overlaps(base, size) {
            return Err(MemBlockError::AlreadyReserved { base, size });
        }
        if !self.memory.covers(base, size) {
            return Err(MemBlockError::NotMemory { base, size });
        }
        self.reserve_range(base, size)
    }

    /// Release a reservation. Parts that were not reserved are ignored.
    ///
    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] if a split does not fit, or
    /// [`MemBlockError::Finalized`].
    pub fn free(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemBlockError> {
        self.ensure_live()?;
        self.trace("free", base, size);
        self.remove_range(RegionKind::Reserved, base, size)
    }

    /// Record `[base, base + size)` in the all-physical-memory set.
    ///
    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] or [`MemBlockError::Finalized`].
    pub fn physmem_add(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemBlockError> {
        self.ensure_live()?;
        self.trace("physmem_add", base, size);
        self.add_range(
            RegionKind::PhysMem,
            base,
            size,
            NodeId::UNASSIGNED,
            RegionFlags::NONE,
        )
    }

    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] or [`MemBlockError::Finalized`].
    pub fn mark_hotplug(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemBlockError> {
        self.set_flag(base, size, RegionFlags::HOTPLUG, true)
    }

    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] or [`MemBlockError::Finalized`].
    pub fn clear_hotplug(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemBlockError> {
        self.set_flag(base, size, RegionFlags::HOTPLUG, false)
    }

    /// Mark memory as mirrored.
    ///
    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] or [`MemBlockError::Finalized`].
    pub fn mark_mirror(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemBlockError> {
        self.set_flag(base, size, RegionFlags::MIRROR, true)
    }

    /// Keep memory out of the linear map. It stays in `memory` but is
    /// skipped by allocations and by the hand-off.
    ///
    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] or [`MemBlockError::Finalized`].
    pub fn mark_nomap(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemBlockError> {
        self.set_flag(base, size, RegionFlags::NOMAP, true)
    }

    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] or [`MemBlockError::Finalized`].
    pub fn clear_nomap(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemBlockError> {
        self.set_flag(base, size, RegionFlags::NOMAP, false)
    }

    /// Assign `[base, base + size)` of memory to `node`.
    ///
    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] or [`MemBlockError::Finalized`].
    pub fn set_node(
        &mut self,
        base: PhysicalAddress,
        size: u64,
        node: NodeId,
    ) -> Result<(), MemBlockError> {
        self.ensure_live()?;
        self.ensure_capacity_for_split(RegionKind::Memory, base, size)?;
        self.memory.update_range(base, size, |r| r.node = node)
    }

    fn set_flag(
        &mut self,
        base: PhysicalAddress,
        size: u64,
        flag: RegionFlags,
        set: bool,
    ) -> Result<(), MemBlockError> {
        self.ensure_live()?;
        self.ensure_capacity_for_split(RegionKind::Memory, base, size)?;
        self.memory.update_range(base, size, |r| {
            r.flags = if set {
                r.flags.union(flag)
            } else {
                r.flags.difference(flag)
            };
        })
    }

    #[must_use]
    pub fn is_memory(&self, addr: PhysicalAddress) -> bool {
        self.memory.contains(addr)
    }

    /// Whether `addr` is memory that belongs in the linear map.
    #[must_use]
    pub fn is_map_memory(&self, addr: PhysicalAddress) -> bool {
        self.memory
            .find_region_containing(addr)
            .is_some_and(|r| !r.is_nomap())
    }

    /// Whether all of `[base, base + size)` is memory.
    #[must_use]
    pub fn is_region_memory(&self, base: PhysicalAddress, size: u64) -> bool {
        self.memory.covers(base, size)
    }

    #[must_use]
    pub fn is_reserved(&self, addr: PhysicalAddress) -> bool {
        self.reserved.contains(addr)
    }

    /// Whether any part of `[base, base + size)` is reserved.
    #[must_use]
    pub fn is_region_reserved(&self, base: PhysicalAddress, size: u64) -> bool {
        self.reserved.overlaps(base, size)
    }

    /// Whether any part of `[base, base + size)` is memory.
    #[must_use]
    pub fn overlaps(&self, base: PhysicalAddress, size: u64) -> bool {
        self.memory.overlaps(base, size)
    }

    #[inline]
    #[must_use]
    pub const fn phys_mem_size(&self) -> u64 {
        self.memory.total_size()
    }

    #[inline]
    #[must_use]
    pub const fn reserved_size(&self) -> u64 {
        self.reserved.total_size()
    }

    /// Lowest memory address, or zero without memory.
    #[must_use]
    pub fn start_of_dram(&self) -> PhysicalAddress {
        self.memory.start().unwrap_or_default()
    }

    /// End of the highest memory region, or zero without memory.
    #[must_use]
    pub fn end_of_dram(&self) -> PhysicalAddress {
        self.memory.end().unwrap_or_default()
    }

    /// Shrink all memory regions to `align` boundaries.
    ///
    /// # Errors
    /// [`MemBlockError::Finalized`] after hand-off.
    pub fn trim_memory(&mut self, align: u64) -> Result<(), MemBlockError> {
        self.ensure_live()?;
        if !align.is_power_of_two() {
            return Err(MemBlockError::InvalidAlignment(align));
        }
        self.memory.trim(align);
        Ok(())
    }

    /// Address at which the first `limit` bytes of memory end, or
    /// [`PhysicalAddress::MAX`] if there is no more memory than that.
    #[must_use]
    pub fn find_max_addr(&self, limit: u64) -> PhysicalAddress {
        let mut remaining = limit;
        for r in self.memory.iter() {
            if remaining <= r.size {
                return r.base + remaining;
            }
            remaining -= r.size;
        }
        PhysicalAddress::MAX
    }

    /// Keep only the first `limit` bytes of memory; reservations above are
    /// dropped too. A zero limit does nothing.
    ///
    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] or [`MemBlockError::Finalized`].
    pub fn enforce_memory_limit(&mut self, limit: u64) -> Result<(), MemBlockError> {
        self.ensure_live()?;
        if limit == 0 {
            return Ok(());
        }
        let max_addr = self.find_max_addr(limit);
        if max_addr == PhysicalAddress::MAX {
            return Ok(());
        }
        self.remove_range(RegionKind::Memory, max_addr, u64::MAX)?;
        self.remove_range(RegionKind::Reserved, max_addr, u64::MAX)
    }

    /// Restrict mapped memory to `[base, base + size)`.
    ///
    /// `NOMAP` regions outside the window survive so that firmware tables
    /// stay reachable; reservations outside are dropped.
    ///
    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] or [`MemBlockError::Finalized`].
    pub fn cap_memory_range(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemBlockError> {
        self.ensure_live()?;
        let size = cap_size(base, size);
        if size == 0 {
            return Ok(());
        }
        if self.memory.total_size() == 0 {
            warn!("memblock: no memory registered yet, nothing to cap");
            return Ok(());
        }

        self.ensure_capacity_for_split(RegionKind::Memory, base, size)?;
        let (start_rgn, end_rgn) = self.memory.isolate(base, size)?;
        self.memory.remove_mapped_outside(start_rgn, end_rgn);

        self.remove_range(RegionKind::Reserved, PhysicalAddress::zero(), base.as_u64())?;
        self.remove_range(RegionKind::Reserved, base + size, u64::MAX)
    }

    /// Like [`enforce_memory_limit`](Self::enforce_memory_limit) but keeps
    /// `NOMAP` memory above the limit.
    ///
    /// # Errors
    /// [`MemBlockError::ResizeDisabled`] or [`MemBlockError::Finalized`].
    pub fn mem_limit_remove_map(&mut self, limit: u64) -> Result<(), MemBlockError> {
        self.ensure_live()?;
        if limit == 0 {
            return Ok(());
        }
        let max_addr = self.find_max_addr(limit);
        if max_addr == PhysicalAddress::MAX {
            return Ok(());
        }
        self.cap_memory_range(PhysicalAddress::zero(), max_addr.as_u64())
    }

    /// Log every region of every set when debugging is enabled.
    pub fn dump_all(&self) {
        if !self.debug {
            return;
        }
        info!("MEMBLOCK configuration:");
        info!(
            " memory size = {:#x} reserved size = {:#x}",
            self.memory.total_size(),
            self.reserved.total_size()
        );
        for set in [&self.memory, &self.reserved, &self.physmem] {
            Self::dump(set);
        }
    }

    fn dump(set: &RegionSet) {
        info!(" {}.cnt  = {:#x}", set.kind(), set.len());
        for (idx, region) in set.iter().enumerate() {
            info!(" {}[{:#x}]\t{}", set.kind(), idx, region);
        }
    }

    /// Finalize the bookkeeping and yield each free interval once.
    ///
    /// Memory kept out of the linear map and, with `movable_node`,
    /// hot-pluggable memory are not handed off. Afterwards every mutating
    /// call fails with [`MemBlockError::Finalized`] and later hand-offs
    /// yield nothing.
    pub fn hand_off(&mut self) -> impl Iterator<Item = FreeRange> + '_ {
        let limit = if self.finalized {
            warn!("memblock: free memory already handed off");
            0
        } else {
            self.dump_all();
            self.finalized = true;
            info!(
                "memblock: handing off {:#x} bytes of memory, {:#x} reserved",
                self.memory.total_size(),
                self.reserved.total_size()
            );
            usize::MAX
        };
        self.free_ranges(None, RegionFlags::NONE)
            .map(FreeRange::from)
            .take(limit)
    }

    /// Reserve without the overlap and coverage checks of
    /// [`reserve`](Self::reserve).
    pub(crate) fn reserve_range(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemBlockError> {
        self.trace("reserve", base, size);
        self.add_range(
            RegionKind::Reserved,
            base,
            size,
            NodeId::UNASSIGNED,
            RegionFlags::NONE,
        )
    }

    fn add_range(
        &mut self,
        kind: RegionKind,
        base: PhysicalAddress,
        size: u64,
        node: NodeId,
        flags: RegionFlags,
    ) -> Result<(), MemBlockError> {
        let size = cap_size(base, size);
        let needed = self.set(kind).insertions_needed(base, size);
        self.ensure_capacity(kind, needed, base, size)?;
        self.set_mut(kind).insert_range(base, size, node, flags)
    }

    fn remove_range(
        &mut self,
        kind: RegionKind,
        base: PhysicalAddress,
        size: u64,
    ) -> Result<(), MemBlockError> {
        self.ensure_capacity_for_split(kind, base, size)?;
        self.set_mut(kind).remove_range(base, size)
    }

    fn ensure_capacity_for_split(
        &mut self,
        kind: RegionKind,
        base: PhysicalAddress,
        size: u64,
    ) -> Result<(), MemBlockError> {
        let needed = self.set(kind).splits_needed(base, size);
        self.ensure_capacity(kind, needed, base, size)
    }

    /// Grow `kind` until `extra` more regions fit. `[area_base, area_base +
    /// area_size)` is the range being inserted; a new reserved array must
    /// not land on it.
    fn ensure_capacity(
        &mut self,
        kind: RegionKind,
        extra: usize,
        area_base: PhysicalAddress,
        area_size: u64,
    ) -> Result<(), MemBlockError> {
        while self.set(kind).len() + extra > self.set(kind).capacity() {
            self.double_array(kind, area_base, area_size)?;
        }
        Ok(())
    }

    fn double_array(
        &mut self,
        kind: RegionKind,
        area_base: PhysicalAddress,
        area_size: u64,
    ) -> Result<(), MemBlockError> {
        let Resize::Enabled(mapper) = self.resize else {
            error!("memblock: {kind} is full and can't be resized");
            return Err(MemBlockError::ResizeDisabled { set: kind.name() });
        };

        let old_capacity = self.set(kind).capacity();
        let new_capacity = old_capacity * 2;
        let new_size = array_bytes(new_capacity);

        let (area_base, area_size) = if kind == RegionKind::Reserved {
            (area_base, area_size)
        } else {
            (PhysicalAddress::zero(), 0)
        };

        let limit = self.current_limit;
        let mut addr = self.find_in_range(area_base.saturating_add(area_size), limit, new_size, PAGE_SIZE);
        if addr.is_none() && area_size != 0 {
            addr = self.find_in_range(PhysicalAddress::zero(), area_base.min(limit), new_size, PAGE_SIZE);
        }
        let Some(addr) = addr else {
            error!("memblock: failed to double {kind} array from {old_capacity} to {new_capacity} entries");
            return Err(MemBlockError::OutOfMemory);
        };

        // SAFETY: `addr` is free memory found above and not yet handed to
        // anyone; it is reserved right after relocation.
        let slots = unsafe { mapper.map_region_array(addr, new_capacity) };
        let previous = self.set_mut(kind).relocate(addr, slots);
        debug!(
            "memblock: {kind} is doubled to {new_capacity} at [{:#x}-{:#x}]",
            addr.as_u64(),
            addr.as_u64() + new_size - 1
        );

        if let Some((old_base, old_size)) = previous {
            self.remove_range(RegionKind::Reserved, old_base, old_size)?;
        }
        self.reserve_range(addr, new_size)
    }
}

impl core::fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemBlock")
            .field("bottom_up", &self.bottom_up)
            .field("current_limit", &self.current_limit)
            .field("finalized", &self.finalized)
            .field("memory", &self.memory)
            .field("reserved", &self.reserved)
            .field("physmem", &self.physmem)
            .finish_non_exhaustive()
    }
}

/// Regions of `set` as `(base, size)` pairs, for assertions.
#[cfg(test)]
pub(crate) fn spans(set: &RegionSet) -> Vec<(u64, u64)> {
    set.iter().map(|r| (r.base.as_u64(), r.size)).collect()
}
