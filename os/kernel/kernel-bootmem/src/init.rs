//! # Early Memory Initialization
//!
//! [`MemoryInit`] turns the firmware's view of memory into the set of
//! ranges the kernel will actually use, in a fixed sequence of phases:
//!
//! | # | Phase | Effect |
//! |---|-------|--------|
//! | 0 | [`Populate`](Phase::Populate) | firmware memory map into `memory` and `physmem` |
//! | 1 | [`ClampUsable`](Phase::ClampUsable) | drop memory outside the usable-range override |
//! | 2 | [`DropUnaddressable`](Phase::DropUnaddressable) | drop memory above the physical address width |
//! | 3 | [`ChooseBase`](Phase::ChooseBase) | pick `memstart_addr` |
//! | 4 | [`ClipLinear`](Phase::ClipLinear) | drop memory the linear map cannot reach |
//! | 5 | [`MemoryLimit`](Phase::MemoryLimit) | apply `mem=` |
//! | 6 | [`Ramdisk`](Phase::Ramdisk) | keep and reserve the initrd, if reachable |
//! | 7 | [`Randomize`](Phase::Randomize) | shift the linear map by the KASLR seed |
//! | 8 | [`ReserveKernel`](Phase::ReserveKernel) | reserve kernel, page tables, firmware carve-outs |
//! | 9 | [`ZoneLimits`](Phase::ZoneLimits) | DMA and DMA32 limits |
//! | 10 | [`CrashKernel`](Phase::CrashKernel) | `crashkernel=` |
//! | 11 | [`ElfCoreHdr`](Phase::ElfCoreHdr) | a crashed kernel's core-dump header |
//! | 12 | [`Finish`](Phase::Finish) | report the [`BootMemoryLayout`] |
//! | 13 | [`HandOff`](Phase::HandOff) | free memory to the page allocator |
//!
//! Each phase has its own method so boot code can interleave other work;
//! [`MemoryInit::run`] executes whatever is left up to the layout report.
//! Calling a phase out of turn fails with [`BootMemoryError::PhaseOrder`]
//! and changes nothing.

use crate::crash::{reserve_crashkernel, reserve_elfcorehdr};
use crate::{BootMemoryError, BootMemoryLayout, CrashKernelRegion, LayoutConfig, LinearMap, ZoneLimits};
use kernel_info::boot::{BootMemoryInfo, MemoryKind, PhysRange};
use kernel_info::cmdline::BootConfig;
use kernel_info::memory::PAGE_SIZE;
use kernel_memblock::{FreeRange, MemBlock, MemBlockError, NodeId};
use kernel_memory_addresses::{PhysicalAddress, Size4K, align_down, align_up};
use log::{debug, info, warn};

/// Steps of early memory initialization, in execution order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Populate,
    ClampUsable,
    DropUnaddressable,
    ChooseBase,
    ClipLinear,
    MemoryLimit,
    Ramdisk,
    Randomize,
    ReserveKernel,
    ZoneLimits,
    CrashKernel,
    ElfCoreHdr,
    Finish,
    HandOff,
}

impl Phase {
    const fn successor(self) -> Self {
        match self {
            Self::Populate => Self::ClampUsable,
            Self::ClampUsable => Self::DropUnaddressable,
            Self::DropUnaddressable => Self::ChooseBase,
            Self::ChooseBase => Self::ClipLinear,
            Self::ClipLinear => Self::MemoryLimit,
            Self::MemoryLimit => Self::Ramdisk,
            Self::Ramdisk => Self::Randomize,
            Self::Randomize => Self::ReserveKernel,
            Self::ReserveKernel => Self::ZoneLimits,
            Self::ZoneLimits => Self::CrashKernel,
            Self::CrashKernel => Self::ElfCoreHdr,
            Self::ElfCoreHdr => Self::Finish,
            Self::Finish | Self::HandOff => Self::HandOff,
        }
    }
}

/// Reserve a range whose loss does not stop the boot.
///
/// Returns whether the range was reserved; only fatal bookkeeping errors
/// are propagated.
pub(crate) fn reserve_optional(
    memblock: &mut MemBlock,
    base: PhysicalAddress,
    size: u64,
    what: &str,
) -> Result<bool, BootMemoryError> {
    match memblock.reserve(base, size) {
        Ok(()) => Ok(true),
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            warn!("{what}: not reserved: {e}");
            Ok(false)
        }
    }
}

/// Drives early memory initialization over a borrowed [`MemBlock`].
pub struct MemoryInit<'m, 'a> {
    memblock: &'m mut MemBlock,
    info: BootMemoryInfo<'a>,
    config: BootConfig<'a>,
    layout: LayoutConfig,
    next: Phase,
    /// Two's complement; randomization may take it below zero.
    memstart_addr: u64,
    ramdisk: Option<PhysRange>,
    zones: ZoneLimits,
    crashkernel: Option<CrashKernelRegion>,
    elfcorehdr: Option<PhysRange>,
}

impl<'m, 'a> MemoryInit<'m, 'a> {
    /// Prepare initialization. The command line options that steer the
    /// allocator (`movable_node`, `kernelcore=mirror`, `memblock=debug`)
    /// take effect immediately.
    #[must_use]
    pub fn new(memblock: &'m mut MemBlock, info: BootMemoryInfo<'a>, config: BootConfig<'a>) -> Self {
        memblock.set_movable_node(config.movable_node);
        memblock.set_mirrored_kernelmem(config.mirrored_kernelmem);
        memblock.set_debug(config.memblock_debug);
        Self {
            memblock,
            info,
            config,
            layout: LayoutConfig::default(),
            next: Phase::Populate,
            memstart_addr: 0,
            ramdisk: None,
            zones: ZoneLimits::default(),
            crashkernel: None,
            elfcorehdr: None,
        }
    }

    #[must_use]
    pub const fn with_layout(mut self, layout: LayoutConfig) -> Self {
        self.layout = layout;
        self
    }

    #[inline]
    #[must_use]
    pub const fn next_phase(&self) -> Phase {
        self.next
    }

    #[inline]
    #[must_use]
    pub const fn memblock(&self) -> &MemBlock {
        &*self.memblock
    }

    #[inline]
    #[must_use]
    pub const fn memstart_addr(&self) -> i64 {
        self.memstart_addr.cast_signed()
    }

    /// The linear mapping as currently decided. Changes until
    /// [`Phase::Randomize`] has run.
    #[inline]
    #[must_use]
    pub const fn linear_map(&self) -> LinearMap {
        LinearMap::new(self.memstart_addr(), self.layout.page_offset)
    }

    fn enter(&self, phase: Phase) -> Result<(), BootMemoryError> {
        if self.next == phase {
            Ok(())
        } else {
            Err(BootMemoryError::PhaseOrder {
                expected: self.next,
                found: phase,
            })
        }
    }

    const fn advance(&mut self) {
        self.next = self.next.successor();
    }

    /// Register the firmware memory map with `memory` and `physmem`.
    ///
    /// # Errors
    /// [`BootMemoryError::NoMemory`] if nothing usable was described.
    pub fn populate(&mut self) -> Result<(), BootMemoryError> {
        self.enter(Phase::Populate)?;

        for desc in self.info.memory {
            let PhysRange { base, size } = desc.range;
            if size == 0 {
                continue;
            }
            let node = desc.node.map_or(NodeId::UNASSIGNED, NodeId::new);
            match self.memblock.add_node(base, size, node) {
                Ok(()) => {}
                Err(e @ MemBlockError::AttributeConflict { .. }) => {
                    warn!("ignoring memory map entry: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            // physmem has fixed slots and is only ever reported, never
            // allocated from, so a full table loses history but not memory.
            if let Err(e) = self.memblock.physmem_add(base, size) {
                warn!("physmem: {e}");
            }
            match desc.kind {
                MemoryKind::Usable => Ok(()),
                MemoryKind::NoMap => self.memblock.mark_nomap(base, size),
                MemoryKind::Hotplug => self.memblock.mark_hotplug(base, size),
                MemoryKind::Mirror => self.memblock.mark_mirror(base, size),
            }?;
        }

        if self.memblock.memory().is_empty() {
            return Err(BootMemoryError::NoMemory);
        }
        debug!(
            "{} memory regions, {:#x} bytes",
            self.memblock.memory().len(),
            self.memblock.phys_mem_size()
        );
        self.advance();
        Ok(())
    }

    /// Honor a usable-memory-range override such as a kdump kernel gets.
    ///
    /// # Errors
    /// Fatal bookkeeping failures.
    pub fn clamp_usable(&mut self) -> Result<(), BootMemoryError> {
        self.enter(Phase::ClampUsable)?;
        if let Some(usable) = self.info.usable_range {
            info!(
                "usable memory limited to [{:#x}-{:#x})",
                usable.base.as_u64(),
                usable.end().as_u64()
            );
            self.memblock.cap_memory_range(usable.base, usable.size)?;
        }
        self.advance();
        Ok(())
    }

    /// Drop memory the MMU cannot address.
    ///
    /// # Errors
    /// [`BootMemoryError::NoMemory`] if no memory is left.
    pub fn drop_unaddressable(&mut self) -> Result<(), BootMemoryError> {
        self.enter(Phase::DropUnaddressable)?;
        if let Some(limit) = 1u64.checked_shl(self.layout.phys_mask_shift) {
            self.memblock.remove(PhysicalAddress::new(limit), u64::MAX)?;
        }
        if self.memblock.memory().is_empty() {
            return Err(BootMemoryError::NoMemory);
        }
        self.advance();
        Ok(())
    }

    /// Place the start of the linear mapping at the lowest memory,
    /// rounded down to the mapping alignment.
    ///
    /// # Errors
    /// Only if called out of order.
    pub fn choose_base(&mut self) -> Result<(), BootMemoryError> {
        self.enter(Phase::ChooseBase)?;
        self.memstart_addr = align_down(self.memblock.start_of_dram().as_u64(), self.layout.memstart_align);
        self.advance();
        Ok(())
    }

    /// Drop memory the linear mapping cannot cover.
    ///
    /// The kernel image is never clipped. If memory still extends beyond
    /// the mapping, the mapping slides up and memory below it goes instead.
    ///
    /// # Errors
    /// Fatal bookkeeping failures.
    pub fn clip_linear(&mut self) -> Result<(), BootMemoryError> {
        self.enter(Phase::ClipLinear)?;
        let window = self.layout.linear_region_size;
        let linear_end = self.memstart_addr.saturating_add(window);
        let kernel_end = self.info.kernel_image.end().as_u64();

        self.memblock
            .remove(PhysicalAddress::new(linear_end.max(kernel_end)), u64::MAX)?;

        let end = self.memblock.end_of_dram().as_u64();
        if linear_end < end {
            self.memstart_addr = align_up(end - window, self.layout.memstart_align);
            self.memblock.remove(PhysicalAddress::zero(), self.memstart_addr)?;
            info!(
                "linear mapping moved up to {:#x}, memory below it dropped",
                self.memstart_addr
            );
        }
        self.advance();
        Ok(())
    }

    /// Apply `mem=`, keeping the kernel image reachable.
    ///
    /// # Errors
    /// Fatal bookkeeping failures.
    pub fn apply_memory_limit(&mut self) -> Result<(), BootMemoryError> {
        self.enter(Phase::MemoryLimit)?;
        if let Some(limit) = self.config.memory_limit {
            self.memblock.mem_limit_remove_map(limit)?;
            let kernel = self.info.kernel_image;
            self.memblock.add(kernel.base, kernel.size)?;
        }
        self.advance();
        Ok(())
    }

    /// Keep the initial ramdisk in memory and out of the allocator, or drop
    /// it if the linear mapping cannot reach it.
    ///
    /// # Errors
    /// Fatal bookkeeping failures.
    pub fn place_ramdisk(&mut self) -> Result<(), BootMemoryError> {
        self.enter(Phase::Ramdisk)?;
        if let Some(initrd) = self.info.ramdisk.filter(|r| !r.is_empty()) {
            let base = align_down(initrd.base.as_u64(), PAGE_SIZE);
            let size = align_up(initrd.end().as_u64(), PAGE_SIZE) - base;
            let start = self.memblock.start_of_dram().as_u64();

            if base < start || base.saturating_add(size) > start.saturating_add(self.layout.linear_region_size) {
                warn!("initrd not fully accessible via the linear mapping -- please check your bootloader ...");
            } else {
                let base = PhysicalAddress::new(base);
                self.memblock.remove(base, size)?;
                self.memblock.add(base, size)?;
                if reserve_optional(self.memblock, base, size, "initrd")? {
                    self.ramdisk = Some(initrd);
                }
            }
        }
        self.advance();
        Ok(())
    }

    /// Shift the linear mapping down by a seed-derived multiple of its
    /// alignment, if it has room to spare.
    ///
    /// # Errors
    /// Only if called out of order.
    pub fn randomize(&mut self) -> Result<(), BootMemoryError> {
        self.enter(Phase::Randomize)?;
        let seed = u64::from(self.info.memstart_offset_seed);
        let align = self.layout.memstart_align;
        let span = self.memblock.end_of_dram() - self.memblock.start_of_dram();

        if self.layout.randomize
            && seed > 0
            && let Some(range) = self.layout.linear_region_size.checked_sub(span)
            && range >= align
        {
            let shift = align * ((range / align * seed) >> 16);
            self.memstart_addr = self.memstart_addr.wrapping_sub(shift);
            debug!("linear mapping randomized, memstart_addr = {:#x}", self.memstart_addr());
        }
        self.advance();
        Ok(())
    }

    /// Reserve the kernel image, the early page tables and the firmware's
    /// reserved-memory list.
    ///
    /// # Errors
    /// - [`BootMemoryError::KernelImage`] if the image cannot be reserved.
    /// - [`BootMemoryError::PageTables`] if a page table cannot be reserved.
    /// - Fatal bookkeeping failures while reserving firmware ranges.
    pub fn reserve_kernel(&mut self) -> Result<(), BootMemoryError> {
        self.enter(Phase::ReserveKernel)?;
        let kernel = self.info.kernel_image;
        self.memblock
            .reserve(kernel.base, kernel.size)
            .map_err(BootMemoryError::KernelImage)?;

        for table in self.info.page_tables {
            if self.memblock.reserved().covers(table.base, table.size) {
                continue;
            }
            self.memblock
                .reserve(table.base, table.size)
                .map_err(BootMemoryError::PageTables)?;
        }

        for entry in self.info.reserved {
            let name = entry.name.unwrap_or("reserved-memory");
            let PhysRange { base, size } = entry.range;
            if reserve_optional(self.memblock, base, size, name)? {
                match entry.node {
                    Some(node) => debug!(
                        "{name}: reserved [{:#x}-{:#x}) on node {node}",
                        base.as_u64(),
                        entry.range.end().as_u64()
                    ),
                    None => debug!("{name}: reserved [{:#x}-{:#x})", base.as_u64(), entry.range.end().as_u64()),
                }
            }
        }
        self.advance();
        Ok(())
    }

    /// Compute the DMA zone limits; the crash kernel is placed below DMA32.
    ///
    /// # Errors
    /// Only if called out of order.
    pub fn compute_zone_limits(&mut self) -> Result<(), BootMemoryError> {
        self.enter(Phase::ZoneLimits)?;
        self.zones = ZoneLimits::compute(
            self.memblock.start_of_dram(),
            self.memblock.end_of_dram(),
            &self.layout,
        );
        self.advance();
        Ok(())
    }

    /// Honor `crashkernel=`. A request that cannot be met is logged and
    /// dropped.
    ///
    /// # Errors
    /// Fatal bookkeeping failures.
    pub fn reserve_crashkernel(&mut self) -> Result<(), BootMemoryError> {
        self.enter(Phase::CrashKernel)?;
        self.crashkernel = reserve_crashkernel(
            self.memblock,
            &self.config,
            self.zones.dma32,
            self.layout.crash_align,
        )?;
        self.advance();
        Ok(())
    }

    /// Keep a crashed kernel's ELF core header.
    ///
    /// # Errors
    /// Fatal bookkeeping failures.
    pub fn reserve_elfcorehdr(&mut self) -> Result<(), BootMemoryError> {
        self.enter(Phase::ElfCoreHdr)?;
        self.elfcorehdr = reserve_elfcorehdr(self.memblock, self.info.elfcorehdr)?;
        self.advance();
        Ok(())
    }

    /// Report the resulting layout.
    ///
    /// # Errors
    /// [`BootMemoryError::NoMemory`] if trimming left no memory.
    pub fn finish(&mut self) -> Result<BootMemoryLayout, BootMemoryError> {
        self.enter(Phase::Finish)?;
        if self.memblock.memory().is_empty() {
            return Err(BootMemoryError::NoMemory);
        }

        let start = self.memblock.start_of_dram();
        let end = self.memblock.end_of_dram();
        let linear_map = self.linear_map();
        let layout = BootMemoryLayout {
            memstart_addr: self.memstart_addr(),
            physvirt_offset: linear_map.physvirt_offset(),
            zones: self.zones,
            min_pfn: start.pfn_up::<Size4K>(),
            max_pfn: end.pfn_down::<Size4K>(),
            high_memory: linear_map.phys_to_virt(end - 1).wrapping_add(1),
            ramdisk: self.ramdisk,
            crashkernel: self.crashkernel,
            elfcorehdr: self.elfcorehdr,
        };
        info!(
            "memory: {:#x} bytes in [{:#x}-{:#x}), {:#x} reserved",
            self.memblock.phys_mem_size(),
            start.as_u64(),
            end.as_u64(),
            self.memblock.reserved_size()
        );
        self.advance();
        Ok(layout)
    }

    fn step(&mut self) -> Result<(), BootMemoryError> {
        match self.next {
            Phase::Populate => self.populate(),
            Phase::ClampUsable => self.clamp_usable(),
            Phase::DropUnaddressable => self.drop_unaddressable(),
            Phase::ChooseBase => self.choose_base(),
            Phase::ClipLinear => self.clip_linear(),
            Phase::MemoryLimit => self.apply_memory_limit(),
            Phase::Ramdisk => self.place_ramdisk(),
            Phase::Randomize => self.randomize(),
            Phase::ReserveKernel => self.reserve_kernel(),
            Phase::ZoneLimits => self.compute_zone_limits(),
            Phase::CrashKernel => self.reserve_crashkernel(),
            Phase::ElfCoreHdr => self.reserve_elfcorehdr(),
            Phase::Finish | Phase::HandOff => Ok(()),
        }
    }

    /// Run every remaining phase up to and including [`Phase::Finish`].
    ///
    /// # Errors
    /// The first error of any phase; later phases do not run.
    pub fn run(&mut self) -> Result<BootMemoryLayout, BootMemoryError> {
        while self.next < Phase::Finish {
            self.step()?;
        }
        self.finish()
    }

    /// Finalize the bookkeeping and yield every free range once.
    ///
    /// # Errors
    /// [`BootMemoryError::PhaseOrder`] before [`finish`](Self::finish).
    pub fn hand_off(self) -> Result<impl Iterator<Item = FreeRange> + 'm, BootMemoryError> {
        self.enter(Phase::HandOff)?;
        let memblock = self.memblock;
        Ok(memblock.hand_off())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryRangeDesc;

    #[test]
    fn phases_are_totally_ordered() {
        let mut phase = Phase::Populate;
        let mut steps = 0;
        while phase != Phase::HandOff {
            let next = phase.successor();
            assert!(next > phase);
            phase = next;
            steps += 1;
        }
        assert_eq!(steps, 13);
        assert_eq!(Phase::HandOff.successor(), Phase::HandOff);
    }

    #[test]
    fn out_of_order_phase_is_rejected_without_effect() {
        let memory = [MemoryRangeDesc::usable(0x4000_0000, 0x4000_0000)];
        let info = BootMemoryInfo {
            memory: &memory,
            ..BootMemoryInfo::default()
        };
        let mut mb = MemBlock::new();
        let mut init = MemoryInit::new(&mut mb, info, BootConfig::default());

        assert_eq!(
            init.reserve_kernel(),
            Err(BootMemoryError::PhaseOrder {
                expected: Phase::Populate,
                found: Phase::ReserveKernel
            })
        );
        assert_eq!(init.next_phase(), Phase::Populate);

        init.populate().unwrap();
        assert_eq!(
            init.populate(),
            Err(BootMemoryError::PhaseOrder {
                expected: Phase::ClampUsable,
                found: Phase::Populate
            })
        );
        assert_eq!(init.memblock().phys_mem_size(), 0x4000_0000);
    }

    #[test]
    fn empty_memory_map_is_fatal() {
        let mut mb = MemBlock::new();
        let mut init = MemoryInit::new(&mut mb, BootMemoryInfo::default(), BootConfig::default());
        assert_eq!(init.run(), Err(BootMemoryError::NoMemory));
        assert_eq!(init.next_phase(), Phase::Populate);
    }

    #[test]
    fn reserve_optional_reports_without_failing() {
        let mut mb = MemBlock::new();
        mb.add(PhysicalAddress::zero(), 0x10_0000).unwrap();
        let base = PhysicalAddress::new(0x2_0000);

        assert_eq!(reserve_optional(&mut mb, base, 0x1000, "test"), Ok(true));
        assert_eq!(reserve_optional(&mut mb, base, 0x1000, "test"), Ok(false));
        assert_eq!(
            reserve_optional(&mut mb, PhysicalAddress::new(0x20_0000), 0x1000, "test"),
            Ok(false)
        );
        assert_eq!(mb.reserved_size(), 0x1000);
    }
}
