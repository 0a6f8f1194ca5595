mod common;

use kernel_bootmem::{BootMemoryError, LayoutConfig, MemoryInit, Phase};
use kernel_info::boot::{BootMemoryInfo, MemoryKind, MemoryRangeDesc, PhysRange, ReservedRangeDesc};
use kernel_info::cmdline::BootConfig;
use kernel_info::memory::PAGE_OFFSET;
use kernel_memblock::{FreeRange, MemBlock, MemBlockError};
use kernel_memory_addresses::PhysicalAddress;
use log::Level;

const KERNEL: PhysRange = PhysRange::new(0x4020_0000, 0x200_0000);
const GIB: u64 = 1 << 30;

fn pa(v: u64) -> PhysicalAddress {
    PhysicalAddress::new(v)
}

fn firmware(memory: &[MemoryRangeDesc]) -> BootMemoryInfo<'_> {
    BootMemoryInfo {
        memory,
        kernel_image: KERNEL,
        ..BootMemoryInfo::default()
    }
}

fn spans(set: &kernel_memblock::RegionSet) -> Vec<(u64, u64)> {
    set.iter()
        .map(|r| (r.base.as_u64(), r.end().as_u64()))
        .collect()
}

fn cmdline(s: &str) -> BootConfig<'_> {
    BootConfig::parse(s).unwrap()
}

#[test]
fn unaligned_crash_kernel_base_is_rejected() {
    common::capture();
    let memory = [MemoryRangeDesc::usable(0, 0x1_0000_0000)];
    let mut mb = MemBlock::new();

    let layout = MemoryInit::new(&mut mb, firmware(&memory), cmdline("crashkernel=16M@0x3000"))
        .run()
        .unwrap();

    assert_eq!(layout.crashkernel, None);
    assert_eq!(spans(mb.reserved()), [(0x4020_0000, 0x4220_0000)]);
    assert!(common::warned("base address is not 2MB aligned"));
}

#[test]
fn crash_kernel_goes_to_the_top_of_dma32() {
    common::capture();
    let memory = [MemoryRangeDesc::usable(0, 8 * GIB)];
    let mut mb = MemBlock::new();

    let layout = MemoryInit::new(&mut mb, firmware(&memory), cmdline("crashkernel=256M"))
        .run()
        .unwrap();

    assert_eq!(layout.zones.dma, pa(GIB));
    assert_eq!(layout.zones.dma32, pa(4 * GIB));
    assert_eq!(layout.zones.normal, pa(8 * GIB));

    let crash = layout.crashkernel.unwrap();
    assert_eq!(crash.start, pa(0xf000_0000));
    assert_eq!(crash.end, pa(0xffff_ffff));
    assert!(mb.is_region_reserved(crash.start, crash.size()));
    assert!(
        common::messages(Level::Info)
            .contains(&"crashkernel reserved: 0x00000000f0000000 - 0x0000000100000000 (256 MB)".to_string())
    );
}

#[test]
fn crash_kernel_range_form_depends_on_memory_size() {
    let memory = [MemoryRangeDesc::usable(0, 2 * GIB)];
    let mut mb = MemBlock::new();

    let layout = MemoryInit::new(
        &mut mb,
        firmware(&memory),
        cmdline("crashkernel=0-1G:64M,1G-:128M"),
    )
    .run()
    .unwrap();

    assert_eq!(layout.crashkernel.map(|c| c.size()), Some(128 << 20));
}

#[test]
fn memory_beyond_the_linear_map_is_clipped() {
    let memory = [MemoryRangeDesc::usable(0x4000_0000, 8 * GIB)];
    let layout_config = LayoutConfig {
        linear_region_size: 4 * GIB,
        ..LayoutConfig::default()
    };
    let mut mb = MemBlock::new();

    let layout = MemoryInit::new(&mut mb, firmware(&memory), BootConfig::default())
        .with_layout(layout_config)
        .run()
        .unwrap();

    assert_eq!(layout.memstart_addr, 0x4000_0000);
    assert_eq!(spans(mb.memory()), [(0x4000_0000, 0x1_4000_0000)]);
    assert_eq!(mb.physmem().total_size(), 8 * GIB);
}

#[test]
fn linear_map_slides_up_to_a_high_kernel() {
    let memory = [MemoryRangeDesc::usable(0x4000_0000, 8 * GIB)];
    let info = BootMemoryInfo {
        kernel_image: PhysRange::new(0x2_0000_0000, 0x200_0000),
        ..firmware(&memory)
    };
    let layout_config = LayoutConfig {
        linear_region_size: 4 * GIB,
        ..LayoutConfig::default()
    };
    let mut mb = MemBlock::new();

    let layout = MemoryInit::new(&mut mb, info, BootConfig::default())
        .with_layout(layout_config)
        .run()
        .unwrap();

    assert_eq!(layout.memstart_addr, 0x1_4000_0000);
    assert_eq!(spans(mb.memory()), [(0x1_4000_0000, 0x2_0200_0000)]);
    assert!(mb.is_region_reserved(pa(0x2_0000_0000), 0x200_0000));

    assert_eq!(layout.min_pfn, 0x14_0000);
    assert_eq!(layout.max_pfn, 0x20_2000);
    assert_eq!(layout.linear_map().phys_to_virt(pa(0x1_4000_0000)), PAGE_OFFSET);
    assert_eq!(layout.high_memory, PAGE_OFFSET + 0xc200_0000);

    assert_eq!(layout.zones.dma, pa(0x1_8000_0000));
    assert_eq!(layout.zones.dma32, pa(0x2_0000_0000));
}

#[test]
fn memory_limit_keeps_the_kernel_reachable() {
    let memory = [MemoryRangeDesc::usable(0x4000_0000, 2 * GIB)];
    let info = BootMemoryInfo {
        kernel_image: PhysRange::new(0xb000_0000, 0x200_0000),
        ..firmware(&memory)
    };
    let mut mb = MemBlock::new();

    MemoryInit::new(&mut mb, info, cmdline("mem=512M"))
        .run()
        .unwrap();

    assert_eq!(
        spans(mb.memory()),
        [(0x4000_0000, 0x6000_0000), (0xb000_0000, 0xb200_0000)]
    );
    assert_eq!(spans(mb.reserved()), [(0xb000_0000, 0xb200_0000)]);
    assert_eq!(mb.physmem().total_size(), 2 * GIB);
}

#[test]
fn ramdisk_is_reserved_page_aligned_and_mapped() {
    let memory = [
        MemoryRangeDesc::usable(0x4000_0000, 0x800_0000),
        MemoryRangeDesc::usable(0x4800_0000, 0x800_0000).with_kind(MemoryKind::NoMap),
    ];
    let initrd = PhysRange::new(0x4800_0800, 0x1000);
    let info = BootMemoryInfo {
        ramdisk: Some(initrd),
        ..firmware(&memory)
    };
    let mut mb = MemBlock::new();

    let layout = MemoryInit::new(&mut mb, info, BootConfig::default())
        .run()
        .unwrap();

    assert_eq!(layout.ramdisk, Some(initrd));
    assert!(mb.is_region_reserved(pa(0x4800_0000), 0x2000));
    assert!(mb.is_map_memory(pa(0x4800_0000)));
    assert!(mb.is_map_memory(pa(0x4800_1000)));
    assert!(!mb.is_map_memory(pa(0x4800_2000)));
}

#[test]
fn unreachable_ramdisk_is_dropped_with_a_warning() {
    common::capture();
    let memory = [MemoryRangeDesc::usable(0x4000_0000, GIB)];
    let info = BootMemoryInfo {
        ramdisk: Some(PhysRange::new(0x3000_0000, 0x10_0000)),
        ..firmware(&memory)
    };
    let mut mb = MemBlock::new();

    let layout = MemoryInit::new(&mut mb, info, BootConfig::default())
        .run()
        .unwrap();

    assert_eq!(layout.ramdisk, None);
    assert_eq!(spans(mb.reserved()), [(0x4020_0000, 0x4220_0000)]);
    assert!(common::warned("initrd not fully accessible via the linear mapping"));
}

#[test]
fn seed_shifts_the_linear_map_down() {
    let memory = [MemoryRangeDesc::usable(0x8000_0000, GIB)];
    let info = BootMemoryInfo {
        kernel_image: PhysRange::new(0x8020_0000, 0x200_0000),
        memstart_offset_seed: 0x8000,
        ..firmware(&memory)
    };
    let mut mb = MemBlock::new();

    let layout = MemoryInit::new(&mut mb, info, BootConfig::default())
        .run()
        .unwrap();

    // (2^47 - 2^30) / 2^30 * 0x8000 >> 16 == 0xffff steps of 1 GiB.
    let shift = 0xffff * GIB;
    assert_eq!(layout.memstart_addr, 0x8000_0000 - shift.cast_signed());
    let map = layout.linear_map();
    assert_eq!(map.phys_to_virt(pa(0x8000_0000)), PAGE_OFFSET + shift);
    assert_eq!(map.virt_to_phys(PAGE_OFFSET + shift), pa(0x8000_0000));
    assert_eq!(layout.high_memory, PAGE_OFFSET + shift + GIB);

    // The physical side is untouched.
    assert_eq!(spans(mb.memory()), [(0x8000_0000, 0xc000_0000)]);
}

#[test]
fn randomization_can_be_switched_off() {
    let memory = [MemoryRangeDesc::usable(0x8000_0000, GIB)];
    let info = BootMemoryInfo {
        kernel_image: PhysRange::new(0x8020_0000, 0x200_0000),
        memstart_offset_seed: 0x8000,
        ..firmware(&memory)
    };
    let mut mb = MemBlock::new();

    let layout = MemoryInit::new(&mut mb, info, BootConfig::default())
        .with_layout(LayoutConfig {
            randomize: false,
            ..LayoutConfig::default()
        })
        .run()
        .unwrap();

    assert_eq!(layout.memstart_addr, 0x8000_0000);
    assert_eq!(layout.linear_map().phys_to_virt(pa(0x8000_0000)), PAGE_OFFSET);
}

#[test]
fn firmware_reservations_that_fail_are_skipped() {
    common::capture();
    let memory = [MemoryRangeDesc::usable(0x4000_0000, GIB)];
    let carve_outs = [
        ReservedRangeDesc::new(PhysRange::new(0x5000_0000, 0x10_0000))
            .named("optee")
            .on_node(1),
        ReservedRangeDesc::new(PhysRange::new(0x1000, 0x1000)).named("outside"),
        ReservedRangeDesc::new(PhysRange::new(0x4030_0000, 0x1000)),
    ];
    let info = BootMemoryInfo {
        reserved: &carve_outs,
        ..firmware(&memory)
    };
    let mut mb = MemBlock::new();

    MemoryInit::new(&mut mb, info, BootConfig::default())
        .run()
        .unwrap();

    assert_eq!(
        spans(mb.reserved()),
        [(0x4020_0000, 0x4220_0000), (0x5000_0000, 0x5010_0000)]
    );
    assert!(common::warned("outside: not reserved"));
    assert!(common::warned("reserved-memory: not reserved"));
    assert!(
        common::messages(Level::Debug)
            .contains(&"optee: reserved [0x50000000-0x50100000) on node 1".to_string())
    );
}

#[test]
fn full_physmem_table_does_not_stop_the_boot() {
    common::capture();
    let memory: Vec<MemoryRangeDesc> = (0..6)
        .map(|i| MemoryRangeDesc::usable(0x4000_0000 + i * 0x2000_0000, 0x1000_0000))
        .collect();
    let mut mb = MemBlock::new();

    let layout = MemoryInit::new(&mut mb, firmware(&memory), BootConfig::default())
        .run()
        .unwrap();

    assert_eq!(layout.memstart_addr, 0x4000_0000);
    assert_eq!(mb.memory().len(), 6);
    assert_eq!(mb.physmem().len(), 4);
    assert!(common::warned("physmem:"));
}

#[test]
fn page_tables_inside_the_image_are_not_reserved_twice() {
    let memory = [MemoryRangeDesc::usable(0x4000_0000, GIB)];
    let tables = [
        PhysRange::new(0x4030_0000, 0x3000),
        PhysRange::new(0x4800_0000, 0x2000),
    ];
    let info = BootMemoryInfo {
        page_tables: &tables,
        ..firmware(&memory)
    };
    let mut mb = MemBlock::new();

    MemoryInit::new(&mut mb, info, BootConfig::default())
        .run()
        .unwrap();

    assert_eq!(
        spans(mb.reserved()),
        [(0x4020_0000, 0x4220_0000), (0x4800_0000, 0x4800_2000)]
    );
}

#[test]
fn page_tables_outside_memory_stop_the_boot() {
    let memory = [MemoryRangeDesc::usable(0x4000_0000, GIB)];
    let tables = [PhysRange::new(0x1000, 0x1000)];
    let info = BootMemoryInfo {
        page_tables: &tables,
        ..firmware(&memory)
    };
    let mut mb = MemBlock::new();
    let mut init = MemoryInit::new(&mut mb, info, BootConfig::default());

    assert_eq!(
        init.run(),
        Err(BootMemoryError::PageTables(MemBlockError::NotMemory {
            base: pa(0x1000),
            size: 0x1000
        }))
    );
    assert_eq!(init.next_phase(), Phase::ReserveKernel);
}

#[test]
fn kernel_outside_memory_stops_the_boot() {
    let memory = [MemoryRangeDesc::usable(0x4000_0000, GIB)];
    let info = BootMemoryInfo {
        kernel_image: PhysRange::new(0x2000_0000, 0x200_0000),
        ..firmware(&memory)
    };
    let mut mb = MemBlock::new();

    let result = MemoryInit::new(&mut mb, info, BootConfig::default()).run();

    assert_eq!(
        result,
        Err(BootMemoryError::KernelImage(MemBlockError::NotMemory {
            base: pa(0x2000_0000),
            size: 0x200_0000
        }))
    );
    assert!(mb.reserved().is_empty());
}

#[test]
fn usable_range_override_keeps_nomap_memory() {
    let memory = [
        MemoryRangeDesc::usable(0x4000_0000, GIB),
        MemoryRangeDesc::usable(0x9000_0000, 0x1000).with_kind(MemoryKind::NoMap),
    ];
    let info = BootMemoryInfo {
        usable_range: Some(PhysRange::new(0x4000_0000, 0x1000_0000)),
        ..firmware(&memory)
    };
    let mut mb = MemBlock::new();

    MemoryInit::new(&mut mb, info, BootConfig::default())
        .run()
        .unwrap();

    assert_eq!(
        spans(mb.memory()),
        [(0x4000_0000, 0x5000_0000), (0x9000_0000, 0x9000_1000)]
    );
    assert!(!mb.is_map_memory(pa(0x9000_0000)));
}

#[test]
fn conflicting_node_entries_are_ignored() {
    common::capture();
    let memory = [
        MemoryRangeDesc::usable(0, 0x1000_0000).on_node(0),
        MemoryRangeDesc::usable(0x800_0000, 0x1000_0000).on_node(1),
    ];
    let info = BootMemoryInfo {
        kernel_image: PhysRange::new(0x20_0000, 0x200_0000),
        ..firmware(&memory)
    };
    let mut mb = MemBlock::new();

    MemoryInit::new(&mut mb, info, BootConfig::default())
        .run()
        .unwrap();

    assert_eq!(spans(mb.memory()), [(0, 0x1000_0000)]);
    assert!(common::warned("ignoring memory map entry"));
}

#[test]
fn movable_node_keeps_boot_data_off_hotplug_memory() {
    let memory = [
        MemoryRangeDesc::usable(0, GIB).on_node(0),
        MemoryRangeDesc::usable(GIB, GIB)
            .on_node(1)
            .with_kind(MemoryKind::Hotplug),
    ];
    let info = BootMemoryInfo {
        kernel_image: PhysRange::new(0x20_0000, 0x200_0000),
        ..firmware(&memory)
    };
    let mut mb = MemBlock::new();
    let mut init = MemoryInit::new(&mut mb, info, cmdline("movable_node crashkernel=64M"));

    let layout = init.run().unwrap();
    assert_eq!(layout.crashkernel.map(|c| c.start), Some(pa(0x3c00_0000)));

    let free: Vec<FreeRange> = init.hand_off().unwrap().collect();
    assert_eq!(
        free,
        [
            FreeRange {
                base: pa(0),
                size: 0x20_0000
            },
            FreeRange {
                base: pa(0x220_0000),
                size: 0x3c00_0000 - 0x220_0000
            },
        ]
    );
}

#[test]
fn elfcorehdr_is_kept_unless_it_overlaps() {
    common::capture();
    let memory = [MemoryRangeDesc::usable(0x4000_0000, GIB)];
    let hdr = PhysRange::new(0x6000_0000, 0x1_0000);
    let mut mb = MemBlock::new();

    let layout = MemoryInit::new(
        &mut mb,
        BootMemoryInfo {
            elfcorehdr: Some(hdr),
            ..firmware(&memory)
        },
        BootConfig::default(),
    )
    .run()
    .unwrap();
    assert_eq!(layout.elfcorehdr, Some(hdr));
    assert!(
        common::messages(Level::Info)
            .contains(&"Reserving 64KB of memory at 0x60000000 for elfcorehdr".to_string())
    );

    let mut mb = MemBlock::new();
    let layout = MemoryInit::new(
        &mut mb,
        BootMemoryInfo {
            elfcorehdr: Some(PhysRange::new(0x4030_0000, 0x1_0000)),
            ..firmware(&memory)
        },
        BootConfig::default(),
    )
    .run()
    .unwrap();
    assert_eq!(layout.elfcorehdr, None);
    assert!(common::warned("elfcorehdr is overlapped"));
}

#[test]
fn phases_can_be_driven_one_at_a_time() {
    let memory = [MemoryRangeDesc::usable(0x4000_0000, GIB)];
    let mut mb = MemBlock::new();
    let mut init = MemoryInit::new(&mut mb, firmware(&memory), BootConfig::default());

    init.populate().unwrap();
    init.clamp_usable().unwrap();
    init.drop_unaddressable().unwrap();
    init.choose_base().unwrap();
    assert_eq!(init.memstart_addr(), 0x4000_0000);
    assert_eq!(init.linear_map().phys_to_virt(pa(0x4000_0000)), PAGE_OFFSET);

    assert_eq!(
        init.randomize(),
        Err(BootMemoryError::PhaseOrder {
            expected: Phase::ClipLinear,
            found: Phase::Randomize
        })
    );

    // The rest runs to completion from wherever the caller stopped.
    let layout = init.run().unwrap();
    assert_eq!(layout.memstart_addr, 0x4000_0000);
    assert_eq!(init.next_phase(), Phase::HandOff);
    assert_eq!(
        init.run(),
        Err(BootMemoryError::PhaseOrder {
            expected: Phase::HandOff,
            found: Phase::Finish
        })
    );
}

#[test]
fn hand_off_requires_a_finished_layout() {
    let memory = [MemoryRangeDesc::usable(0x4000_0000, GIB)];
    let mut mb = MemBlock::new();
    let init = MemoryInit::new(&mut mb, firmware(&memory), BootConfig::default());

    assert_eq!(
        init.hand_off().err(),
        Some(BootMemoryError::PhaseOrder {
            expected: Phase::Populate,
            found: Phase::HandOff
        })
    );
    assert!(!mb.is_finalized());
}

#[test]
fn hand_off_releases_everything_not_reserved() {
    let memory = [MemoryRangeDesc::usable(0x4000_0000, GIB)];
    let mut mb = MemBlock::new();
    let mut init = MemoryInit::new(&mut mb, firmware(&memory), BootConfig::default());
    init.run().unwrap();

    let free: Vec<FreeRange> = init.hand_off().unwrap().collect();

    assert_eq!(
        free,
        [
            FreeRange {
                base: pa(0x4000_0000),
                size: 0x20_0000
            },
            FreeRange {
                base: pa(0x4220_0000),
                size: 0x8000_0000 - 0x4220_0000
            },
        ]
    );
    assert!(mb.is_finalized());
    assert_eq!(mb.reserve(pa(0x4000_0000), 0x1000), Err(MemBlockError::Finalized));
}

#[test]
fn memblock_debug_dumps_every_set_at_hand_off() {
    common::capture();
    let memory = [MemoryRangeDesc::usable(0x4000_0000, GIB)];
    let mut mb = MemBlock::new();
    let mut init = MemoryInit::new(&mut mb, firmware(&memory), cmdline("memblock=debug"));
    init.run().unwrap();

    let _ = init.hand_off().unwrap().count();

    let infos = common::messages(Level::Info);
    assert!(infos.iter().any(|m| m == "MEMBLOCK configuration:"));
    assert!(infos.iter().any(|m| m.starts_with(" reserved.cnt")));
}
