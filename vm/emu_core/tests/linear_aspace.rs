// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end address-space behavior with the linear mapping enabled: guest
//! pages are host pages at a fixed skew, so these tests exercise real host
//! mmap/mprotect traffic.

#![cfg(unix)]

use emu_core::aspace::overlaps_precious;
use emu_core::pagetable::set_protection;
use emu_core::system::to_host;
use emu_core::vmem::Access;
use emu_core::CpuMode;
use emu_core::System;
use emu_core::SystemOptions;
use linuxdefs::mman::PROT_READ;
use linuxdefs::mman::PROT_WRITE;
use linuxdefs::Errno;
use std::os::unix::prelude::*;
use std::sync::Arc;

fn linear_system() -> Arc<System> {
    let s = System::new(CpuMode::Long, SystemOptions::default()).unwrap();
    assert!(s.has_linear_mapping());
    s
}

fn rw() -> emu_core::PageEntry {
    set_protection(PROT_READ | PROT_WRITE)
}

#[test]
fn anonymous_mapping_write_then_revoke_write() {
    let s = linear_system();
    let base = 0x6100_0000_0000i64;
    s.reserve_virtual(base, 0x4000, rw(), None, 0, false).unwrap();
    assert!(s.is_fully_mapped(base, 0x4000));

    let pattern: Vec<u8> = (0..0x4000u32).map(|i| (i * 7 % 256) as u8).collect();
    s.copy_to_guest(base, &pattern).unwrap();

    // Linear mode means the host sees the bytes directly at the skewed
    // address.
    // SAFETY: the interval was just mapped read/write.
    let host = unsafe { std::slice::from_raw_parts(to_host(base), 0x4000) };
    assert_eq!(host, &pattern[..]);

    // Drop write access: the guest-visible bits refuse writes while the data
    // stays readable. No host fault is involved in detecting this.
    s.protect_virtual(base, 0x4000, PROT_READ).unwrap();
    assert!(s.is_valid_memory(base, 0x4000, Access::Read));
    assert!(!s.is_valid_memory(base, 0x4000, Access::Write));
    assert_eq!(s.copy_to_guest(base, b"nope"), Err(Errno::EFAULT));
    let mut back = vec![0u8; 0x4000];
    s.copy_from_guest(&mut back, base).unwrap();
    assert_eq!(back, pattern);

    s.free_virtual(base, 0x4000).unwrap();
    assert!(s.is_fully_unmapped(base, 0x4000));
}

#[test]
fn overlapping_reserve_carves_protection_islands() {
    let s = linear_system();
    let base = 0x6200_0000_0000i64;
    s.reserve_virtual(base, 0x8000, rw(), None, 0, false).unwrap();
    s.reserve_virtual(base + 0x2000, 0x2000, set_protection(PROT_READ), None, 0, false)
        .unwrap();

    assert!(s.is_valid_memory(base, 0x2000, Access::Write));
    assert!(s.is_valid_memory(base + 0x2000, 0x2000, Access::Read));
    assert!(!s.is_valid_memory(base + 0x2000, 0x2000, Access::Write));
    assert!(s.is_valid_memory(base + 0x4000, 0x4000, Access::Write));

    s.free_virtual(base, 0x8000).unwrap();
}

#[test]
fn rss_tracks_net_mapping_changes() {
    let s = linear_system();
    let base = 0x6300_0000_0000i64;
    let rss0 = s.rss();

    // 256 KiB mapped: 64 data pages, all committed in linear mode.
    s.reserve_virtual(base, 0x4_0000, rw(), None, 0, false).unwrap();
    let rss_mapped = s.rss();
    assert!(rss_mapped - rss0 >= 64);

    // Free the middle 64 KiB.
    s.free_virtual(base + 0x1_0000, 0x1_0000).unwrap();
    assert_eq!(s.rss(), rss_mapped - 16);

    // Remap 128 KiB overlapping the hole: net +16 data pages.
    s.reserve_virtual(base + 0x8000, 0x2_0000, rw(), None, 0, false).unwrap();
    assert_eq!(s.rss(), rss_mapped - 16 + 32 - 16);

    s.free_virtual(base, 0x4_0000).unwrap();
}

#[test]
fn file_mappings_reach_the_file_contents() {
    let s = linear_system();
    let base = 0x6400_0000_0000i64;
    let pagesize = arena_page_size();

    let dir = std::env::temp_dir();
    let path = dir.join(format!("emu-linear-{}", std::process::id()));
    let mut contents = vec![0u8; pagesize.max(0x1000)];
    contents[..8].copy_from_slice(b"filedata");
    std::fs::write(&path, &contents).unwrap();
    let file = std::fs::File::open(&path).unwrap();

    s.reserve_virtual(
        base,
        0x1000,
        set_protection(PROT_READ),
        Some(file.as_fd()),
        0,
        false,
    )
    .unwrap();
    let mut buf = [0u8; 8];
    s.copy_from_guest(&mut buf, base).unwrap();
    assert_eq!(&buf, b"filedata");

    s.free_virtual(base, 0x1000).unwrap();
    drop(file);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn shared_file_mapping_syncs_back() {
    let s = linear_system();
    let base = 0x6500_0000_0000i64;
    let pagesize = arena_page_size();

    let dir = std::env::temp_dir();
    let path = dir.join(format!("emu-msync-{}", std::process::id()));
    std::fs::write(&path, vec![0u8; pagesize.max(0x1000)]).unwrap();
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();

    s.reserve_virtual(base, 0x1000, rw(), Some(file.as_fd()), 0, true).unwrap();
    s.copy_to_guest(base, b"synced!!").unwrap();
    s.sync_virtual(base, 0x1000, libc::MS_SYNC).unwrap();

    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(&on_disk[..8], b"synced!!");

    s.free_virtual(base, 0x1000).unwrap();
    drop(file);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn reservations_cannot_touch_the_precious_window() {
    let s = linear_system();
    let precious = arena_mmap::PRECIOUS_START as i64;
    assert!(overlaps_precious(precious, 0x1000));
    assert_eq!(
        s.reserve_virtual(precious, 0x1000, rw(), None, 0, false),
        Err(Errno::ENOMEM)
    );
    assert!(!s.is_fully_unmapped(precious, 0x1000));
}

#[test]
fn find_virtual_jumps_the_precious_window() {
    let s = linear_system();
    let hole = s
        .find_virtual(arena_mmap::PRECIOUS_START as i64 - 0x1000, 0x2000)
        .unwrap();
    assert!(hole >= arena_mmap::PRECIOUS_END as i64);
    assert!(s.is_fully_unmapped(hole, 0x2000));
}

#[test]
fn linear_mode_rejects_nonpositive_and_misaligned_addresses() {
    let s = linear_system();
    assert_eq!(
        s.reserve_virtual(-0x1_0000, 0x1000, rw(), None, 0, false),
        Err(Errno::ENOTSUP)
    );
    let pagesize = arena_page_size() as i64;
    if pagesize > 0x1000 {
        // 4 KiB-aligned but not host-page aligned.
        assert_eq!(
            s.reserve_virtual(0x6600_0000_0000 + 0x1000, 0x1000, rw(), None, 0, false),
            Err(Errno::EINVAL)
        );
    }
}

fn arena_page_size() -> usize {
    arena_mmap::page_size()
}
