// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The four-level radix page table mapping 48-bit guest virtual addresses to
//! host storage.
//!
//! Interior tables and anonymous leaves are 4 KiB pool pages; a leaf entry
//! packs the host address of its page into bits 12..52 alongside attribute
//! bits. The emulator is the only walker, so guest privilege checks are done
//! from the attribute bits, not by hardware. Entries are read and written
//! through 64-bit atomics so a concurrent walker observes either the old or
//! the new entry, never a torn one.

use crate::system::MemState;
use arena_mmap::pool;
use bitfield_struct::bitfield;
use linuxdefs::mman::PROT_EXEC;
use linuxdefs::mman::PROT_READ;
use linuxdefs::mman::PROT_WRITE;
use linuxdefs::Errno;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// One page-table entry.
///
/// Exactly one of these shapes holds for a valid leaf: `{host}` (anonymous
/// pool page), `{host, mapped}` (linear host mapping), `{host, mapped, mug}`
/// (individually mapped host page), or none of the three with the address
/// below the real-mode buffer size.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    /// The entry is populated.
    pub valid: bool,
    /// Guest-writable.
    pub writable: bool,
    /// Guest-readable (present to the guest).
    pub user: bool,
    #[bits(6)]
    pub available0: u64,
    /// Reserved but not yet committed; committed lazily on first access.
    pub reserved_only: bool,
    /// The stored address is directly usable host memory.
    pub host: bool,
    /// Backed by a host mapping rather than a pool page.
    pub mapped: bool,
    /// Host address bits 12..52.
    #[bits(40)]
    pub frame: u64,
    /// A file-backed mapping ends inside this page.
    pub file_end: bool,
    /// Individually host-mmapped, outside the linear arena.
    pub mug: bool,
    #[bits(9)]
    pub available1: u64,
    /// Execute disabled.
    pub no_execute: bool,
}

impl PageEntry {
    /// The host (or real-mode) address stored in the entry.
    pub fn host_addr(&self) -> u64 {
        self.frame() << 12
    }

    /// Stores a 4 KiB-aligned host address.
    pub fn with_host_addr(self, addr: u64) -> Self {
        debug_assert!(addr & 0xfff == 0 && addr >> 52 == 0);
        self.with_frame(addr >> 12)
    }

    /// True when only protection-key bits (user/writable/no-execute) are set.
    pub fn is_protection_key(&self) -> bool {
        self.with_user(false).with_writable(false).with_no_execute(false) == PageEntry::new()
    }
}

/// Guest PROT_* bits to entry protection-key bits. The execute-disable bit is
/// set, not cleared, to mean non-executable.
pub fn set_protection(prot: i32) -> PageEntry {
    PageEntry::new()
        .with_user(prot & PROT_READ != 0)
        .with_writable(prot & PROT_WRITE != 0)
        .with_no_execute(prot & PROT_EXEC == 0)
}

/// Entry protection-key bits back to guest PROT_* bits.
pub fn get_protection(entry: PageEntry) -> i32 {
    let mut prot = 0;
    if entry.user() {
        prot |= PROT_READ;
    }
    if entry.writable() {
        prot |= PROT_WRITE;
    }
    if !entry.no_execute() {
        prot |= PROT_EXEC;
    }
    prot
}

/// Radix index of `virt` at a level shift (39, 30, 21, or 12).
pub fn table_index(virt: i64, level: u32) -> u64 {
    ((virt as u64) >> level) & 511
}

/// Loads the entry at `index` in the table page at host address `table`.
///
/// # Safety
///
/// `table` must be the host address of a live 4 KiB page-table page.
pub(crate) unsafe fn load_entry(table: u64, index: u64) -> PageEntry {
    debug_assert!(index < 512);
    // SAFETY: the slot lies within the table page per the caller's contract;
    // entries are only ever accessed through this atomic.
    let slot = unsafe { &*((table as usize + index as usize * 8) as *const AtomicU64) };
    PageEntry::from_bits(slot.load(Ordering::Acquire))
}

/// Stores the entry at `index` in the table page at host address `table`.
///
/// # Safety
///
/// `table` must be the host address of a live 4 KiB page-table page, and the
/// caller must hold the address-space lock.
pub(crate) unsafe fn store_entry(table: u64, index: u64, entry: PageEntry) {
    debug_assert!(index < 512);
    // SAFETY: see load_entry.
    let slot = unsafe { &*((table as usize + index as usize * 8) as *const AtomicU64) };
    slot.store(entry.into_bits(), Ordering::Release);
}

/// Takes a pool page and tags it as a committed guest data page.
pub(crate) fn allocate_page(mem: &mut MemState) -> Result<PageEntry, Errno> {
    let page = pool::take().map_err(|err| match err {
        arena_mmap::Error::Exhausted => Errno::ENOMEM,
        arena_mmap::Error::Host(e) => Errno::from_host_io(&e),
    })?;
    if page.reclaimed {
        mem.memstat.freed -= 1;
        mem.memstat.committed += 1;
        mem.memstat.reclaimed += 1;
    } else {
        mem.memstat.allocated += pool::BATCH as i64;
        mem.memstat.committed += 1;
        mem.memstat.freed += (pool::BATCH - 1) as i64;
    }
    mem.rss += 1;
    Ok(PageEntry::new()
        .with_host_addr(page.addr.as_ptr() as u64)
        .with_host(true)
        .with_user(true)
        .with_writable(true)
        .with_valid(true))
}

/// Takes a pool page for use as an interior page table.
pub(crate) fn allocate_page_table(mem: &mut MemState) -> Result<PageEntry, Errno> {
    let entry = allocate_page(mem)?.with_user(false);
    mem.memstat.pagetables += 1;
    Ok(entry)
}

/// Post-order collapse of empty page tables under `pt` at `level` (the root
/// is level 1, leaves hang off level 4). A table whose 512 slots are all
/// zero goes back to the pool and the caller nulls its slot.
pub(crate) fn free_page_tables(mem: &mut MemState, pt: PageEntry, level: u32) -> bool {
    let table = pt.host_addr();
    let mut canfree = true;
    for i in 0..512 {
        if level == 4 {
            // SAFETY: pt is a live table per the walk invariant.
            if unsafe { load_entry(table, i) } != PageEntry::new() {
                canfree = false;
            }
        } else {
            // SAFETY: pt is a live table per the walk invariant.
            let child = unsafe { load_entry(table, i) };
            if child.valid() {
                if free_page_tables(mem, child, level + 1) {
                    // SAFETY: same table as above.
                    unsafe { store_entry(table, i, PageEntry::new()) };
                } else {
                    canfree = false;
                }
            } else {
                debug_assert_eq!(child, PageEntry::new());
            }
        }
    }
    if canfree {
        // SAFETY: every slot is zero, so nothing references this page.
        unsafe { pool::give(std::ptr::NonNull::new(table as *mut u8).unwrap()) };
        mem.memstat.pagetables -= 1;
        mem.rss -= 1;
    }
    canfree
}
