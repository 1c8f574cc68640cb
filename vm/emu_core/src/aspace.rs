// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reserve, free, protect, sync, and find operations over guest intervals.
//!
//! Every operation validates its interval, walks the page table under the
//! address-space lock, batches contiguous linear subranges so the host sees
//! one call per run, and broadcasts a TLB invalidate after releasing walk
//! state. Replacing a linear mapping that has holes crosses a point of no
//! return: once the old subranges are unmapped, a host failure leaves the
//! address space inconsistent with the page tables and the process exits
//! with status 250.

use crate::pagetable;
use crate::pagetable::set_protection;
use crate::pagetable::table_index;
use crate::pagetable::PageEntry;
use crate::system::to_host;
use crate::system::CpuMode;
use crate::system::MemState;
use crate::system::System;
use arena_mmap::Backing;
use arena_mmap::GUEST_PAGE_SIZE;
use arena_mmap::PRECIOUS_END;
use arena_mmap::PRECIOUS_START;
use linuxdefs::mman::PROT_EXEC;
use linuxdefs::mman::PROT_READ;
use linuxdefs::mman::PROT_WRITE;
use linuxdefs::Errno;
use std::os::unix::prelude::*;

/// Guest virtual to host skew, re-exported next to the window it pairs with.
pub use crate::system::SKEW;

/// Checks the shape every address-space operation requires: positive
/// page-aligned size, 4 KiB-aligned base inside the 48-bit canonical range.
pub fn is_valid_addr_size(virt: i64, size: i64) -> bool {
    size > 0
        && virt & 4095 == 0
        && virt >= -0x8000_0000_0000
        && virt < 0x8000_0000_0000
        && size <= 0x1_0000_0000_0000
        && virt + size <= 0x8000_0000_0000
}

/// True when the interval's host image would touch the window the arena
/// reserves for the emulator itself.
pub fn overlaps_precious(virt: i64, size: i64) -> bool {
    if size <= 0 {
        return false;
    }
    let beg_a = virt.wrapping_add(SKEW) as u64;
    let end_a = virt.wrapping_add(SKEW).wrapping_add(size - 1) as u64;
    let beg_b = PRECIOUS_START as u64;
    let end_b = PRECIOUS_END as u64 - 1;
    beg_a.max(beg_b) < end_a.min(end_b)
}

/// Translates guest PROT_* bits to the host's values.
fn host_prot(prot: i32) -> i32 {
    (if prot & PROT_READ != 0 { libc::PROT_READ } else { 0 })
        | (if prot & PROT_WRITE != 0 { libc::PROT_WRITE } else { 0 })
        | (if prot & PROT_EXEC != 0 { libc::PROT_EXEC } else { 0 })
}

/// A half-open guest interval `[a, b)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct MemoryRange {
    a: i64,
    b: i64,
}

/// Contiguous guest subranges accumulated during a walk so per-leaf host
/// calls collapse into one call per run.
#[derive(Default)]
struct Ranges(Vec<MemoryRange>);

impl Ranges {
    fn add_page(&mut self, virt: i64, end: i64) {
        if !matches!(self.0.last(), Some(last) if last.b == virt) {
            self.0.push(MemoryRange { a: virt, b: virt });
        }
        self.0.last_mut().unwrap().b = virt + 4096.min(end - virt);
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn panic_due_to_mmap() -> ! {
    // The page tables no longer describe the host address space; nothing can
    // be unwound from here.
    eprintln!(
        "unrecoverable mmap() crisis: try disabling the linear mapping (-m) \
         or relinking the emulator at a higher image base"
    );
    std::process::exit(250);
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum MapMethod {
    /// Let the kernel atomically replace the old mapping.
    Fixed,
    /// The interval must be a greenfield; collisions are a crisis.
    Demand,
}

impl System {
    /// Removes page-table entries over `[virt, virt+size)`. Anonymous pages
    /// go back to the pool, mug pages are unmapped one by one, and linear
    /// pages have their intervals pooled into `ranges` for the caller to
    /// unmap in batches.
    fn remove_virtual(
        &self,
        mem: &mut MemState,
        virt: i64,
        size: i64,
        ranges: &mut Ranges,
        mutated: &mut bool,
        vss_delta: &mut i64,
        rss_delta: &mut i64,
    ) {
        if !mem.cr3.valid() {
            return;
        }
        let end = virt + size;
        let mut virt = virt;
        while virt < end {
            let mut pt = mem.cr3;
            let mut i = 39u32;
            let step = loop {
                let table = pt.host_addr();
                let ti = table_index(virt, i);
                // SAFETY: pt designates a live table page per the walk
                // invariant, rooted at cr3.
                let entry = unsafe { pagetable::load_entry(table, ti) };
                if !entry.valid() {
                    break 1u64 << i;
                }
                if i == 12 {
                    let linear_page =
                        free_page(mem, entry, 4096.min(end - virt), mutated, rss_delta);
                    if linear_page && self.has_linear_mapping() {
                        ranges.add_page(virt, end);
                    }
                    // SAFETY: same table as the load above.
                    unsafe { pagetable::store_entry(table, ti, PageEntry::new()) };
                    *vss_delta -= 1;
                    break 1 << 12;
                }
                pt = entry;
                i -= 9;
            };
            virt += step as i64;
        }
    }

    /// Maps `[virt, virt+size)`, replacing whatever was there.
    ///
    /// `key` carries only protection-key bits; backing and commitment bits
    /// are chosen here. With an `fd` the mapping is file-backed at `offset`
    /// (4 KiB aligned; host-page aligned in linear mode); `shared` selects
    /// MAP_SHARED semantics.
    pub fn reserve_virtual(
        &self,
        virt: i64,
        size: i64,
        key: PageEntry,
        fd: Option<BorrowedFd<'_>>,
        offset: i64,
        shared: bool,
    ) -> Result<(), Errno> {
        debug_assert!(key.is_protection_key());
        debug_assert!(self.mode() == CpuMode::Long);

        if !is_valid_addr_size(virt, size) {
            tracing::debug!(virt, size, "not a legal mapping");
            return Err(Errno::EINVAL);
        }
        if self.has_linear_mapping() && overlaps_precious(virt, size) {
            tracing::debug!(virt, size, "mapping overlaps memory reserved for the emulator");
            return Err(Errno::ENOMEM);
        }
        if fd.is_some() && offset & 4095 != 0 {
            tracing::debug!(offset, "file offset not 4096-byte aligned");
            return Err(Errno::EINVAL);
        }
        let pagesize = arena_mmap::page_size() as i64;
        if self.has_linear_mapping() {
            if virt <= 0 {
                tracing::debug!(virt, "guest chose an address linear mode cannot express");
                return Err(Errno::ENOTSUP);
            }
            if virt & (pagesize - 1) != 0 {
                tracing::debug!(virt, pagesize, "address not host-page aligned in linear mode");
                return Err(Errno::EINVAL);
            }
            if offset & (pagesize - 1) != 0 {
                tracing::debug!(offset, pagesize, "offset not host-page aligned in linear mode");
                return Err(Errno::EINVAL);
            }
        }
        tracing::debug!(virt, size, "reserving virtual interval");

        let mut mem = self.mem.lock();

        // Remove any existing mapping. This may be the point of no return.
        let mut ranges = Ranges::default();
        let mut mutated = false;
        let (mut vss_delta, mut rss_delta) = (0i64, 0i64);
        self.remove_virtual(
            &mut mem,
            virt,
            size,
            &mut ranges,
            &mut mutated,
            &mut vss_delta,
            &mut rss_delta,
        );
        let mut method = MapMethod::Demand;
        if self.has_linear_mapping() && !ranges.is_empty() {
            if ranges.0.len() == 1 && ranges.0[0].a == virt && ranges.0[0].b == virt + size {
                // The old mapping covers the interval exactly; the kernel can
                // replace it atomically.
                method = MapMethod::Fixed;
            } else {
                // Holes exist; clear the old subranges and demand a
                // greenfield. Any failure past here is unrecoverable.
                for r in &ranges.0 {
                    // SAFETY: the subrange was mapped linearly by a prior
                    // reserve and its page-table slots were just cleared.
                    let _ = unsafe {
                        arena_mmap::unmap(to_host(r.a).cast(), (r.b - r.a) as usize)
                    };
                    mutated = true;
                }
            }
        }

        let prot = (if key.user() { libc::PROT_READ } else { 0 })
            | (if key.writable() || fd.is_none() { libc::PROT_WRITE } else { 0 });

        let mut flags = key;
        if self.has_linear_mapping() {
            // Creating the linear mapping runs the risk of destroying host
            // state the emulator does not know about; the demand flag turns
            // that into a report instead of corruption.
            let want = to_host(virt).cast();
            let backing = match fd {
                Some(fd) => Backing::File { fd, offset, shared },
                None => Backing::Anonymous { shared },
            };
            // SAFETY: the interval was validated, its old contents removed,
            // and Fixed is only used when the interval was wholly ours.
            let res = unsafe {
                match method {
                    MapMethod::Fixed => arena_mmap::map_fixed(want, size as usize, prot, backing),
                    MapMethod::Demand => {
                        arena_mmap::map_demand(want, size as usize, prot, backing)
                    }
                }
            };
            match res {
                Ok(_) => {}
                Err(arena_mmap::Error::Host(e))
                    if e.raw_os_error() == Some(libc::ENOMEM) && !mutated =>
                {
                    tracing::debug!("host system returned ENOMEM");
                    return Err(Errno::ENOMEM);
                }
                Err(err) => {
                    tracing::error!(
                        virt,
                        size,
                        error = &err as &dyn std::error::Error,
                        "linear mmap crisis; the requested interval may overlap \
                         the emulator image or host-owned memory"
                    );
                    panic_due_to_mmap();
                }
            }
            mem.memstat.allocated += size / 4096;
            mem.memstat.committed += size / 4096;
            flags = flags.with_host(true).with_mapped(true);
        } else if fd.is_some() || shared {
            flags = flags.with_host(true).with_mapped(true).with_mug(true);
            mem.memstat.reserved += size / 4096;
        } else {
            mem.memstat.reserved += size / 4096;
        }

        // Account for pre-existing memory that was just removed. Replacing a
        // partially reserved interval can transiently drive the counters
        // negative, so clamp.
        mem.vss += vss_delta;
        mem.rss += rss_delta;
        mem.memchurn += -vss_delta;
        mem.vss = mem.vss.max(0);
        mem.rss = mem.rss.max(0);

        // Insert leaves, materializing interior tables as needed.
        let end = virt + size;
        let mut virt = virt;
        let mut offset = offset;
        'outer: loop {
            let mut pt = mem.cr3;
            let mut level: i32 = 39;
            while level >= 12 {
                let table = pt.host_addr();
                let mut ti = table_index(virt, level as u32);
                if level > 12 {
                    // SAFETY: pt designates a live table page rooted at cr3.
                    let entry = unsafe { pagetable::load_entry(table, ti) };
                    if !entry.valid() {
                        let fresh = match pagetable::allocate_page_table(&mut mem) {
                            Ok(fresh) => fresh,
                            Err(_) => {
                                eprintln!("mmap() crisis: ran out of page table memory");
                                std::process::exit(250);
                            }
                        };
                        // SAFETY: same table as the load above.
                        unsafe { pagetable::store_entry(table, ti, fresh) };
                        pt = fresh;
                    } else {
                        pt = entry;
                    }
                    level -= 9;
                    continue;
                }
                loop {
                    // SAFETY: pt designates the live leaf table for virt.
                    debug_assert!(!unsafe { pagetable::load_entry(table, ti) }.valid());
                    let mut entry = if flags.mapped() {
                        let real = if flags.mug() {
                            let mut mugsize = 4096.min(end - virt) as usize;
                            let (mugoff, mugskew);
                            if fd.is_some() {
                                mugskew = offset - (offset & !(pagesize - 1));
                                mugoff = offset & !(pagesize - 1);
                                mugsize += mugskew as usize;
                            } else {
                                mugoff = 0;
                                mugskew = 0;
                            }
                            let backing = match fd {
                                Some(fd) => Backing::File {
                                    fd,
                                    offset: mugoff,
                                    shared,
                                },
                                None => Backing::Anonymous { shared },
                            };
                            let mug = match arena_mmap::alloc_big(mugsize, prot, backing) {
                                Ok(mug) => mug,
                                Err(err) => {
                                    tracing::error!(
                                        virt,
                                        mugsize,
                                        error = &err as &dyn std::error::Error,
                                        "mug mmap crisis"
                                    );
                                    panic_due_to_mmap();
                                }
                            };
                            offset += 4096;
                            mug.as_ptr() as u64 + mugskew as u64
                        } else {
                            to_host(virt) as u64
                        };
                        flags.with_host_addr(real).with_valid(true)
                    } else {
                        flags.with_valid(true)
                    };
                    mem.vss += 1;
                    if self.has_linear_mapping() {
                        mem.rss += 1;
                    } else {
                        entry = entry.with_reserved_only(true);
                    }
                    if fd.is_some() && virt + 4096 >= end {
                        entry = entry.with_file_end(true);
                    }
                    // SAFETY: same leaf table as above; slot was empty.
                    unsafe { pagetable::store_entry(table, ti, entry) };
                    virt += 4096;
                    if virt >= end {
                        break 'outer;
                    }
                    ti += 1;
                    if ti == 512 {
                        break;
                    }
                }
                break;
            }
        }
        drop(mem);
        self.invalidate(true, false);
        Ok(())
    }

    /// Unmaps `[virt, virt+size)`, returning anonymous pages to the pool and
    /// issuing one host munmap per contiguous linear subrange.
    pub fn free_virtual(&self, virt: i64, size: i64) -> Result<(), Errno> {
        tracing::debug!(virt, size, "freeing virtual interval");
        if !is_valid_addr_size(virt, size) {
            return Err(Errno::EINVAL);
        }
        let mut mem = self.mem.lock();
        let mut ranges = Ranges::default();
        let mut mutated = false;
        let (mut vss_delta, mut rss_delta) = (0i64, 0i64);
        self.remove_virtual(
            &mut mem,
            virt,
            size,
            &mut ranges,
            &mut mutated,
            &mut vss_delta,
            &mut rss_delta,
        );
        let mut rc = Ok(());
        for r in &ranges.0 {
            // SAFETY: the subrange was mapped linearly by a prior reserve and
            // its page-table slots were just cleared.
            if let Err(err) =
                unsafe { arena_mmap::unmap(to_host(r.a).cast(), (r.b - r.a) as usize) }
            {
                tracing::error!(
                    a = r.a,
                    b = r.b,
                    error = &err as &dyn std::error::Error,
                    "failed to munmap linear subrange"
                );
                rc = Err(Errno::EINVAL);
            }
        }
        mem.vss += vss_delta;
        mem.rss += rss_delta;
        mem.memchurn += -vss_delta;
        mem.vss = mem.vss.max(0);
        mem.rss = mem.rss.max(0);
        drop(mem);
        self.invalidate(true, false);
        rc
    }

    /// Changes the guest protection of a fully mapped interval. The host is
    /// never given PROT_EXEC, and in linear mode a sub-host-page interval
    /// widens the host protection to read/write so neighboring guest pages
    /// sharing the host page stay usable; guest-level enforcement still
    /// happens through the page-table bits.
    pub fn protect_virtual(&self, virt: i64, size: i64, prot: i32) -> Result<(), Errno> {
        let pagesize = arena_mmap::page_size() as i64;
        if !is_valid_addr_size(virt, size) {
            return Err(Errno::EINVAL);
        }
        let mut mem = self.mem.lock();
        if !self.fully_mapped_inner(&mem, virt, size) {
            tracing::debug!(virt, size, "interval has unmapped pages");
            return Err(Errno::ENOMEM);
        }
        let key = set_protection(prot);
        let mut sysprot = host_prot(prot & !PROT_EXEC);
        if self.has_linear_mapping()
            && (virt & (pagesize - 1) != 0)
            && (size & (pagesize - 1) != 0)
        {
            sysprot = libc::PROT_READ | libc::PROT_WRITE;
        }
        let mut rc = Ok(());
        let mut ranges = Ranges::default();
        let end = virt + size;
        let mut virt = virt;
        'outer: loop {
            let mut pt = mem.cr3;
            let mut level: i32 = 39;
            while level >= 12 {
                let table = pt.host_addr();
                let mut ti = table_index(virt, level as u32);
                if level > 12 {
                    // SAFETY: pt designates a live table page rooted at cr3.
                    let entry = unsafe { pagetable::load_entry(table, ti) };
                    debug_assert!(entry.valid());
                    pt = entry;
                    level -= 9;
                    continue;
                }
                loop {
                    // SAFETY: pt designates the live leaf table for virt.
                    let entry = unsafe { pagetable::load_entry(table, ti) };
                    debug_assert!(entry.valid());
                    if self.has_linear_mapping() && entry.host() && entry.mapped() && !entry.mug()
                    {
                        ranges.add_page(virt, end);
                    } else if entry.host() && entry.mapped() && entry.mug() {
                        let real = entry.host_addr();
                        let base = real & !(pagesize as u64 - 1);
                        // SAFETY: the mug's host mapping covers this page.
                        if let Err(err) = unsafe {
                            arena_mmap::protect(base as *mut _, pagesize as usize, sysprot)
                        } {
                            tracing::error!(
                                virt,
                                error = &err as &dyn std::error::Error,
                                "mprotect of mug page failed"
                            );
                            if rc.is_ok() {
                                rc = Err(Errno::from_host_io(&err));
                            }
                        }
                    }
                    let entry = entry
                        .with_user(key.user())
                        .with_writable(key.writable())
                        .with_no_execute(key.no_execute());
                    // SAFETY: same leaf table as above.
                    unsafe { pagetable::store_entry(table, ti, entry) };
                    virt += 4096;
                    if virt >= end {
                        break 'outer;
                    }
                    ti += 1;
                    if ti == 512 {
                        break;
                    }
                }
                break;
            }
        }
        if self.has_linear_mapping() {
            for r in &ranges.0 {
                if r.a & (pagesize - 1) != 0 {
                    tracing::error!(a = r.a, b = r.b, "linear subrange not host-page aligned");
                } else if let Err(err) = unsafe {
                    // SAFETY: the subrange is linearly mapped guest memory.
                    arena_mmap::protect(to_host(r.a).cast(), (r.b - r.a) as usize, sysprot)
                } {
                    tracing::error!(
                        a = r.a,
                        b = r.b,
                        error = &err as &dyn std::error::Error,
                        "failed to mprotect linear subrange"
                    );
                    if rc.is_ok() {
                        rc = Err(Errno::from_host_io(&err));
                    }
                }
            }
        }
        drop(mem);
        self.invalidate(true, false);
        rc
    }

    /// Flushes file-backed pages in a fully mapped interval with msync,
    /// using the host's flag values.
    pub fn sync_virtual(&self, virt: i64, size: i64, sysflags: i32) -> Result<(), Errno> {
        if !is_valid_addr_size(virt, size) {
            return Err(Errno::EINVAL);
        }
        let pagesize = arena_mmap::page_size() as i64;
        let (mut virt, mut size) = (virt, size);
        if self.has_linear_mapping() {
            let skew = virt & (pagesize - 1);
            if skew != 0 {
                size += skew;
                virt -= skew;
            }
        }
        let mem = self.mem.lock();
        if !self.fully_mapped_inner(&mem, virt, size) {
            tracing::debug!(virt, size, "interval has unmapped pages");
            return Err(Errno::ENOMEM);
        }
        let mut rc = Ok(());
        let mut ranges = Ranges::default();
        let end = virt + size;
        let mut virt = virt;
        'outer: loop {
            let mut pt = mem.cr3;
            let mut level: i32 = 39;
            while level >= 12 {
                let table = pt.host_addr();
                let mut ti = table_index(virt, level as u32);
                if level > 12 {
                    // SAFETY: pt designates a live table page rooted at cr3.
                    let entry = unsafe { pagetable::load_entry(table, ti) };
                    debug_assert!(entry.valid());
                    pt = entry;
                    level -= 9;
                    continue;
                }
                loop {
                    // SAFETY: pt designates the live leaf table for virt.
                    let entry = unsafe { pagetable::load_entry(table, ti) };
                    debug_assert!(entry.valid());
                    if self.has_linear_mapping() && entry.host() && entry.mapped() && !entry.mug()
                    {
                        ranges.add_page(virt, end);
                    } else if entry.host() && entry.mapped() && entry.mug() {
                        let real = entry.host_addr();
                        let page = real & !(pagesize as u64 - 1);
                        let lilsize = (real - page) as i64 + 4096.min(end - virt);
                        // SAFETY: the mug's host mapping covers this span.
                        if let Err(err) = unsafe {
                            arena_mmap::sync_flush(page as *mut _, lilsize as usize, sysflags)
                        } {
                            tracing::error!(
                                virt,
                                error = &err as &dyn std::error::Error,
                                "msync of mug page failed"
                            );
                            if rc.is_ok() {
                                rc = Err(Errno::from_host_io(&err));
                            }
                        }
                    }
                    virt += 4096;
                    if virt >= end {
                        break 'outer;
                    }
                    ti += 1;
                    if ti == 512 {
                        break;
                    }
                }
                break;
            }
        }
        if self.has_linear_mapping() {
            for r in &ranges.0 {
                // SAFETY: the subrange is linearly mapped guest memory.
                if let Err(err) = unsafe {
                    arena_mmap::sync_flush(to_host(r.a).cast(), (r.b - r.a) as usize, sysflags)
                } {
                    tracing::error!(
                        a = r.a,
                        b = r.b,
                        error = &err as &dyn std::error::Error,
                        "failed to msync linear subrange"
                    );
                    if rc.is_ok() {
                        rc = Err(Errno::from_host_io(&err));
                    }
                }
            }
        }
        rc
    }

    /// Scans forward from `virt` for a hole of `size` bytes, skipping whole
    /// unpopulated subtrees per walk level and the precious window in linear
    /// mode. Returns `ENOMEM` when the scan runs off the canonical range.
    pub fn find_virtual(&self, virt: i64, size: i64) -> Result<i64, Errno> {
        let mem = self.mem.lock();
        if !mem.cr3.valid() {
            return Err(Errno::ENOMEM);
        }
        let mut virt = virt;
        'start: loop {
            if !is_valid_addr_size(virt, size) {
                tracing::debug!(virt, size, "no hole before the canonical boundary");
                return Err(Errno::ENOMEM);
            }
            if self.has_linear_mapping() && overlaps_precious(virt, size) {
                virt = PRECIOUS_END as i64 - SKEW;
            }
            let mut got: u64 = 0;
            loop {
                let mut pt = mem.cr3;
                let mut i = 39u32;
                let entry = loop {
                    // SAFETY: pt designates a live table page rooted at cr3.
                    let entry =
                        unsafe { pagetable::load_entry(pt.host_addr(), table_index(virt + got as i64, i)) };
                    if i == 12 || !entry.valid() {
                        break entry;
                    }
                    pt = entry;
                    i -= 9;
                };
                got += 1u64 << i;
                if entry.valid() {
                    virt += got as i64;
                    continue 'start;
                }
                if got >= size as u64 {
                    return Ok(virt);
                }
            }
        }
    }

    /// True when every page of the interval has a valid leaf.
    pub fn is_fully_mapped(&self, virt: i64, size: i64) -> bool {
        let mem = self.mem.lock();
        self.fully_mapped_inner(&mem, virt, size)
    }

    fn fully_mapped_inner(&self, mem: &MemState, virt: i64, size: i64) -> bool {
        if size <= 0 {
            return true;
        }
        if !mem.cr3.valid() {
            return false;
        }
        let end = virt + size;
        let mut virt = virt;
        loop {
            let mut pt = mem.cr3;
            let mut level: i32 = 39;
            while level >= 12 {
                let table = pt.host_addr();
                let mut ti = table_index(virt, level as u32);
                if level > 12 {
                    // SAFETY: pt designates a live table page rooted at cr3.
                    let entry = unsafe { pagetable::load_entry(table, ti) };
                    if !entry.valid() {
                        return false;
                    }
                    pt = entry;
                    level -= 9;
                    continue;
                }
                loop {
                    // SAFETY: pt designates the live leaf table for virt.
                    let entry = unsafe { pagetable::load_entry(table, ti) };
                    if !entry.valid() {
                        return false;
                    }
                    virt += 4096;
                    if virt >= end {
                        return true;
                    }
                    ti += 1;
                    if ti == 512 {
                        break;
                    }
                }
                break;
            }
        }
    }

    /// True when no page of the interval has a valid leaf. In linear mode an
    /// interval overlapping the precious window is never considered free.
    pub fn is_fully_unmapped(&self, virt: i64, size: i64) -> bool {
        let mem = self.mem.lock();
        self.fully_unmapped_inner(&mem, virt, size)
    }

    fn fully_unmapped_inner(&self, mem: &MemState, virt: i64, size: i64) -> bool {
        if self.has_linear_mapping() && overlaps_precious(virt, size) {
            return false;
        }
        if !mem.cr3.valid() {
            return true;
        }
        let end = virt + size;
        let mut virt = virt;
        while virt < end {
            let mut pt = mem.cr3;
            let mut i = 39u32;
            let step = loop {
                // SAFETY: pt designates a live table page rooted at cr3.
                let entry = unsafe { pagetable::load_entry(pt.host_addr(), table_index(virt, i)) };
                if !entry.valid() {
                    break 1u64 << i;
                }
                if i == 12 {
                    return false;
                }
                pt = entry;
                i -= 9;
            };
            virt += step as i64;
        }
        true
    }
}

/// Releases one leaf's backing. Anonymous pool pages are scrubbed and given
/// back, mug pages are unmapped individually, reserved-only leaves just drop
/// their tally. Returns true for linear leaves, whose host unmap is batched
/// by the caller.
fn free_page(
    mem: &mut MemState,
    entry: PageEntry,
    size: i64,
    mutated: &mut bool,
    rss_delta: &mut i64,
) -> bool {
    debug_assert!(entry.valid());
    let tally = |mem: &mut MemState| {
        if entry.reserved_only() {
            mem.memstat.reserved -= 1;
        } else {
            mem.memstat.committed -= 1;
        }
    };
    match (entry.host(), entry.mapped(), entry.mug()) {
        (true, false, false) => {
            debug_assert!(!entry.reserved_only());
            mem.memstat.freed += 1;
            mem.memstat.committed -= 1;
            // SAFETY: the caller is about to clear the leaf, so nothing
            // references the page; give() scrubs it.
            unsafe {
                arena_mmap::pool::give(
                    std::ptr::NonNull::new(entry.host_addr() as *mut u8).unwrap(),
                )
            };
            *mutated = true;
            *rss_delta -= 1;
            false
        }
        (true, true, true) => {
            tally(mem);
            let pagesize = arena_mmap::page_size() as u64;
            let real = entry.host_addr();
            let mug = real & !(pagesize - 1);
            // SAFETY: the mug mapping was created for this leaf alone and its
            // slot is about to be cleared.
            unsafe {
                arena_mmap::unmap(mug as *mut _, (real - mug) as usize + size as usize)
                    .expect("munmap of mug page should not fail");
            }
            *mutated = true;
            if !entry.reserved_only() {
                *rss_delta -= 1;
            }
            false
        }
        (true, true, false) => {
            tally(mem);
            if !entry.reserved_only() {
                *rss_delta -= 1;
            }
            true
        }
        _ => {
            if entry.reserved_only() {
                mem.memstat.reserved -= 1;
            } else {
                debug_assert!(entry.host_addr() < crate::system::REAL_SIZE as u64);
            }
            false
        }
    }
}

const _: () = assert!(GUEST_PAGE_SIZE == 4096);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::SystemOptions;

    fn nolinear_system() -> std::sync::Arc<System> {
        System::new(
            CpuMode::Long,
            SystemOptions {
                nolinear: true,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn interval_validation() {
        assert!(is_valid_addr_size(0x1000, 0x1000));
        assert!(is_valid_addr_size(-0x8000_0000_0000, 0x1_0000_0000_0000));
        assert!(!is_valid_addr_size(0x1000, 0));
        assert!(!is_valid_addr_size(0x1001, 0x1000));
        assert!(!is_valid_addr_size(0x7fff_ffff_f000, 0x2000));
        assert!(!is_valid_addr_size(0x8000_0000_0000, 0x1000));
    }

    #[test]
    fn precious_overlap_detection() {
        let start = PRECIOUS_START as i64 - SKEW;
        assert!(overlaps_precious(start, 0x2000));
        assert!(overlaps_precious(start - 0x1000, 0x3000));
        assert!(!overlaps_precious(0x1000, 0x1000));
        assert!(!overlaps_precious(start - 0x2000, 0x1000));
        assert!(!overlaps_precious(start, -1));
    }

    #[test]
    fn reserve_then_free_round_trips() {
        let s = nolinear_system();
        let key = set_protection(PROT_READ | PROT_WRITE);
        s.reserve_virtual(0x30_0000, 0x4000, key, None, 0, false).unwrap();
        assert!(s.is_fully_mapped(0x30_0000, 0x4000));
        assert!(!s.is_fully_unmapped(0x30_0000, 0x4000));
        assert_eq!(s.vss(), 4);

        s.free_virtual(0x30_0000, 0x4000).unwrap();
        assert!(s.is_fully_unmapped(0x30_0000, 0x4000));
        assert!(!s.is_fully_mapped(0x30_0000, 0x4000));
        assert_eq!(s.vss(), 0);
    }

    #[test]
    fn reserve_is_idempotent_without_leaking() {
        let s = nolinear_system();
        let key = set_protection(PROT_READ | PROT_WRITE);
        s.reserve_virtual(0x40_0000, 0x8000, key, None, 0, false).unwrap();
        let vss = s.vss();
        let rss = s.rss();
        s.reserve_virtual(0x40_0000, 0x8000, key, None, 0, false).unwrap();
        assert_eq!(s.vss(), vss);
        assert_eq!(s.rss(), rss);
        s.free_virtual(0x40_0000, 0x8000).unwrap();
    }

    #[test]
    fn partial_overlap_recreates_only_the_overlap() {
        let s = nolinear_system();
        let key = set_protection(PROT_READ | PROT_WRITE);
        // 256 KiB, free the middle 64 KiB, remap 128 KiB overlapping the hole.
        s.reserve_virtual(0x10_0000, 0x4_0000, key, None, 0, false).unwrap();
        assert_eq!(s.vss(), 64);
        s.free_virtual(0x11_0000, 0x1_0000).unwrap();
        assert_eq!(s.vss(), 48);
        s.reserve_virtual(0x10_8000, 0x2_0000, key, None, 0, false).unwrap();
        // 64 original - 16 freed + 32 remapped - 16 already counted overlap.
        assert_eq!(s.vss(), 64 - 16 + 32 - 16);
        assert!(s.is_fully_mapped(0x10_0000, 0x2_8000));
        s.free_virtual(0x10_0000, 0x4_0000).unwrap();
    }

    #[test]
    fn protect_updates_leaf_keys() {
        let s = nolinear_system();
        let key = set_protection(PROT_READ | PROT_WRITE);
        s.reserve_virtual(0x50_0000, 0x3000, key, None, 0, false).unwrap();
        s.protect_virtual(0x50_0000, 0x3000, PROT_READ).unwrap();
        let mem = s.mem.lock();
        let mut virt = 0x50_0000i64;
        while virt < 0x50_3000 {
            let mut pt = mem.cr3;
            for level in [39u32, 30, 21, 12] {
                // SAFETY: walking live tables under the lock.
                pt = unsafe { pagetable::load_entry(pt.host_addr(), table_index(virt, level)) };
            }
            assert!(pt.user());
            assert!(!pt.writable());
            assert!(pt.no_execute());
            virt += 4096;
        }
        drop(mem);
        s.free_virtual(0x50_0000, 0x3000).unwrap();
    }

    #[test]
    fn protect_requires_full_mapping() {
        let s = nolinear_system();
        let key = set_protection(PROT_READ | PROT_WRITE);
        s.reserve_virtual(0x60_0000, 0x2000, key, None, 0, false).unwrap();
        assert_eq!(
            s.protect_virtual(0x60_0000, 0x4000, PROT_READ),
            Err(Errno::ENOMEM)
        );
        s.free_virtual(0x60_0000, 0x2000).unwrap();
    }

    #[test]
    fn find_virtual_skips_populated_subtrees() {
        let s = nolinear_system();
        let key = set_protection(PROT_READ | PROT_WRITE);
        s.reserve_virtual(0x70_0000, 0x2000, key, None, 0, false).unwrap();
        let hole = s.find_virtual(0x70_0000, 0x4000).unwrap();
        assert!(hole >= 0x70_2000);
        assert!(s.is_fully_unmapped(hole, 0x4000));
        s.free_virtual(0x70_0000, 0x2000).unwrap();
    }

    #[test]
    fn find_virtual_gives_up_at_the_boundary() {
        let s = nolinear_system();
        assert_eq!(
            s.find_virtual(0x7fff_ffff_f000, 0x10_0000),
            Err(Errno::ENOMEM)
        );
    }

    #[test]
    fn invalid_intervals_are_rejected() {
        let s = nolinear_system();
        let key = set_protection(PROT_READ);
        assert_eq!(
            s.reserve_virtual(0x123, 0x1000, key, None, 0, false),
            Err(Errno::EINVAL)
        );
        assert_eq!(s.free_virtual(0x1000, 0), Err(Errno::EINVAL));
        assert_eq!(s.free_virtual(0x1000, -4096), Err(Errno::EINVAL));
    }

    #[test]
    fn cleanse_collapses_empty_tables() {
        let s = nolinear_system();
        let key = set_protection(PROT_READ | PROT_WRITE);
        s.reserve_virtual(0x7000_0000, 0x10_000, key, None, 0, false).unwrap();
        let tables_before = s.memstat().pagetables;
        assert!(tables_before > 1);
        s.free_virtual(0x7000_0000, 0x10_000).unwrap();
        s.cleanse_memory();
        // Only the root can remain.
        assert_eq!(s.memstat().pagetables, 1);
        assert!(tables_before > s.memstat().pagetables);
    }
}
