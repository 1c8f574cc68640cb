// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Emulator-side access to guest virtual memory.
//!
//! These are the paths the instruction loop and the syscall shims use to
//! touch guest memory: translate an address through the page table, honoring
//! the guest-visible protection bits, and committing reserved-only pages on
//! first access. Host protections may be wider than guest protections (a
//! sub-host-page mprotect widens them), which is why enforcement happens
//! here and not in hardware.

use crate::pagetable;
use crate::pagetable::table_index;
use crate::system::CpuMode;
use crate::system::MemState;
use crate::system::System;
use crate::system::REAL_SIZE;
use linuxdefs::Errno;
use std::ffi::CString;

/// Maximum guest string the emulator will pull in one load, NUL included.
const PATH_MAX: usize = 4096;

/// The access a guest memory operation needs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl System {
    /// Resolves the page containing `virt` to its host page base, committing
    /// a reserved-only leaf on first touch.
    fn find_page(
        &self,
        mem: &mut MemState,
        virt: i64,
        access: Access,
    ) -> Result<*mut u8, Errno> {
        let page_virt = virt & !4095;
        if self.mode() != CpuMode::Long {
            // Real and legacy modes address the flat buffer directly.
            if (0..REAL_SIZE as i64).contains(&virt) {
                let real = mem.real.as_ref().ok_or(Errno::EFAULT)?;
                // SAFETY: page_virt is within the REAL_SIZE buffer.
                return Ok(unsafe { real.as_ptr().add(page_virt as usize) });
            }
            return Err(Errno::EFAULT);
        }
        let mut pt = mem.cr3;
        if !pt.valid() {
            return Err(Errno::EFAULT);
        }
        let mut level = 39u32;
        let (table, ti) = loop {
            let table = pt.host_addr();
            let ti = table_index(page_virt, level);
            if level == 12 {
                break (table, ti);
            }
            // SAFETY: pt designates a live table page rooted at cr3.
            let entry = unsafe { pagetable::load_entry(table, ti) };
            if !entry.valid() {
                return Err(Errno::EFAULT);
            }
            pt = entry;
            level -= 9;
        };
        // SAFETY: table is the live leaf table for page_virt.
        let mut entry = unsafe { pagetable::load_entry(table, ti) };
        if !entry.valid() {
            return Err(Errno::EFAULT);
        }
        if entry.reserved_only() {
            if entry.host() {
                // A mug page was mapped at reservation; it becomes resident
                // on first touch.
                entry = entry.with_reserved_only(false);
                mem.memstat.reserved -= 1;
                mem.memstat.committed += 1;
                mem.rss += 1;
            } else {
                let fresh = pagetable::allocate_page(mem)?;
                mem.memstat.reserved -= 1;
                entry = fresh
                    .with_user(entry.user())
                    .with_writable(entry.writable())
                    .with_no_execute(entry.no_execute())
                    .with_file_end(entry.file_end());
            }
            // SAFETY: same leaf table as above.
            unsafe { pagetable::store_entry(table, ti, entry) };
        }
        let permitted = match access {
            Access::Read => entry.user(),
            Access::Write => entry.user() && entry.writable(),
        };
        if !permitted {
            return Err(Errno::EFAULT);
        }
        if entry.host() {
            Ok(entry.host_addr() as *mut u8)
        } else {
            // A real-mode-shaped entry in a long-mode table.
            Err(Errno::EFAULT)
        }
    }

    /// Translates `virt` for `access`, returning the host address backing
    /// it.
    pub fn translate(&self, virt: i64, access: Access) -> Result<*mut u8, Errno> {
        let mut mem = self.mem.lock();
        let base = self.find_page(&mut mem, virt, access)?;
        // SAFETY: the offset stays within the resolved page.
        Ok(unsafe { base.add((virt & 4095) as usize) })
    }

    /// Probes whether `[virt, virt+size)` supports `access` without copying.
    pub fn is_valid_memory(&self, virt: i64, size: i64, access: Access) -> bool {
        if size < 0 {
            return false;
        }
        let mut mem = self.mem.lock();
        let mut virt = virt;
        let end = virt + size;
        while virt < end {
            if self.find_page(&mut mem, virt, access).is_err() {
                return false;
            }
            virt = (virt & !4095) + 4096;
        }
        true
    }

    /// Copies `data` into guest memory at `virt`, failing with `EFAULT` on
    /// any unmapped or write-protected page.
    pub fn copy_to_guest(&self, virt: i64, data: &[u8]) -> Result<(), Errno> {
        let mut mem = self.mem.lock();
        let mut virt = virt;
        let mut data = data;
        while !data.is_empty() {
            let base = self.find_page(&mut mem, virt, Access::Write)?;
            let off = (virt & 4095) as usize;
            let n = data.len().min(4096 - off);
            // SAFETY: find_page returned a committed, writable host page and
            // n stays within it.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(off), n) };
            virt += n as i64;
            data = &data[n..];
        }
        Ok(())
    }

    /// Fills `buf` from guest memory at `virt`.
    pub fn copy_from_guest(&self, buf: &mut [u8], virt: i64) -> Result<(), Errno> {
        let mut mem = self.mem.lock();
        let mut virt = virt;
        let mut buf = &mut buf[..];
        while !buf.is_empty() {
            let base = self.find_page(&mut mem, virt, Access::Read)?;
            let off = (virt & 4095) as usize;
            let n = buf.len().min(4096 - off);
            // SAFETY: find_page returned a committed, readable host page and
            // n stays within it.
            unsafe { std::ptr::copy_nonoverlapping(base.add(off), buf.as_mut_ptr(), n) };
            virt += n as i64;
            buf = &mut buf[n..];
        }
        Ok(())
    }

    /// Loads a NUL-terminated guest string, capped at `PATH_MAX`.
    pub fn load_str(&self, virt: i64) -> Result<CString, Errno> {
        let mut mem = self.mem.lock();
        let mut bytes = Vec::new();
        let mut virt = virt;
        while bytes.len() < PATH_MAX {
            let base = self.find_page(&mut mem, virt, Access::Read)?;
            let off = (virt & 4095) as usize;
            let n = (4096 - off).min(PATH_MAX - bytes.len());
            // SAFETY: find_page returned a committed, readable host page and
            // n stays within it.
            let chunk = unsafe { std::slice::from_raw_parts(base.add(off), n) };
            match chunk.iter().position(|&b| b == 0) {
                Some(p) => {
                    bytes.extend_from_slice(&chunk[..p]);
                    return Ok(CString::new(bytes).unwrap());
                }
                None => {
                    bytes.extend_from_slice(chunk);
                    virt += n as i64;
                }
            }
        }
        Err(Errno::ENAMETOOLONG)
    }
}
