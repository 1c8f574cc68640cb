// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host mapping primitives for the emulator.
//!
//! Guest-visible memory must live at host addresses that emitted code can
//! reach with displacement-limited x86/arm addressing, so all big allocations
//! are carved out of a compile-time window (`PRECIOUS_START..PRECIOUS_END`)
//! reserved away from the host libc heap. The arena cursor is advanced with a
//! fetch-add and each region is demand-mapped at exactly the reserved address;
//! a host that refuses the address simply moves the cursor forward.
//!
//! The [`pool`] module recycles 4 KiB pages carved from the arena.

// UNSAFETY: Manual pointer manipulation and mmap management.
#![expect(unsafe_code)]
#![cfg(unix)]

pub mod pool;

use pal::unix::SyscallResult;
use std::ffi::c_void;
use std::io;
use std::os::unix::prelude::*;
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// The page granularity of the guest, independent of the host page size.
pub const GUEST_PAGE_SIZE: usize = 4096;

/// First byte of the reserved host address window.
///
/// Chosen to be far above any plausible image base or brk()-style heap while
/// staying inside the 47-bit user address space every supported host grants.
pub const PRECIOUS_START: usize = 0x2000_0000_0000;

/// One past the last byte of the reserved host address window.
pub const PRECIOUS_END: usize = 0x2200_0000_0000;

static ARENA_BRK: AtomicUsize = AtomicUsize::new(0);

/// Errors returned by [`alloc_big`] and [`pool::take`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The arena cursor crossed `PRECIOUS_END`.
    #[error("host address arena exhausted ({PRECIOUS_START:#x}..{PRECIOUS_END:#x})")]
    Exhausted,
    /// The host refused a mapping for a reason other than address collision.
    #[error("host mapping failed")]
    Host(#[source] io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Host(err)
    }
}

impl Error {
    /// True when the failure was the host declining the demanded address.
    pub fn is_denied(&self) -> bool {
        matches!(self, Error::Host(e) if e.raw_os_error() == Some(libc::EEXIST))
    }
}

/// Returns the host page size, which may exceed [`GUEST_PAGE_SIZE`].
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let s = PAGE_SIZE.load(Ordering::Relaxed);
    if s != 0 {
        s
    } else {
        // SAFETY: sysconf has no preconditions.
        let s = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        PAGE_SIZE.store(s, Ordering::Relaxed);
        s
    }
}

/// Rounds `n` up to the host page size.
pub fn round_up_to_page(n: usize) -> usize {
    let z = page_size();
    n.div_ceil(z) * z
}

/// What a mapping is backed by.
#[derive(Copy, Clone, Debug)]
pub enum Backing<'a> {
    /// Zero-filled memory.
    Anonymous {
        /// Share modifications across forks.
        shared: bool,
    },
    /// A host file at `offset`, which must be host-page aligned.
    File {
        /// The host descriptor to map.
        fd: BorrowedFd<'a>,
        /// Byte offset into the file.
        offset: i64,
        /// MAP_SHARED versus MAP_PRIVATE.
        shared: bool,
    },
}

impl Backing<'_> {
    fn flags_fd_offset(&self) -> (i32, i32, i64) {
        match *self {
            Backing::Anonymous { shared } => (
                libc::MAP_ANONYMOUS | if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE },
                -1,
                0,
            ),
            Backing::File { fd, offset, shared } => (
                if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE },
                fd.as_raw_fd(),
                offset,
            ),
        }
    }
}

unsafe fn mmap(
    addr: *mut c_void,
    len: usize,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: i64,
) -> io::Result<*mut c_void> {
    // SAFETY: guaranteed by caller.
    let address = unsafe { libc::mmap(addr, len, prot, flags, fd, offset) };
    if address == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(address)
}

/// Unmaps a region previously produced by this module or by [`map_fixed`].
///
/// # Safety
///
/// The range must be owned by the caller and no longer referenced.
pub unsafe fn unmap(addr: *mut c_void, len: usize) -> io::Result<()> {
    // SAFETY: guaranteed by caller.
    unsafe { libc::munmap(addr, len) }.syscall_result()?;
    Ok(())
}

/// Changes the host protection of a mapped range.
///
/// # Safety
///
/// The range must be mapped and owned by the caller.
pub unsafe fn protect(addr: *mut c_void, len: usize, prot: i32) -> io::Result<()> {
    // SAFETY: guaranteed by caller.
    unsafe { libc::mprotect(addr, len, prot) }.syscall_result()?;
    Ok(())
}

/// Flushes a file-backed range with msync.
///
/// # Safety
///
/// The range must be mapped and owned by the caller.
pub unsafe fn sync_flush(addr: *mut c_void, len: usize, flags: i32) -> io::Result<()> {
    // SAFETY: guaranteed by caller.
    unsafe { libc::msync(addr, len, flags) }.syscall_result()?;
    Ok(())
}

/// Maps `backing` at exactly `addr`, failing with `EEXIST` if the host
/// already has anything mapped there.
///
/// # Safety
///
/// `addr..addr+len` must not be owned by any live Rust object; `backing`'s
/// descriptor must remain valid for the mapping.
pub unsafe fn map_demand(
    addr: *mut c_void,
    len: usize,
    prot: i32,
    backing: Backing<'_>,
) -> Result<*mut c_void, Error> {
    let (flags, fd, offset) = backing.flags_fd_offset();
    #[cfg(target_os = "linux")]
    let flags = flags | libc::MAP_FIXED_NOREPLACE;
    // On hosts without MAP_FIXED_NOREPLACE the address is a plain hint; the
    // mismatch check below provides the same all-or-nothing behavior.
    // SAFETY: guaranteed by caller.
    let got = unsafe { mmap(addr, len, prot, flags, fd, offset) }?;
    if got != addr {
        // Kernels that predate MAP_FIXED_NOREPLACE also land here.
        // SAFETY: unmapping the region we just created.
        unsafe { unmap(got, len) }?;
        return Err(Error::Host(io::Error::from_raw_os_error(libc::EEXIST)));
    }
    Ok(got)
}

/// Maps `backing` at exactly `addr`, atomically replacing whatever the host
/// had there.
///
/// # Safety
///
/// Anything previously mapped in `addr..addr+len` is destroyed; the caller
/// must own that range.
pub unsafe fn map_fixed(
    addr: *mut c_void,
    len: usize,
    prot: i32,
    backing: Backing<'_>,
) -> Result<*mut c_void, Error> {
    let (flags, fd, offset) = backing.flags_fd_offset();
    // SAFETY: guaranteed by caller.
    Ok(unsafe { mmap(addr, len, prot, flags | libc::MAP_FIXED, fd, offset) }?)
}

/// Allocates a host-page rounded region inside the precious window.
///
/// The cursor starts at [`PRECIOUS_START`] on first use and only moves
/// forward; freed regions are not reused (page recycling happens at 4 KiB
/// granularity in [`pool`]).
pub fn alloc_big(len: usize, prot: i32, backing: Backing<'_>) -> Result<NonNull<c_void>, Error> {
    if cfg!(target_os = "emscripten") {
        // This host cannot honor address demands at all; take what it gives.
        let (flags, fd, offset) = backing.flags_fd_offset();
        // SAFETY: a fresh anywhere-mapping aliases nothing.
        let p = unsafe { mmap(std::ptr::null_mut(), len, prot, flags, fd, offset) }?;
        return Ok(NonNull::new(p).unwrap());
    }
    let _ = ARENA_BRK.compare_exchange(0, PRECIOUS_START, Ordering::Relaxed, Ordering::Relaxed);
    let m = round_up_to_page(len);
    loop {
        let brk = ARENA_BRK.fetch_add(m, Ordering::Relaxed);
        if brk + m > PRECIOUS_END {
            return Err(Error::Exhausted);
        }
        // SAFETY: the cursor region was reserved by the fetch-add above and
        // is not owned by any Rust object.
        match unsafe { map_demand(brk as *mut c_void, len, prot, backing) } {
            Ok(p) => return Ok(NonNull::new(p).unwrap()),
            Err(err) if err.is_denied() => {
                tracing::debug!(addr = brk, len, "host denied arena address, advancing");
            }
            Err(err) => return Err(err),
        }
    }
}

/// Returns a region obtained from [`alloc_big`] to the host.
///
/// # Safety
///
/// `ptr..ptr+len` must come from [`alloc_big`] and must no longer be
/// referenced by any page-table entry.
pub unsafe fn free_big(ptr: NonNull<c_void>, len: usize) {
    // SAFETY: guaranteed by caller.
    unsafe { unmap(ptr.as_ptr(), len) }.expect("unmap of arena region should not fail");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        let z = page_size();
        assert!(z >= GUEST_PAGE_SIZE);
        assert!(z.is_power_of_two());
        assert_eq!(round_up_to_page(1), z);
        assert_eq!(round_up_to_page(z), z);
        assert_eq!(round_up_to_page(z + 1), 2 * z);
    }

    #[test]
    fn big_allocations_land_in_the_window() {
        let p = alloc_big(
            3 * GUEST_PAGE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            Backing::Anonymous { shared: false },
        )
        .unwrap();
        let addr = p.as_ptr() as usize;
        assert!(addr >= PRECIOUS_START && addr < PRECIOUS_END);
        assert_eq!(addr % page_size(), 0);
        // The region must actually be writable.
        // SAFETY: freshly mapped read/write region.
        unsafe {
            p.as_ptr().cast::<u8>().write(0xcc);
            free_big(p, 3 * GUEST_PAGE_SIZE);
        }
    }

    #[test]
    fn consecutive_allocations_do_not_overlap() {
        let a = alloc_big(
            GUEST_PAGE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            Backing::Anonymous { shared: false },
        )
        .unwrap();
        let b = alloc_big(
            GUEST_PAGE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            Backing::Anonymous { shared: false },
        )
        .unwrap();
        let (a0, b0) = (a.as_ptr() as usize, b.as_ptr() as usize);
        let z = page_size();
        assert!(a0 + z <= b0 || b0 + z <= a0);
        // SAFETY: regions were just allocated here.
        unsafe {
            free_big(a, GUEST_PAGE_SIZE);
            free_big(b, GUEST_PAGE_SIZE);
        }
    }
}
