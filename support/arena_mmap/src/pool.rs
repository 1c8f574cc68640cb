// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A process-global recycling pool of 4 KiB guest pages.
//!
//! Pages are interchangeable: a returned page is zero-filled and handed to
//! the next taker, which keeps hot pages in cache and amortizes the host
//! mmap cost over [`BATCH`]-page refills. Pages never go back to the host
//! kernel; the pool outlives any single guest process image.

use crate::Backing;
use crate::Error;
use crate::GUEST_PAGE_SIZE;
use parking_lot::Mutex;
use std::ptr::NonNull;

/// How many pages one arena refill carves out.
pub const BATCH: usize = 64;

static FREE_PAGES: Mutex<Vec<usize>> = Mutex::new(Vec::new());

/// A 4 KiB host page owned by the caller until [`give`]n back.
#[derive(Debug)]
pub struct PoolPage {
    /// Host address of the page, 4 KiB aligned, zero-filled.
    pub addr: NonNull<u8>,
    /// True when the page came off the free list rather than a fresh refill.
    ///
    /// A fresh page implies the pool just charged the arena for [`BATCH`]
    /// pages and put `BATCH - 1` of them on the free list; callers keeping
    /// allocation statistics need to know which case happened.
    pub reclaimed: bool,
}

// SAFETY: the page is exclusively owned memory; the pointer is freely
// transferable across threads.
unsafe impl Send for PoolPage {}

/// Takes one zero-filled page from the pool, refilling from the arena when
/// the free list is empty.
pub fn take() -> Result<PoolPage, Error> {
    if let Some(addr) = FREE_PAGES.lock().pop() {
        return Ok(PoolPage {
            addr: NonNull::new(addr as *mut u8).unwrap(),
            reclaimed: true,
        });
    }
    let base = crate::alloc_big(
        BATCH * GUEST_PAGE_SIZE,
        libc::PROT_READ | libc::PROT_WRITE,
        Backing::Anonymous { shared: false },
    )?;
    let base = base.as_ptr() as usize;
    let mut free = FREE_PAGES.lock();
    for i in 1..BATCH {
        free.push(base + i * GUEST_PAGE_SIZE);
    }
    Ok(PoolPage {
        addr: NonNull::new(base as *mut u8).unwrap(),
        reclaimed: false,
    })
}

/// Zero-fills a page and pushes it back onto the free list.
///
/// # Safety
///
/// `page` must have come from [`take`], must be writable, and must no longer
/// be referenced by any page-table entry.
pub unsafe fn give(page: NonNull<u8>) {
    // SAFETY: guaranteed by caller.
    unsafe {
        std::ptr::write_bytes(page.as_ptr(), 0, GUEST_PAGE_SIZE);
    }
    FREE_PAGES.lock().push(page.as_ptr() as usize);
}

/// Number of pages currently sitting on the free list.
pub fn free_count() -> usize {
    FREE_PAGES.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_aligned_and_zeroed() {
        let page = take().unwrap();
        assert_eq!(page.addr.as_ptr() as usize % GUEST_PAGE_SIZE, 0);
        // SAFETY: we own the page.
        let bytes =
            unsafe { std::slice::from_raw_parts(page.addr.as_ptr(), GUEST_PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        // SAFETY: nothing references the page.
        unsafe { give(page.addr) };
    }

    #[test]
    fn recycling_scrubs_guest_data() {
        let page = take().unwrap();
        let dirtied = page.addr;
        // SAFETY: we own the page.
        unsafe {
            std::ptr::write_bytes(page.addr.as_ptr(), 0x5a, GUEST_PAGE_SIZE);
            give(page.addr);
        }
        // Every page handed out must be zero-filled, whether it is the one
        // just dirtied (scrubbed by give) or a fresh arena page. Stop early
        // once the dirtied page cycles back.
        let mut held = Vec::new();
        for _ in 0..BATCH {
            let again = take().unwrap();
            // SAFETY: we own the page.
            let bytes =
                unsafe { std::slice::from_raw_parts(again.addr.as_ptr(), GUEST_PAGE_SIZE) };
            assert!(bytes.iter().all(|&b| b == 0));
            let found = again.addr == dirtied;
            held.push(again.addr);
            if found {
                break;
            }
        }
        for addr in held {
            // SAFETY: nothing references these pages.
            unsafe { give(addr) };
        }
    }

    #[test]
    fn refill_populates_the_free_list() {
        // Keep taking pages until the free list runs dry and a refill hands
        // out a fresh one, then verify every held page is distinct.
        let mut held = vec![take().unwrap()];
        while held.last().unwrap().reclaimed {
            held.push(take().unwrap());
            assert!(held.len() <= 16 * BATCH, "pool never refilled");
        }
        held.sort_by_key(|p| p.addr.as_ptr() as usize);
        for w in held.windows(2) {
            assert!(
                w[0].addr.as_ptr() as usize + GUEST_PAGE_SIZE <= w[1].addr.as_ptr() as usize
            );
        }
        for p in held {
            // SAFETY: nothing references these pages.
            unsafe { give(p.addr) };
        }
    }
}
