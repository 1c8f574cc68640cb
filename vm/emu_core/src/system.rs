// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process-wide guest state and thread lifecycle.

use crate::fd::Fds;
use crate::machine::Machine;
use crate::machine::MachineShared;
use crate::pagetable;
use crate::pagetable::PageEntry;
use linuxdefs::limits::Rlimit;
use linuxdefs::limits::RLIMIT_AS;
use linuxdefs::limits::RLIM_NLIMITS;
use linuxdefs::signal;
use linuxdefs::signal::SigAction;
use linuxdefs::Errno;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::alloc::Layout;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Once;

/// Bytes of guest virtual address space (2^48).
pub const MAX_VIRTUAL: i64 = 0x1_0000_0000_0000;

/// Default resident-set ceiling, clamped further by `RLIMIT_AS`.
pub const DEFAULT_MAX_RESIDENT: i64 = 0x1_0000_0000;

/// Where automatic placement of unhinted mappings begins.
pub const AUTOMAP_START: i64 = 0x1000_0000_0000;

/// Guest virtual to host address offset in linear mode.
pub const SKEW: i64 = 0;

/// Lowest thread id handed to cloned guest threads.
pub const MIN_THREAD_ID: u32 = 300;

/// Size of the cloned-thread id space; must be a power of two so ids can be
/// masked rather than divided.
pub const MAX_THREAD_IDS: u32 = 0x8000;
const _: () = assert!(MAX_THREAD_IDS.is_power_of_two());

/// Bytes of directly addressed memory in real mode (1 MiB plus the HMA).
pub const REAL_SIZE: usize = 0x11_0000;

/// Guest virtual address to the host address backing it in linear mode.
pub fn to_host(virt: i64) -> *mut u8 {
    (virt.wrapping_add(SKEW)) as usize as *mut u8
}

/// Host address back to the guest virtual address it backs in linear mode.
pub fn to_guest(host: *mut u8) -> i64 {
    (host as usize as i64).wrapping_sub(SKEW)
}

/// The CPU mode a [`System`] is created in, fixed for its lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CpuMode {
    /// 16-bit, directly addressed real-mode buffer, no page table.
    Real,
    /// 32-bit protected mode.
    Legacy,
    /// 64-bit long mode with the four-level page table.
    Long,
}

/// Page accounting counters, all in 4 KiB pages.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemStat {
    pub allocated: i64,
    pub committed: i64,
    pub reserved: i64,
    pub freed: i64,
    pub reclaimed: i64,
    pub pagetables: i64,
}

/// The page-aligned buffer backing real-mode addressing.
pub(crate) struct RealMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is plain exclusively-owned memory.
unsafe impl Send for RealMemory {}

impl RealMemory {
    fn new(len: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(len, 4096).unwrap();
        // SAFETY: layout has nonzero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        Ok(RealMemory { ptr, layout })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for RealMemory {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in new.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Everything guarded by the address-space lock.
pub(crate) struct MemState {
    /// Root of the page table, entry-encoded (valid only in long mode).
    pub cr3: PageEntry,
    pub real: Option<RealMemory>,
    /// Leaves with the valid bit set.
    pub vss: i64,
    /// Committed leaves.
    pub rss: i64,
    /// Unmap traffic since the last page-table collapse.
    pub memchurn: i64,
    pub memstat: MemStat,
    /// Placement hint for the next unhinted mapping.
    pub automap: i64,
}

/// Guest signal dispositions, guarded by the signal lock.
pub(crate) struct SigState {
    pub hands: [SigAction; signal::NSIG as usize],
}

/// Construction-time knobs for [`System::new`].
#[derive(Copy, Clone, Debug)]
pub struct SystemOptions {
    /// Disable the linear mapping even in long mode, forcing pool and mug
    /// pages for everything.
    pub nolinear: bool,
    /// Resident-set ceiling in bytes.
    pub max_resident: i64,
}

impl Default for SystemOptions {
    fn default() -> Self {
        SystemOptions {
            nolinear: false,
            max_resident: DEFAULT_MAX_RESIDENT,
        }
    }
}

/// One guest process.
pub struct System {
    mode: CpuMode,
    linear: bool,
    pid: i32,
    max_resident: i64,
    /// Signals the emulator itself needs and intercepts from the guest.
    intercepted: u64,
    pub(crate) mem: Mutex<MemState>,
    pub(crate) sig: Mutex<SigState>,
    pub(crate) exec_lock: Mutex<()>,
    pub(crate) machines: Mutex<Vec<Arc<MachineShared>>>,
    pub(crate) machines_cond: Condvar,
    /// The guest descriptor table.
    pub fds: Fds,
    rlim: Mutex<[Rlimit; RLIM_NLIMITS]>,
    next_tid: AtomicU32,
}

impl System {
    /// Creates a guest process in `mode`. Long-mode systems get their
    /// page-table root allocated immediately; real-mode systems get the
    /// directly addressed buffer instead.
    pub fn new(mode: CpuMode, opts: SystemOptions) -> io::Result<Arc<System>> {
        ensure_wakeup_handler();
        let real = match mode {
            CpuMode::Real => Some(RealMemory::new(REAL_SIZE)?),
            _ => None,
        };
        let mut mem = MemState {
            cr3: PageEntry::new(),
            real,
            vss: 0,
            rss: 0,
            memchurn: 0,
            memstat: MemStat::default(),
            automap: AUTOMAP_START,
        };
        if mode == CpuMode::Long {
            mem.cr3 = pagetable::allocate_page_table(&mut mem)
                .map_err(|e| io::Error::from_raw_os_error(e.0))?;
        }
        let intercepted = signal::sig_bit(signal::SIGSYS)
            | signal::sig_bit(signal::SIGILL)
            | signal::sig_bit(signal::SIGFPE)
            | signal::sig_bit(signal::SIGSEGV)
            | signal::sig_bit(signal::SIGTRAP);
        Ok(Arc::new(System {
            mode,
            linear: mode == CpuMode::Long && !opts.nolinear,
            pid: std::process::id() as i32,
            max_resident: opts.max_resident,
            intercepted,
            mem: Mutex::new(mem),
            sig: Mutex::new(SigState {
                hands: [SigAction::default(); signal::NSIG as usize],
            }),
            exec_lock: Mutex::new(()),
            machines: Mutex::new(Vec::new()),
            machines_cond: Condvar::new(),
            fds: Fds::new(),
            rlim: Mutex::new([Rlimit::INFINITE; RLIM_NLIMITS]),
            next_tid: AtomicU32::new(0),
        }))
    }

    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// True when guest virtual addresses are a fixed skew from host
    /// addresses. A property of the System, not of any particular thread.
    pub fn has_linear_mapping(&self) -> bool {
        self.linear
    }

    /// The signal set the emulator reserves for itself.
    pub fn intercepted_signals(&self) -> u64 {
        self.intercepted
    }

    pub fn rlimit(&self, which: usize) -> Result<Rlimit, Errno> {
        self.rlim
            .lock()
            .get(which)
            .copied()
            .ok_or(Errno::EINVAL)
    }

    pub fn set_rlimit(&self, which: usize, limit: Rlimit) -> Result<(), Errno> {
        *self.rlim.lock().get_mut(which).ok_or(Errno::EINVAL)? = limit;
        Ok(())
    }

    /// Ceiling on vss, in pages.
    pub fn max_vss_pages(&self) -> i64 {
        MAX_VIRTUAL.min(self.rlimit(RLIMIT_AS).unwrap().cur as i64) / 4096
    }

    /// Ceiling on rss, in pages.
    pub fn max_rss_pages(&self) -> i64 {
        self.max_resident
            .min(self.rlimit(RLIMIT_AS).unwrap().cur as i64)
            / 4096
    }

    pub fn sigaction(&self, sig: i32) -> SigAction {
        debug_assert!((1..=signal::NSIG).contains(&sig));
        self.sig.lock().hands[(sig - 1) as usize]
    }

    pub fn set_sigaction(&self, sig: i32, hand: SigAction) {
        debug_assert!((1..=signal::NSIG).contains(&sig));
        self.sig.lock().hands[(sig - 1) as usize] = hand;
    }

    pub fn vss(&self) -> i64 {
        self.mem.lock().vss
    }

    pub fn rss(&self) -> i64 {
        self.mem.lock().rss
    }

    pub fn memstat(&self) -> MemStat {
        self.mem.lock().memstat
    }

    pub fn automap_hint(&self) -> i64 {
        self.mem.lock().automap
    }

    pub fn set_automap_hint(&self, hint: i64) {
        self.mem.lock().automap = hint;
    }

    pub(crate) fn next_tid(&self) -> i32 {
        let n = self.next_tid.fetch_add(1, Ordering::Relaxed);
        ((n & (MAX_THREAD_IDS - 1)) + MIN_THREAD_ID) as i32
    }

    /// Marks every machine's TLB and/or op cache as stale. Must be called
    /// after any address-space mutation, once walk state has been released.
    pub fn invalidate(&self, tlb: bool, icache: bool) {
        let machines = self.machines.lock();
        for shared in machines.iter() {
            if tlb {
                shared.invalidated.store(true, Ordering::Relaxed);
            }
            if icache {
                shared.opcache_invalidated.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Collapses empty page tables once unmap churn reaches half the
    /// resident set. The root stays allocated; only interior tables whose
    /// 512 slots are all zero are reclaimed.
    pub fn cleanse_memory(&self) {
        let mut mem = self.mem.lock();
        if mem.memchurn >= mem.rss / 2 {
            let oldrss = mem.rss;
            let cr3 = mem.cr3;
            if cr3.valid() {
                let root = cr3.host_addr();
                for i in 0..512 {
                    // SAFETY: cr3 designates the live root table.
                    let child = unsafe { pagetable::load_entry(root, i) };
                    if child.valid() && pagetable::free_page_tables(&mut mem, child, 2) {
                        // SAFETY: same root table as above.
                        unsafe { pagetable::store_entry(root, i, PageEntry::new()) };
                    }
                }
            }
            tracing::debug!(freed = oldrss - mem.rss, "collapsed empty page tables");
            mem.memchurn = 0;
        }
    }

    /// Posts `sig` to the machine with thread id `tid` and pokes its host
    /// thread so a blocked syscall returns to the poll loop.
    pub fn enqueue_signal(&self, tid: i32, sig: i32) -> bool {
        let machines = self.machines.lock();
        match machines.iter().find(|shared| shared.tid() == tid) {
            Some(shared) => {
                shared.enqueue_signal(sig);
                let _ = shared.thread().wake(wakeup_signal());
                true
            }
            None => false,
        }
    }

    /// Asks every other guest thread to die, then waits on the machine list
    /// until the caller is the only survivor. Used by exit and execve.
    pub fn kill_other_threads(&self, current: &Machine) {
        loop {
            let mut machines = self.machines.lock();
            let orphan =
                machines.len() == 1 && Arc::ptr_eq(&machines[0], current.shared());
            if orphan {
                break;
            }
            for shared in machines.iter() {
                if !Arc::ptr_eq(shared, current.shared()) {
                    tracing::debug!(
                        pid = self.pid,
                        tid = current.tid(),
                        victim = shared.tid(),
                        "killing sibling thread"
                    );
                    shared.killed.store(true, Ordering::Release);
                    let _ = shared.thread().wake(wakeup_signal());
                }
            }
            self.machines_cond.wait(&mut machines);
        }
    }

    /// Drops every machine registration except the caller's. Only valid once
    /// the sibling host threads are known dead, i.e. after execve has used
    /// [`System::kill_other_threads`].
    pub fn remove_other_threads(&self, current: &Machine) {
        let mut machines = self.machines.lock();
        machines.retain(|shared| Arc::ptr_eq(shared, current.shared()));
    }

    pub(crate) fn register_machine(&self, shared: Arc<MachineShared>) {
        self.machines.lock().push(shared);
    }

    pub(crate) fn unregister_machine(&self, shared: &Arc<MachineShared>) -> bool {
        let mut machines = self.machines.lock();
        machines.retain(|s| !Arc::ptr_eq(s, shared));
        let orphan = machines.is_empty();
        if !orphan {
            self.machines_cond.notify_one();
        }
        orphan
    }
}

impl Drop for System {
    fn drop(&mut self) {
        tracing::debug!(pid = self.pid, "tearing down system");
        debug_assert!(self.machines.get_mut().is_empty());
        let cr3 = self.mem.get_mut().cr3;
        if self.mode != CpuMode::Real && cr3.valid() {
            let _ = self.free_virtual(-0x8000_0000_0000, 0x1_0000_0000_0000);
            let mem = self.mem.get_mut();
            let freed = pagetable::free_page_tables(mem, cr3, 1);
            debug_assert!(freed);
            mem.cr3 = PageEntry::new();
        }
    }
}

/// The host signal used to interrupt a machine's blocked syscalls.
#[cfg(target_os = "linux")]
fn wakeup_signal() -> i32 {
    libc::SIGRTMIN()
}

/// Hosts without real-time signals borrow SIGURG, which the emulator ignores
/// anyway.
#[cfg(not(target_os = "linux"))]
fn wakeup_signal() -> i32 {
    libc::SIGURG
}

fn ensure_wakeup_handler() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // An empty handler whose only job is making blocked host syscalls
        // fail with EINTR so the interpreter reaches its poll point.
        // SAFETY: the closure is async-signal-safe; it does nothing.
        unsafe {
            signal_hook::low_level::register(wakeup_signal(), || {})
                .expect("failed to register wakeup signal handler");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use linuxdefs::limits::RLIMIT_NOFILE;

    #[test]
    fn long_mode_allocates_a_root_table() {
        let s = System::new(CpuMode::Long, SystemOptions::default()).unwrap();
        let mem = s.mem.lock();
        assert!(mem.cr3.valid());
        assert!(!mem.cr3.user());
        assert_eq!(mem.memstat.pagetables, 1);
        assert_eq!(mem.rss, 1);
    }

    #[test]
    fn real_mode_gets_a_buffer_instead() {
        let s = System::new(CpuMode::Real, SystemOptions::default()).unwrap();
        let mem = s.mem.lock();
        assert!(!mem.cr3.valid());
        assert!(mem.real.is_some());
        assert_eq!(mem.real.as_ref().unwrap().as_ptr() as usize % 4096, 0);
    }

    #[test]
    fn rlimits_start_infinite_and_clamp_vss() {
        let s = System::new(CpuMode::Long, SystemOptions::default()).unwrap();
        assert_eq!(s.rlimit(RLIMIT_NOFILE).unwrap(), Rlimit::INFINITE);
        assert_eq!(s.max_vss_pages(), MAX_VIRTUAL / 4096);
        s.set_rlimit(
            RLIMIT_AS,
            Rlimit {
                cur: 1 << 30,
                max: 1 << 30,
            },
        )
        .unwrap();
        assert_eq!(s.max_vss_pages(), (1 << 30) / 4096);
        assert_eq!(s.max_rss_pages(), (1 << 30) / 4096);
        assert!(s.set_rlimit(RLIM_NLIMITS, Rlimit::INFINITE).is_err());
    }

    #[test]
    fn intercepted_signals_are_preset() {
        let s = System::new(CpuMode::Long, SystemOptions::default()).unwrap();
        let want = signal::sig_bit(signal::SIGSYS)
            | signal::sig_bit(signal::SIGILL)
            | signal::sig_bit(signal::SIGFPE)
            | signal::sig_bit(signal::SIGSEGV)
            | signal::sig_bit(signal::SIGTRAP);
        assert_eq!(s.intercepted_signals(), want);
    }

    #[test]
    fn cloned_tids_stay_in_range() {
        let s = System::new(CpuMode::Long, SystemOptions::default()).unwrap();
        let a = s.next_tid();
        let b = s.next_tid();
        assert_ne!(a, b);
        for tid in [a, b] {
            assert!(tid >= MIN_THREAD_ID as i32);
            assert!(tid < (MIN_THREAD_ID + MAX_THREAD_IDS) as i32);
        }
    }
}
