// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-thread guest state.

use crate::system::System;
use linuxdefs::signal::StackT;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// General-purpose register indices in x86 encoding order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// Legacy x87 state, kept in the fxsave field order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FpuState {
    pub cw: u16,
    pub sw: u16,
    pub tw: u16,
    pub op: u16,
    pub ip: u64,
    pub dp: u64,
    pub st: [u8; 128],
}

impl Default for FpuState {
    fn default() -> Self {
        FpuState {
            cw: 0x037f,
            sw: 0,
            tw: 0xffff,
            op: 0,
            ip: 0,
            dp: 0,
            st: [0; 128],
        }
    }
}

/// The full architectural register file of one guest thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuState {
    pub gpr: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    pub fpu: FpuState,
    pub mxcsr: u32,
    pub xmm: [[u8; 16]; 16],
}

impl Default for CpuState {
    fn default() -> Self {
        CpuState {
            gpr: [0; 16],
            rip: 0,
            // Bit 1 always reads as set.
            rflags: 0x2,
            fpu: FpuState::default(),
            mxcsr: 0x1f80,
            xmm: [[0; 16]; 16],
        }
    }
}

impl CpuState {
    pub fn gpr(&self, r: Gpr) -> u64 {
        self.gpr[r as usize]
    }

    pub fn set_gpr(&mut self, r: Gpr, v: u64) {
        self.gpr[r as usize] = v;
    }
}

/// In-progress instruction-path scratch handed to the translator; not
/// inherited across clone and abandoned on any asynchronous transfer of
/// control.
#[derive(Clone, Debug)]
pub struct InsnPath {
    pub start: i64,
    pub elements: u32,
}

/// Handle to the host thread a machine runs on, captured at machine
/// creation so siblings can nudge it out of a blocked syscall.
#[derive(Copy, Clone, Debug)]
pub(crate) struct HostThread(libc::pthread_t);

// SAFETY: pthread_t is an opaque handle that may be used from any thread;
// musl defines it as a pointer type, which blocks the auto traits even
// though sharing the handle is fine.
unsafe impl Send for HostThread {}
// SAFETY: see above comment.
unsafe impl Sync for HostThread {}

impl HostThread {
    fn current() -> Self {
        // SAFETY: no preconditions.
        Self(unsafe { libc::pthread_self() })
    }

    /// Posts a host signal to the thread, interrupting whatever restartable
    /// syscall it is blocked in so it reaches the interpreter poll point.
    ///
    /// pthread_kill reports failure through its return value, not errno.
    pub(crate) fn wake(&self, signal: i32) -> io::Result<()> {
        // SAFETY: a stale handle is possible only after the machine has
        // unregistered, at which point callers no longer hold it.
        let rc = unsafe { libc::pthread_kill(self.0, signal) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }
}

/// The part of a machine other threads may touch: identification, the
/// kill/invalidate flags polled by the interpreter loop, and the pending
/// signal set.
pub struct MachineShared {
    tid: i32,
    thread: HostThread,
    pub(crate) killed: AtomicBool,
    pub(crate) invalidated: AtomicBool,
    pub(crate) opcache_invalidated: AtomicBool,
    pub(crate) signals: AtomicU64,
}

impl MachineShared {
    pub fn tid(&self) -> i32 {
        self.tid
    }

    pub(crate) fn thread(&self) -> HostThread {
        self.thread
    }

    /// Polled by the owning thread at instruction boundaries.
    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    /// Sets bit `sig - 1` in the pending set. Out-of-range signals are
    /// ignored.
    pub fn enqueue_signal(&self, sig: i32) {
        if (1..=linuxdefs::signal::NSIG).contains(&sig) {
            self.signals
                .fetch_or(linuxdefs::signal::sig_bit(sig), Ordering::AcqRel);
        }
    }

    /// Snapshot of the pending set.
    pub fn pending_signals(&self) -> u64 {
        self.signals.load(Ordering::Acquire)
    }
}

/// One guest thread, owned by the host thread that runs it.
pub struct Machine {
    /// The guest process this thread belongs to.
    pub system: Arc<System>,
    shared: Arc<MachineShared>,
    pub cpu: CpuState,
    /// Guest-visible blocked signal mask.
    pub sigmask: u64,
    /// Guest sigaltstack descriptor; starts disabled.
    pub sigaltstack: StackT,
    /// Set when the thread just returned through rt_sigreturn, telling the
    /// syscall dispatcher not to clobber rax.
    pub restored: bool,
    pub(crate) path: Option<InsnPath>,
    freelist: Vec<Box<[u8]>>,
}

impl Machine {
    /// Creates a machine for the calling host thread and registers it with
    /// the system. With a `parent`, the register file and signal state are
    /// cloned and a fresh thread id is assigned; the primordial machine uses
    /// the process id as its thread id and a reset register file.
    pub fn new(system: &Arc<System>, parent: Option<&Machine>) -> Machine {
        let tid = match parent {
            Some(_) => system.next_tid(),
            None => system.pid(),
        };
        let shared = Arc::new(MachineShared {
            tid,
            thread: HostThread::current(),
            killed: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
            opcache_invalidated: AtomicBool::new(false),
            signals: AtomicU64::new(0),
        });
        let (cpu, sigmask, sigaltstack) = match parent {
            Some(p) => (p.cpu.clone(), p.sigmask, p.sigaltstack),
            None => (CpuState::default(), 0, StackT::default()),
        };
        system.register_machine(shared.clone());
        tracing::debug!(pid = system.pid(), tid, "new machine thread");
        Machine {
            system: system.clone(),
            shared,
            cpu,
            sigmask,
            sigaltstack,
            restored: false,
            path: None,
            freelist: Vec::new(),
        }
    }

    pub fn tid(&self) -> i32 {
        self.shared.tid
    }

    pub fn shared(&self) -> &Arc<MachineShared> {
        &self.shared
    }

    /// True when this machine is the only one left on the system.
    pub fn is_orphan(&self) -> bool {
        let machines = self.system.machines.lock();
        machines.len() == 1 && Arc::ptr_eq(&machines[0], &self.shared)
    }

    /// Consumes the TLB-invalidated flag; the interpreter flushes its
    /// translation caches when this returns true.
    pub fn check_invalidated(&mut self) -> bool {
        self.shared.invalidated.swap(false, Ordering::Relaxed)
    }

    /// Consumes the op-cache-invalidated flag.
    pub fn check_opcache_invalidated(&mut self) -> bool {
        self.shared.opcache_invalidated.swap(false, Ordering::Relaxed)
    }

    pub fn is_making_path(&self) -> bool {
        self.path.is_some()
    }

    pub fn begin_path(&mut self, start: i64) {
        self.path = Some(InsnPath { start, elements: 0 });
    }

    /// Discards any half-built instruction path, e.g. when a signal diverts
    /// control.
    pub fn abandon_path(&mut self) {
        if let Some(path) = self.path.take() {
            tracing::trace!(start = path.start, "abandoning instruction path");
        }
    }

    /// Queues memory to be freed when it is provably unreferenced, at the
    /// next garbage collection point of this thread.
    pub fn defer_free(&mut self, mem: Box<[u8]>) {
        self.freelist.push(mem);
    }

    /// Runs the deferred free list.
    pub fn collect_garbage(&mut self) {
        self.freelist.clear();
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        tracing::debug!(pid = self.system.pid(), tid = self.tid(), "freeing machine");
        self.abandon_path();
        self.collect_garbage();
        // The last machine out does not signal anyone; system teardown runs
        // when the final Arc<System> reference drops.
        let _orphan = self.system.unregister_machine(&self.shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::CpuMode;
    use crate::system::SystemOptions;
    use crate::system::MIN_THREAD_ID;

    #[test]
    fn root_machine_uses_the_process_id() {
        let s = System::new(CpuMode::Long, SystemOptions::default()).unwrap();
        let m = Machine::new(&s, None);
        assert_eq!(m.tid(), s.pid());
        assert!(m.is_orphan());
        assert_eq!(m.sigaltstack.flags, linuxdefs::signal::SS_DISABLE);
    }

    #[test]
    fn children_clone_registers_but_not_scratch() {
        let s = System::new(CpuMode::Long, SystemOptions::default()).unwrap();
        let mut parent = Machine::new(&s, None);
        parent.cpu.set_gpr(Gpr::Rbx, 0x1122_3344);
        parent.cpu.rip = 0x40_0000;
        parent.sigmask = 0x80;
        parent.begin_path(0x40_0000);
        parent.shared().enqueue_signal(10);

        let child = Machine::new(&s, Some(&parent));
        assert_eq!(child.cpu, parent.cpu);
        assert_eq!(child.sigmask, 0x80);
        assert!(!child.is_making_path());
        assert_eq!(child.shared().pending_signals(), 0);
        assert!(child.tid() >= MIN_THREAD_ID as i32);
        assert!(!parent.is_orphan());
    }

    #[test]
    fn dropping_machines_empties_the_list() {
        let s = System::new(CpuMode::Long, SystemOptions::default()).unwrap();
        let root = Machine::new(&s, None);
        let child = Machine::new(&s, Some(&root));
        assert!(!root.is_orphan());
        drop(child);
        assert!(root.is_orphan());
    }

    #[test]
    fn deferred_frees_drain_at_collection_points() {
        let s = System::new(CpuMode::Long, SystemOptions::default()).unwrap();
        let mut m = Machine::new(&s, None);
        m.defer_free(vec![0u8; 64].into_boxed_slice());
        m.defer_free(vec![0u8; 128].into_boxed_slice());
        assert_eq!(m.freelist.len(), 2);
        m.collect_garbage();
        assert!(m.freelist.is_empty());
    }

    #[test]
    fn invalidate_reaches_every_machine() {
        let s = System::new(CpuMode::Long, SystemOptions::default()).unwrap();
        let mut a = Machine::new(&s, None);
        let mut b = Machine::new(&s, Some(&a));
        s.invalidate(true, true);
        assert!(a.check_invalidated());
        assert!(b.check_invalidated());
        assert!(a.check_opcache_invalidated());
        // The flag is consumed.
        assert!(!a.check_invalidated());
    }
}
