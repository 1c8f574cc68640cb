// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Linux signal numbers, sigaction bits, and the wire layout of the signal
//! frame the emulator pushes onto the guest stack.

use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGILL: i32 = 4;
pub const SIGTRAP: i32 = 5;
pub const SIGABRT: i32 = 6;
pub const SIGBUS: i32 = 7;
pub const SIGFPE: i32 = 8;
pub const SIGKILL: i32 = 9;
pub const SIGUSR1: i32 = 10;
pub const SIGSEGV: i32 = 11;
pub const SIGUSR2: i32 = 12;
pub const SIGPIPE: i32 = 13;
pub const SIGALRM: i32 = 14;
pub const SIGTERM: i32 = 15;
pub const SIGSTKFLT: i32 = 16;
pub const SIGCHLD: i32 = 17;
pub const SIGCONT: i32 = 18;
pub const SIGSTOP: i32 = 19;
pub const SIGTSTP: i32 = 20;
pub const SIGTTIN: i32 = 21;
pub const SIGTTOU: i32 = 22;
pub const SIGURG: i32 = 23;
pub const SIGXCPU: i32 = 24;
pub const SIGXFSZ: i32 = 25;
pub const SIGVTALRM: i32 = 26;
pub const SIGPROF: i32 = 27;
pub const SIGWINCH: i32 = 28;
pub const SIGIO: i32 = 29;
pub const SIGPWR: i32 = 30;
pub const SIGSYS: i32 = 31;

/// Number of signals the guest can address (1-based).
pub const NSIG: i32 = 64;

pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

pub const SA_SIGINFO: u64 = 0x4;
pub const SA_RESTORER: u64 = 0x0400_0000;
pub const SA_ONSTACK: u64 = 0x0800_0000;
pub const SA_RESTART: u64 = 0x1000_0000;
pub const SA_NODEFER: u64 = 0x4000_0000;
pub const SA_RESETHAND: u64 = 0x8000_0000;

pub const SS_ONSTACK: u32 = 1;
pub const SS_DISABLE: u32 = 2;
pub const SS_AUTODISARM: u32 = 1 << 31;

/// The bit in a 64-bit signal set corresponding to `sig`.
pub fn sig_bit(sig: i32) -> u64 {
    debug_assert!((1..=NSIG).contains(&sig));
    1u64 << (sig - 1)
}

/// A guest `struct sigaction` as passed to rt_sigaction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SigAction {
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    pub mask: u64,
}

/// A guest `stack_t` as passed to sigaltstack.
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct StackT {
    pub sp: u64,
    pub flags: u32,
    pub pad: u32,
    pub size: u64,
}

impl Default for StackT {
    /// An alternate stack starts out disabled.
    fn default() -> Self {
        StackT {
            sp: 0,
            flags: SS_DISABLE,
            pad: 0,
            size: 0,
        }
    }
}

/// A guest `siginfo_t`. The union tail is left opaque; the emulator only
/// fills signo/code.
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SigInfo {
    pub signo: u32,
    pub errno: i32,
    pub code: i32,
    pub pad: u32,
    pub fields: [u8; 112],
}

/// The general-register part of a guest `ucontext`, laid out like the Linux
/// x86-64 `sigcontext`.
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MContext {
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rsp: u64,
    pub rip: u64,
    pub eflags: u64,
    pub cs: u16,
    pub gs: u16,
    pub fs: u16,
    pub ss: u16,
    pub err: u64,
    pub trapno: u64,
    pub oldmask: u64,
    pub cr2: u64,
    /// Guest pointer to the [`FpState`] within the frame.
    pub fpstate: u64,
    pub reserved: [u64; 8],
}

/// A guest `ucontext_t`.
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct UContext {
    pub flags: u64,
    pub link: u64,
    pub stack: StackT,
    pub mcontext: MContext,
    pub sigmask: u64,
}

/// The fxsave-format FPU/SSE snapshot the guest finds behind
/// `mcontext.fpstate`.
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FpState {
    pub cwd: u16,
    pub swd: u16,
    pub ftw: u16,
    pub fop: u16,
    pub rip: u64,
    pub rdp: u64,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub st: [u8; 128],
    pub xmm: [u8; 256],
    pub reserved: [u8; 96],
}

/// Everything the emulator pushes onto the guest stack when delivering a
/// signal to a handler.
///
/// The first quadword is the return address the handler pops: the
/// sa_restorer trampoline, which issues rt_sigreturn without moving the
/// stack pointer, so the frame can be recovered from `rsp - 8` at restore
/// time.
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SignalFrame {
    pub restorer: u64,
    pub si: SigInfo,
    pub uc: UContext,
    pub fp: FpState,
}

impl SignalFrame {
    /// Frame offset of the `siginfo` the handler receives in rsi.
    pub const SI_OFFSET: u64 = 8;
    /// Frame offset of the `ucontext` the handler receives in rdx.
    pub const UC_OFFSET: u64 = Self::SI_OFFSET + size_of::<SigInfo>() as u64;
    /// Frame offset of the FPU snapshot referenced by `mcontext.fpstate`.
    pub const FP_OFFSET: u64 = Self::UC_OFFSET + size_of::<UContext>() as u64;

    /// A zero-filled frame.
    pub fn zeroed() -> Self {
        FromZeros::new_zeroed()
    }
}

// The kernel ABI fixes these sizes; the stack alignment dance in delivery
// depends on the frame being 8 modulo 16.
const _: () = assert!(size_of::<SigInfo>() == 128);
const _: () = assert!(size_of::<MContext>() == 256);
const _: () = assert!(size_of::<UContext>() % 16 == 0);
const _: () = assert!(size_of::<FpState>() == 512);
const _: () = assert!(size_of::<SignalFrame>() % 16 == 8);
