// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest signal delivery: pending-set consumption, default dispositions,
//! frame construction on the guest stack, and sigreturn restore.

use crate::machine::Gpr;
use crate::machine::Machine;
use linuxdefs::signal::sig_bit;
use linuxdefs::signal::SigAction;
use linuxdefs::signal::SignalFrame;
use linuxdefs::signal::SA_NODEFER;
use linuxdefs::signal::SA_ONSTACK;
use linuxdefs::signal::SA_RESTART;
use linuxdefs::signal::SIGCHLD;
use linuxdefs::signal::SIGCONT;
use linuxdefs::signal::SIGFPE;
use linuxdefs::signal::SIGILL;
use linuxdefs::signal::SIGSEGV;
use linuxdefs::signal::SIGURG;
use linuxdefs::signal::SIGWINCH;
use linuxdefs::signal::SIG_DFL;
use linuxdefs::signal::SIG_IGN;
use linuxdefs::signal::SS_AUTODISARM;
use linuxdefs::signal::SS_DISABLE;
use linuxdefs::Errno;
use std::sync::atomic::Ordering;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Bytes below rsp that the ABI lets a leaf function use; the frame must not
/// touch them.
pub const REDZONE_SIZE: u64 = 128;

/// Signals whose default action is to do nothing.
pub fn is_ignored_by_default(sig: i32) -> bool {
    sig == SIGURG || sig == SIGCONT || sig == SIGCHLD || sig == SIGWINCH
}

/// Signals that report a broken machine state; ignoring or deferring them
/// would immediately re-raise.
pub fn is_too_dangerous_to_ignore(sig: i32) -> bool {
    sig == SIGFPE || sig == SIGILL || sig == SIGSEGV
}

/// What [`consume_signal`] decided.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Nothing deliverable was pending.
    None,
    /// A frame was pushed and the registers now enter the guest handler.
    /// `restart` reports whether the interrupted syscall should restart.
    Delivered { sig: i32, restart: bool },
    /// The caller must terminate the guest with this signal's default
    /// action.
    Terminate(i32),
}

/// Takes the highest pending-and-unmasked signal and acts on its
/// disposition. Masked signals stay pending, except that a pending
/// machine-fault signal can never be deferred.
pub fn consume_signal(m: &mut Machine) -> SignalOutcome {
    let system = m.system.clone();
    let sig_state = system.sig.lock();
    let mut signals = m.shared().signals.load(Ordering::Acquire);
    while signals != 0 {
        let sig = 64 - signals.leading_zeros() as i32;
        let bit = sig_bit(sig);
        if m.sigmask & bit == 0 {
            m.shared().signals.fetch_and(!bit, Ordering::AcqRel);
            let hand = sig_state.hands[(sig - 1) as usize];
            if hand.handler == SIG_DFL {
                if is_ignored_by_default(sig) {
                    tracing::trace!(sig, "default action is to ignore");
                    return SignalOutcome::None;
                }
                tracing::trace!(sig, "default action is to terminate");
                return SignalOutcome::Terminate(sig);
            } else if hand.handler == SIG_IGN {
                if !is_too_dangerous_to_ignore(sig) {
                    tracing::trace!(sig, "explicitly ignored");
                    return SignalOutcome::None;
                }
                tracing::trace!(sig, "refusing to ignore");
                return SignalOutcome::Terminate(sig);
            }
            let restart = hand.flags & SA_RESTART != 0;
            return match deliver_signal(m, &hand, sig, 0) {
                Ok(()) => SignalOutcome::Delivered { sig, restart },
                // The frame would not fit on the guest stack.
                Err(_) => SignalOutcome::Terminate(SIGSEGV),
            };
        } else if is_too_dangerous_to_ignore(sig) {
            // The faulting instruction would re-raise forever; deferral is
            // not an option.
            return SignalOutcome::Terminate(sig);
        }
        signals &= !bit;
    }
    SignalOutcome::None
}

/// Builds a [`SignalFrame`] on the guest stack and points the register file
/// at the handler.
pub(crate) fn deliver_signal(
    m: &mut Machine,
    hand: &SigAction,
    sig: i32,
    code: i32,
) -> Result<(), Errno> {
    tracing::debug!(sig, tid = m.tid(), "delivering signal");
    m.abandon_path();
    let mut sf = SignalFrame::zeroed();
    // Capture the current state of the machine.
    sf.si.signo = sig as u32;
    sf.si.code = code;
    sf.uc.sigmask = m.sigmask;
    let mc = &mut sf.uc.mcontext;
    mc.r8 = m.cpu.gpr(Gpr::R8);
    mc.r9 = m.cpu.gpr(Gpr::R9);
    mc.r10 = m.cpu.gpr(Gpr::R10);
    mc.r11 = m.cpu.gpr(Gpr::R11);
    mc.r12 = m.cpu.gpr(Gpr::R12);
    mc.r13 = m.cpu.gpr(Gpr::R13);
    mc.r14 = m.cpu.gpr(Gpr::R14);
    mc.r15 = m.cpu.gpr(Gpr::R15);
    mc.rdi = m.cpu.gpr(Gpr::Rdi);
    mc.rsi = m.cpu.gpr(Gpr::Rsi);
    mc.rbp = m.cpu.gpr(Gpr::Rbp);
    mc.rbx = m.cpu.gpr(Gpr::Rbx);
    mc.rdx = m.cpu.gpr(Gpr::Rdx);
    mc.rax = m.cpu.gpr(Gpr::Rax);
    mc.rcx = m.cpu.gpr(Gpr::Rcx);
    mc.rsp = m.cpu.gpr(Gpr::Rsp);
    mc.rip = m.cpu.rip;
    mc.eflags = m.cpu.rflags;
    sf.fp.cwd = m.cpu.fpu.cw;
    sf.fp.swd = m.cpu.fpu.sw;
    sf.fp.ftw = m.cpu.fpu.tw;
    sf.fp.fop = m.cpu.fpu.op;
    sf.fp.rip = m.cpu.fpu.ip;
    sf.fp.rdp = m.cpu.fpu.dp;
    sf.fp.mxcsr = m.cpu.mxcsr;
    sf.fp.st = m.cpu.fpu.st;
    for (i, xmm) in m.cpu.xmm.iter().enumerate() {
        sf.fp.xmm[i * 16..(i + 1) * 16].copy_from_slice(xmm);
    }
    // Enter the handler with its declared mask; the delivered signal is
    // added too unless the guest asked for SA_NODEFER.
    m.sigmask |= hand.mask;
    if hand.flags & SA_NODEFER == 0 {
        m.sigmask |= sig_bit(sig);
    }
    tracing::trace!(sigmask = m.sigmask, "handler entry mask");
    // Pick the stack: the alternate stack if the handler asked for it and
    // the guest armed one, otherwise the current stack below the red zone.
    let mut sp;
    if hand.flags & SA_ONSTACK != 0 && m.sigaltstack.flags & SS_DISABLE == 0 {
        sp = m.sigaltstack.sp.wrapping_add(m.sigaltstack.size);
        if m.sigaltstack.flags & SS_AUTODISARM != 0 {
            m.sigaltstack.flags &= !SS_AUTODISARM;
        }
    } else {
        sp = m.cpu.gpr(Gpr::Rsp);
        sp = sp.wrapping_sub(REDZONE_SIZE);
    }
    // The call into the handler must observe 16-byte stack alignment after
    // the trampoline return address is pushed, hence sp % 16 == 8 here.
    sp &= !15;
    sp = sp.wrapping_sub(size_of::<SignalFrame>() as u64);
    debug_assert_eq!(sp & 15, 8);
    sf.restorer = hand.restorer;
    sf.uc.mcontext.fpstate = sp.wrapping_add(SignalFrame::FP_OFFSET);
    tracing::trace!(sp, "writing signal frame");
    m.system.copy_to_guest(sp as i64, sf.as_bytes()).map_err(|err| {
        tracing::warn!(sp, "stack overflow delivering signal");
        err
    })?;
    m.cpu.set_gpr(Gpr::Rsp, sp);
    m.cpu.set_gpr(Gpr::Rdi, sig as u64);
    m.cpu.set_gpr(Gpr::Rsi, sp.wrapping_add(SignalFrame::SI_OFFSET));
    m.cpu.set_gpr(Gpr::Rdx, sp.wrapping_add(SignalFrame::UC_OFFSET));
    m.cpu.rip = hand.handler;
    Ok(())
}

/// Restores machine state from the frame rt_sigreturn points at.
///
/// The restorer trampoline does not move the stack pointer, so the frame
/// sits at `rsp - 8` when the guest issues rt_sigreturn.
pub fn sig_restore(m: &mut Machine) -> Result<(), Errno> {
    let base = m.cpu.gpr(Gpr::Rsp).wrapping_sub(8);
    tracing::debug!(base, tid = m.tid(), "restoring from signal frame");
    let mut buf = [0u8; size_of::<SignalFrame>()];
    m.system.copy_from_guest(&mut buf, base as i64)?;
    let sf = SignalFrame::read_from_bytes(&buf).unwrap();
    let mc = &sf.uc.mcontext;
    m.cpu.rip = mc.rip;
    m.cpu.rflags = mc.eflags;
    m.sigmask = sf.uc.sigmask;
    m.cpu.set_gpr(Gpr::R8, mc.r8);
    m.cpu.set_gpr(Gpr::R9, mc.r9);
    m.cpu.set_gpr(Gpr::R10, mc.r10);
    m.cpu.set_gpr(Gpr::R11, mc.r11);
    m.cpu.set_gpr(Gpr::R12, mc.r12);
    m.cpu.set_gpr(Gpr::R13, mc.r13);
    m.cpu.set_gpr(Gpr::R14, mc.r14);
    m.cpu.set_gpr(Gpr::R15, mc.r15);
    m.cpu.set_gpr(Gpr::Rdi, mc.rdi);
    m.cpu.set_gpr(Gpr::Rsi, mc.rsi);
    m.cpu.set_gpr(Gpr::Rbp, mc.rbp);
    m.cpu.set_gpr(Gpr::Rbx, mc.rbx);
    m.cpu.set_gpr(Gpr::Rdx, mc.rdx);
    m.cpu.set_gpr(Gpr::Rax, mc.rax);
    m.cpu.set_gpr(Gpr::Rcx, mc.rcx);
    m.cpu.set_gpr(Gpr::Rsp, mc.rsp);
    m.cpu.fpu.cw = sf.fp.cwd;
    m.cpu.fpu.sw = sf.fp.swd;
    m.cpu.fpu.tw = sf.fp.ftw;
    m.cpu.fpu.op = sf.fp.fop;
    m.cpu.fpu.ip = sf.fp.rip;
    m.cpu.fpu.dp = sf.fp.rdp;
    m.cpu.mxcsr = sf.fp.mxcsr;
    m.cpu.fpu.st = sf.fp.st;
    for (i, xmm) in m.cpu.xmm.iter_mut().enumerate() {
        xmm.copy_from_slice(&sf.fp.xmm[i * 16..(i + 1) * 16]);
    }
    m.restored = true;
    Ok(())
}
