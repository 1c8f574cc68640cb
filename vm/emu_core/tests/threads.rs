// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Machine lifecycle across real host threads: kill/orphan convergence and
//! cross-thread signal posting.

#![cfg(unix)]

use emu_core::signal::consume_signal;
use emu_core::signal::SignalOutcome;
use emu_core::CpuMode;
use emu_core::Machine;
use emu_core::System;
use emu_core::SystemOptions;
use linuxdefs::signal::sig_bit;
use linuxdefs::signal::SigAction;
use linuxdefs::signal::SIGUSR1;
use std::sync::Arc;

fn nolinear_system() -> Arc<System> {
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
fn kill_other_threads_waits_for_every_sibling() {
    let s = nolinear_system();
    let root = Machine::new(&s, None);

    let mut joins = Vec::new();
    for _ in 0..3 {
        let child = Machine::new(&s, Some(&root));
        joins.push(std::thread::spawn(move || {
            // The interpreter polls the kill flag at instruction boundaries;
            // model that with a spin-and-yield loop.
            while !child.shared().killed() {
                std::thread::yield_now();
            }
            drop(child);
        }));
    }
    assert!(!root.is_orphan());

    s.kill_other_threads(&root);
    assert!(root.is_orphan());
    for join in joins {
        join.join().unwrap();
    }
}

#[test]
fn signals_cross_threads_by_tid() {
    let s = nolinear_system();
    let root = Machine::new(&s, None);
    let child = Machine::new(&s, Some(&root));
    let tid = child.tid();

    assert!(s.enqueue_signal(tid, SIGUSR1));
    assert_ne!(child.shared().pending_signals() & sig_bit(SIGUSR1), 0);
    assert_eq!(root.shared().pending_signals(), 0);

    // Unknown tids report failure.
    assert!(!s.enqueue_signal(-1, SIGUSR1));
}

#[test]
fn blocked_signal_delivers_after_unmask() {
    use emu_core::machine::Gpr;
    use emu_core::pagetable::set_protection;
    use linuxdefs::mman::PROT_READ;
    use linuxdefs::mman::PROT_WRITE;

    let s = nolinear_system();
    let stack = 0x300_0000i64;
    s.reserve_virtual(stack, 0x8000, set_protection(PROT_READ | PROT_WRITE), None, 0, false)
        .unwrap();
    s.set_sigaction(
        SIGUSR1,
        SigAction {
            handler: 0x41_0000,
            flags: 0,
            restorer: 0x42_0000,
            mask: 0,
        },
    );

    let mut a = Machine::new(&s, None);
    a.cpu.set_gpr(Gpr::Rsp, (stack + 0x8000) as u64);
    a.sigmask = sig_bit(SIGUSR1);

    // Another thread posts SIGUSR1 while it is blocked.
    let shared = a.shared().clone();
    std::thread::spawn(move || shared.enqueue_signal(SIGUSR1))
        .join()
        .unwrap();
    assert_eq!(consume_signal(&mut a), SignalOutcome::None);

    // After unblocking, the next consume pushes the frame with rdi = signo
    // and a 16-byte-misaligned-by-8 stack pointer.
    a.sigmask = 0;
    assert_eq!(
        consume_signal(&mut a),
        SignalOutcome::Delivered {
            sig: SIGUSR1,
            restart: false
        }
    );
    assert_eq!(a.cpu.gpr(Gpr::Rdi), SIGUSR1 as u64);
    assert_eq!(a.cpu.gpr(Gpr::Rsp) & 15, 8);
    assert_eq!(a.cpu.rip, 0x41_0000);
}
