// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest memory and process model for the user-mode x86-64 Linux emulator.
//!
//! A [`System`] is one guest process: a four-level page table over the 48-bit
//! guest address space, the descriptor table, signal dispositions, rlimits,
//! and the collection of guest threads. A [`Machine`] is one guest thread:
//! the full register file plus its signal mask and pending set, running on a
//! dedicated host thread.
//!
//! Guest pages are 4 KiB regardless of the host page size. In linear mode a
//! guest virtual address is a fixed skew away from the host address backing
//! it, so translated code can reach guest memory with ordinary loads; hosts
//! with larger pages or without usable fixed mappings fall back to per-page
//! ("mug") host mappings or pool pages tracked only by the page table.

// UNSAFETY: Page-table entries carry raw host addresses that are dereferenced
// when walking tables and copying guest memory, and the syscall shims call
// libc directly.
#![expect(unsafe_code)]
#![cfg(unix)]

pub mod aspace;
pub mod fd;
pub mod machine;
pub mod pagetable;
pub mod signal;
pub mod syscall;
pub mod system;
pub mod vmem;

pub use machine::Machine;
pub use pagetable::PageEntry;
pub use system::CpuMode;
pub use system::System;
pub use system::SystemOptions;
