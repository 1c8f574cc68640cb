// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-facing Linux ABI definitions for the emulator.
//!
//! Everything in this crate is defined by the x86-64 Linux userspace ABI, not
//! by the host: signal numbers and dispositions, the signal frame the guest
//! sees on its stack, open(2) flag values, errno values, and rlimits. Hosts
//! that disagree with Linux on any of these get translated at the syscall
//! boundary using the tables here.

#![forbid(unsafe_code)]

pub mod errno;
pub mod fcntl;
pub mod limits;
pub mod mman;
pub mod signal;

pub use errno::Errno;
pub use errno::Result;
