// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-visible errno values (Linux x86-64 numbering) and translation from
//! host error values.

use std::io;
use thiserror::Error;

/// A Linux errno value as seen by the guest.
///
/// Syscall shims return `Result<T, Errno>`; the dispatcher turns an `Err`
/// into the `-errno` register value with [`Errno::sysret`].
#[derive(Copy, Clone, PartialEq, Eq, Error)]
#[error("guest errno {0}")]
pub struct Errno(pub i32);

/// Result type carrying a guest errno on failure.
pub type Result<T> = core::result::Result<T, Errno>;

impl std::fmt::Debug for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Errno({})", self.0)
    }
}

impl Errno {
    pub const EPERM: Errno = Errno(1);
    pub const ENOENT: Errno = Errno(2);
    pub const EINTR: Errno = Errno(4);
    pub const EBADF: Errno = Errno(9);
    pub const EAGAIN: Errno = Errno(11);
    pub const ENOMEM: Errno = Errno(12);
    pub const EACCES: Errno = Errno(13);
    pub const EFAULT: Errno = Errno(14);
    pub const EEXIST: Errno = Errno(17);
    pub const ENOTDIR: Errno = Errno(20);
    pub const EISDIR: Errno = Errno(21);
    pub const EINVAL: Errno = Errno(22);
    pub const ENFILE: Errno = Errno(23);
    pub const EMFILE: Errno = Errno(24);
    pub const ENOSPC: Errno = Errno(28);
    pub const ENAMETOOLONG: Errno = Errno(36);
    pub const ENOSYS: Errno = Errno(38);
    pub const ELOOP: Errno = Errno(40);
    pub const ENOTSUP: Errno = Errno(95);

    /// The value to place in the syscall return register.
    pub fn sysret(self) -> i64 {
        -(self.0 as i64)
    }

    /// Translates a host errno into the value Linux would have produced.
    ///
    /// The low POSIX numbers agree everywhere; the values that diverge on the
    /// BSDs are mapped explicitly and anything unrecognized collapses to
    /// `EINVAL` rather than leaking a host-specific number to the guest.
    pub fn from_host(host: i32) -> Errno {
        match host {
            x if x == libc::ELOOP => Errno::ELOOP,
            x if x == libc::ENAMETOOLONG => Errno::ENAMETOOLONG,
            x if x == libc::ENOSYS => Errno::ENOSYS,
            x if x == libc::ENOTSUP => Errno::ENOTSUP,
            x if x == libc::EAGAIN => Errno::EAGAIN,
            x if (1..=34).contains(&x) => Errno(x),
            _ => Errno::EINVAL,
        }
    }

    /// Translates a host I/O error, defaulting to `EINVAL` when the error
    /// does not carry an OS error code.
    pub fn from_host_io(err: &io::Error) -> Errno {
        err.raw_os_error().map_or(Errno::EINVAL, Errno::from_host)
    }
}
