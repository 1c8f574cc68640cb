// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg(unix)]

use std::io;
use std::io::Error;

/// A host error value.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Errno(pub i32);

impl std::fmt::Debug for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&Error::from(*self), f)
    }
}

impl From<Errno> for Error {
    fn from(code: Errno) -> Self {
        Self::from_raw_os_error(code.0)
    }
}

/// Trait for extracting a Unix error value from an error type.
pub trait TryAsErrno {
    /// Gets the Unix error value if there is one.
    fn try_as_errno(&self) -> Option<Errno>;
}

impl TryAsErrno for Errno {
    fn try_as_errno(&self) -> Option<Errno> {
        Some(*self)
    }
}

impl TryAsErrno for Error {
    fn try_as_errno(&self) -> Option<Errno> {
        self.raw_os_error().map(Errno)
    }
}

/// Returns the value of errno.
pub fn errno() -> Errno {
    Errno(Error::last_os_error().raw_os_error().unwrap())
}

/// A helper trait to convert from a libc return value to a `Result<_, Errno>`.
pub trait SyscallResult: Sized {
    /// Returns `Ok(self)` if `self >= 0`, otherwise `Err(errno())`.
    fn syscall_result(self) -> Result<Self, Errno>;
}

impl SyscallResult for i32 {
    fn syscall_result(self) -> Result<Self, Errno> {
        if self >= 0 { Ok(self) } else { Err(errno()) }
    }
}

impl SyscallResult for isize {
    fn syscall_result(self) -> Result<Self, Errno> {
        if self >= 0 { Ok(self) } else { Err(errno()) }
    }
}

/// Runs f() until it stops failing with EINTR (as indicated by errno).
pub fn while_eintr<F, R, E>(mut f: F) -> Result<R, E>
where
    F: FnMut() -> Result<R, E>,
    E: TryAsErrno,
{
    loop {
        match f() {
            Err(err) if err.try_as_errno() == Some(Errno(libc::EINTR)) => {}
            r => break r,
        }
    }
}

/// Blocks every host signal for the calling thread until the returned guard
/// is dropped, at which point the previous mask is reinstated with
/// `SIG_SETMASK`.
///
/// Used around multi-step host operations that must not be observed half-done
/// by a signal handler.
pub fn block_all_signals() -> io::Result<SignalMaskGuard> {
    // SAFETY: sigfillset and pthread_sigmask are called as documented; the
    // mask structures are owned locals.
    unsafe {
        let mut all = std::mem::zeroed::<libc::sigset_t>();
        let mut old = std::mem::zeroed::<libc::sigset_t>();
        libc::sigfillset(&mut all).syscall_result()?;
        let r = libc::pthread_sigmask(libc::SIG_BLOCK, &all, &mut old);
        if r != 0 {
            return Err(Error::from_raw_os_error(r));
        }
        Ok(SignalMaskGuard { old })
    }
}

/// Restores the signal mask captured by [`block_all_signals`] on drop.
pub struct SignalMaskGuard {
    old: libc::sigset_t,
}

impl Drop for SignalMaskGuard {
    fn drop(&mut self) {
        // SAFETY: restoring a mask previously captured on this thread.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut());
        }
    }
}
