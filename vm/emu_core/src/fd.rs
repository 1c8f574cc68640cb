// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The guest descriptor table.
//!
//! Guest descriptor numbers are host descriptor numbers; the table exists to
//! carry guest-side metadata (open flags, socket type, restart behavior) and
//! the capability record that routes I/O. Descriptors the emulator fakes
//! (e.g. a terminal multiplexer) supply their own [`FdOps`] at insert time.

use linuxdefs::Errno;
use pal::unix::SyscallResult;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::io;
use std::io::IoSlice;
use std::io::IoSliceMut;
use std::os::unix::prelude::*;
use std::sync::Arc;

mod ioctl {
    use nix::ioctl_read_bad;
    use nix::ioctl_write_ptr_bad;

    ioctl_read_bad!(tcgwinsz, libc::TIOCGWINSZ, libc::winsize);
    ioctl_write_ptr_bad!(tcswinsz, libc::TIOCSWINSZ, libc::winsize);
}

/// The operations a descriptor dispatches through; chosen when the
/// descriptor is added to the table.
pub trait FdOps: Send + Sync {
    fn close(&self, fd: RawFd) -> io::Result<()>;
    fn readv(&self, fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize>;
    fn writev(&self, fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
    fn poll(&self, fd: RawFd, events: i16, timeout_ms: i32) -> io::Result<i16>;
    fn tcgetattr(&self, fd: RawFd) -> io::Result<libc::termios>;
    fn tcsetattr(&self, fd: RawFd, optional_actions: i32, tio: &libc::termios)
        -> io::Result<()>;
    fn tcgetwinsize(&self, fd: RawFd) -> io::Result<libc::winsize>;
    fn tcsetwinsize(&self, fd: RawFd, ws: &libc::winsize) -> io::Result<()>;
}

/// Pass-through to the host kernel.
pub struct HostFdOps;

impl FdOps for HostFdOps {
    fn close(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: plain syscall on a caller-owned descriptor.
        unsafe { libc::close(fd) }.syscall_result()?;
        Ok(())
    }

    fn readv(&self, fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        // SAFETY: the iovecs point at caller-owned buffers.
        let n = unsafe {
            libc::readv(fd, bufs.as_mut_ptr().cast(), bufs.len() as i32)
        }
        .syscall_result()?;
        Ok(n as usize)
    }

    fn writev(&self, fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        // SAFETY: the iovecs point at caller-owned buffers.
        let n = unsafe { libc::writev(fd, bufs.as_ptr().cast(), bufs.len() as i32) }
            .syscall_result()?;
        Ok(n as usize)
    }

    fn poll(&self, fd: RawFd, events: i16, timeout_ms: i32) -> io::Result<i16> {
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: pfd is an owned local.
        unsafe { libc::poll(&mut pfd, 1, timeout_ms) }.syscall_result()?;
        Ok(pfd.revents)
    }

    fn tcgetattr(&self, fd: RawFd) -> io::Result<libc::termios> {
        // SAFETY: tio is an owned local the call fully initializes.
        unsafe {
            let mut tio = std::mem::zeroed::<libc::termios>();
            libc::tcgetattr(fd, &mut tio).syscall_result()?;
            Ok(tio)
        }
    }

    fn tcsetattr(
        &self,
        fd: RawFd,
        optional_actions: i32,
        tio: &libc::termios,
    ) -> io::Result<()> {
        // SAFETY: plain syscall over borrowed data.
        unsafe { libc::tcsetattr(fd, optional_actions, tio) }.syscall_result()?;
        Ok(())
    }

    fn tcgetwinsize(&self, fd: RawFd) -> io::Result<libc::winsize> {
        // SAFETY: ws is an owned local the ioctl fully initializes.
        unsafe {
            let mut ws = std::mem::zeroed::<libc::winsize>();
            ioctl::tcgwinsz(fd, &mut ws).map_err(io::Error::from)?;
            Ok(ws)
        }
    }

    fn tcsetwinsize(&self, fd: RawFd, ws: &libc::winsize) -> io::Result<()> {
        // SAFETY: plain ioctl over borrowed data.
        unsafe { ioctl::tcswinsz(fd, ws) }.map_err(io::Error::from)?;
        Ok(())
    }
}

fn host_ops() -> &'static dyn FdOps {
    static OPS: HostFdOps = HostFdOps;
    &OPS
}

/// One guest descriptor.
pub struct Fd {
    /// The host descriptor number, which the guest also sees.
    pub fildes: RawFd,
    /// Host open flags recorded at insertion.
    pub oflags: i32,
    /// Host SOCK_* value for sockets, zero otherwise.
    pub socktype: i32,
    /// Suppresses syscall restart when a receive timeout is armed.
    pub norestart: bool,
    lock: Mutex<()>,
    ops: &'static dyn FdOps,
}

impl std::fmt::Debug for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fd")
            .field("fildes", &self.fildes)
            .field("oflags", &self.oflags)
            .field("socktype", &self.socktype)
            .field("norestart", &self.norestart)
            .finish()
    }
}

impl Fd {
    /// Serializes multi-step operations on this descriptor.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn ops(&self) -> &'static dyn FdOps {
        self.ops
    }
}

/// The descriptor list, most recently used first.
pub struct Fds {
    list: Mutex<Vec<Arc<Fd>>>,
}

impl Fds {
    pub fn new() -> Fds {
        Fds {
            list: Mutex::new(Vec::new()),
        }
    }

    /// Adds a host descriptor with the host ops vtable.
    pub fn add(&self, fildes: RawFd, oflags: i32) -> Result<Arc<Fd>, Errno> {
        self.add_with(fildes, oflags, 0, false, host_ops())
    }

    /// Adds a descriptor with an explicit capability record.
    pub fn add_with(
        &self,
        fildes: RawFd,
        oflags: i32,
        socktype: i32,
        norestart: bool,
        ops: &'static dyn FdOps,
    ) -> Result<Arc<Fd>, Errno> {
        if fildes < 0 {
            return Err(Errno::EINVAL);
        }
        let fd = Arc::new(Fd {
            fildes,
            oflags,
            socktype,
            norestart,
            lock: Mutex::new(()),
            ops,
        });
        self.list.lock().insert(0, fd.clone());
        Ok(fd)
    }

    /// Adds a descriptor inheriting socket metadata from `orig`, for dup and
    /// fork paths.
    pub fn fork_fd(
        &self,
        orig: Option<&Fd>,
        fildes: RawFd,
        oflags: i32,
    ) -> Result<Arc<Fd>, Errno> {
        let (socktype, norestart, ops) = match orig {
            Some(fd) => (fd.socktype, fd.norestart, fd.ops),
            None => (0, false, host_ops()),
        };
        self.add_with(fildes, oflags, socktype, norestart, ops)
    }

    /// Looks up a descriptor, promoting it to the front of the list.
    pub fn get(&self, fildes: RawFd) -> Result<Arc<Fd>, Errno> {
        if fildes >= 0 {
            let mut list = self.list.lock();
            if let Some(pos) = list.iter().position(|fd| fd.fildes == fildes) {
                let fd = list.remove(pos);
                list.insert(0, fd.clone());
                return Ok(fd);
            }
        }
        Err(Errno::EBADF)
    }

    /// Drops a descriptor from the table, returning it so the caller can
    /// finish closing through its ops.
    pub fn remove(&self, fildes: RawFd) -> Result<Arc<Fd>, Errno> {
        let mut list = self.list.lock();
        match list.iter().position(|fd| fd.fildes == fildes) {
            Some(pos) => Ok(list.remove(pos)),
            None => Err(Errno::EBADF),
        }
    }

    pub fn count(&self) -> usize {
        self.list.lock().len()
    }
}

impl Default for Fds {
    fn default() -> Self {
        Fds::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_descriptors_are_ebadf() {
        let fds = Fds::new();
        assert_eq!(fds.get(7).unwrap_err(), Errno::EBADF);
        assert_eq!(fds.get(-1).unwrap_err(), Errno::EBADF);
        assert_eq!(fds.remove(7).unwrap_err(), Errno::EBADF);
    }

    #[test]
    fn negative_descriptors_are_rejected_at_insert() {
        let fds = Fds::new();
        assert_eq!(fds.add(-3, 0).unwrap_err(), Errno::EINVAL);
    }

    #[test]
    fn lookups_promote_to_most_recently_used() {
        let fds = Fds::new();
        fds.add(10, libc::O_RDONLY).unwrap();
        fds.add(11, libc::O_WRONLY).unwrap();
        fds.add(12, libc::O_RDWR).unwrap();
        assert_eq!(fds.count(), 3);

        let fd = fds.get(10).unwrap();
        assert_eq!(fd.oflags, libc::O_RDONLY);
        // An immediate repeat lookup hits the front slot.
        assert_eq!(fds.list.lock()[0].fildes, 10);
    }

    #[test]
    fn fork_fd_carries_socket_metadata() {
        let fds = Fds::new();
        let orig = fds
            .add_with(20, libc::O_RDWR, libc::SOCK_STREAM, true, host_ops())
            .unwrap();
        let forked = fds.fork_fd(Some(&orig), 21, libc::O_RDWR).unwrap();
        assert_eq!(forked.socktype, libc::SOCK_STREAM);
        assert!(forked.norestart);

        let plain = fds.fork_fd(None, 22, libc::O_RDONLY).unwrap();
        assert_eq!(plain.socktype, 0);
        assert!(!plain.norestart);
    }

    #[test]
    fn host_ops_round_trip_a_pipe() {
        let mut fds = [0i32; 2];
        // SAFETY: fds is an owned array.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ops = HostFdOps;
        let n = ops
            .writev(fds[1], &[IoSlice::new(b"abc"), IoSlice::new(b"def")])
            .unwrap();
        assert_eq!(n, 6);
        let revents = ops.poll(fds[0], libc::POLLIN, 0).unwrap();
        assert_ne!(revents & libc::POLLIN, 0);
        let mut buf = [0u8; 8];
        let n = ops
            .readv(fds[0], &mut [IoSliceMut::new(&mut buf)])
            .unwrap();
        assert_eq!(&buf[..n], b"abcdef");
        ops.close(fds[0]).unwrap();
        ops.close(fds[1]).unwrap();
    }
}
