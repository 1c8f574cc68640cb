// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The pipe2 shim.

use crate::machine::Machine;
use crate::vmem::Access;
use linuxdefs::fcntl;
use linuxdefs::Errno;
use pal::unix::SyscallResult;

/// Creates a pipe, inserts both ends into the descriptor table, and writes
/// the two little-endian 32-bit descriptor numbers at `pipefds_addr`.
///
/// Flagged creation takes the exec lock so a concurrent fork/exec cannot
/// observe one end with close-on-exec and the other without.
pub fn sys_pipe2(m: &mut Machine, pipefds_addr: i64, flags: i32) -> Result<(), Errno> {
    let supported = fcntl::O_CLOEXEC | fcntl::O_NDELAY;
    if flags & !supported != 0 {
        tracing::debug!(flags = flags & !supported, "pipe2 flags not supported");
        return Err(Errno::EINVAL);
    }
    if !m.system.is_valid_memory(pipefds_addr, 8, Access::Write) {
        return Err(Errno::EFAULT);
    }
    let _exec = (flags != 0).then(|| m.system.exec_lock.lock());
    let mut fds = [0i32; 2];
    // SAFETY: fds is an owned array.
    unsafe { libc::pipe(fds.as_mut_ptr()) }
        .syscall_result()
        .map_err(|e| Errno::from_host(e.0))?;
    let mut oflags = 0;
    if flags & fcntl::O_CLOEXEC != 0 {
        oflags |= libc::O_CLOEXEC;
        for fd in fds {
            // SAFETY: fd was just created by pipe.
            unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) }
                .syscall_result()
                .expect("F_SETFD on a fresh pipe");
        }
    }
    if flags & fcntl::O_NDELAY != 0 {
        oflags |= libc::O_NONBLOCK;
        for fd in fds {
            // SAFETY: fd was just created by pipe.
            unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) }
                .syscall_result()
                .expect("F_SETFL on a fresh pipe");
        }
    }
    m.system
        .fds
        .add(fds[0], libc::O_RDONLY | oflags)
        .expect("fresh pipe fd");
    m.system
        .fds
        .add(fds[1], libc::O_WRONLY | oflags)
        .expect("fresh pipe fd");
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&fds[0].to_le_bytes());
    out[4..].copy_from_slice(&fds[1].to_le_bytes());
    m.system
        .copy_to_guest(pipefds_addr, &out)
        .expect("pipefds address was probed above");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagetable::set_protection;
    use crate::system::CpuMode;
    use crate::system::System;
    use crate::system::SystemOptions;
    use linuxdefs::mman::PROT_READ;
    use linuxdefs::mman::PROT_WRITE;

    #[test]
    fn writes_descriptors_little_endian_and_applies_flags() {
        let s = System::new(
            CpuMode::Long,
            SystemOptions {
                nolinear: true,
                ..Default::default()
            },
        )
        .unwrap();
        let mut m = crate::Machine::new(&s, None);
        let key = set_protection(PROT_READ | PROT_WRITE);
        s.reserve_virtual(0x100_0000, 0x1000, key, None, 0, false).unwrap();

        let addr = 0x100_0010;
        sys_pipe2(&mut m, addr, fcntl::O_CLOEXEC | fcntl::O_NDELAY).unwrap();

        let mut out = [0u8; 8];
        s.copy_from_guest(&mut out, addr).unwrap();
        let rd = i32::from_le_bytes(out[..4].try_into().unwrap());
        let wr = i32::from_le_bytes(out[4..].try_into().unwrap());
        assert!(rd >= 0 && wr >= 0 && rd != wr);
        assert_eq!(s.fds.count(), 2);

        // Both ends carry close-on-exec and nonblocking on the host.
        for fd in [rd, wr] {
            // SAFETY: querying flags of descriptors created above.
            unsafe {
                assert_eq!(libc::fcntl(fd, libc::F_GETFD) & libc::FD_CLOEXEC, libc::FD_CLOEXEC);
                assert_ne!(libc::fcntl(fd, libc::F_GETFL) & libc::O_NONBLOCK, 0);
                libc::close(fd);
            }
        }
    }

    #[test]
    fn unknown_flags_and_bad_addresses_fail() {
        let s = System::new(
            CpuMode::Long,
            SystemOptions {
                nolinear: true,
                ..Default::default()
            },
        )
        .unwrap();
        let mut m = crate::Machine::new(&s, None);
        assert_eq!(
            sys_pipe2(&mut m, 0x100_0000, fcntl::O_DIRECT),
            Err(Errno::EINVAL)
        );
        assert_eq!(sys_pipe2(&mut m, 0x100_0000, 0), Err(Errno::EFAULT));
    }
}
