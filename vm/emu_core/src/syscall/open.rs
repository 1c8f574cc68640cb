// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The openat shim, including O_TMPFILE emulation for hosts without it.

use super::get_dir_fildes;
use crate::machine::Machine;
use linuxdefs::fcntl;
use linuxdefs::Errno;
use pal::unix::while_eintr;
use pal::unix::SyscallResult;

/// Opens a guest path relative to `dirfildes`, translating flags, restarting
/// on host EINTR, and registering the result in the descriptor table.
pub fn sys_openat(
    m: &mut Machine,
    dirfildes: i32,
    path_addr: i64,
    oflags: i32,
    mode: i32,
) -> Result<i32, Errno> {
    if oflags & fcntl::O_TMPFILE == fcntl::O_TMPFILE {
        return sys_tmpfile(m, dirfildes, path_addr, oflags & !fcntl::O_TMPFILE, mode);
    }
    let sysflags = fcntl::xlat_open_flags(oflags)?;
    let path = m.system.load_str(path_addr)?;
    let dirfd = get_dir_fildes(m, dirfildes)?;
    let fildes = while_eintr(|| {
        // SAFETY: path is a NUL-terminated owned string.
        unsafe { libc::openat(dirfd, path.as_ptr(), sysflags, mode as libc::c_uint) }
            .syscall_result()
    })
    .map_err(|err| normalize_nofollow(err.0))?;
    m.system
        .fds
        .add(fildes, sysflags)
        .expect("fresh descriptor from openat");
    Ok(fildes)
}

/// Maps host divergences from POSIX back to the errno Linux uses when
/// O_NOFOLLOW hits a symlink.
fn normalize_nofollow(host: i32) -> Errno {
    #[cfg(target_os = "freebsd")]
    if host == libc::EMLINK {
        return Errno::ELOOP;
    }
    #[cfg(target_os = "netbsd")]
    if host == libc::EFTYPE {
        return Errno::ELOOP;
    }
    Errno::from_host(host)
}

/// Emulates O_TMPFILE: create a randomly named file in the target
/// directory, unlink it immediately, and hand back a descriptor renumbered
/// onto the directory descriptor with dup2.
///
/// Every host signal is blocked across the sequence so no handler can
/// observe the transient named file.
fn sys_tmpfile(
    m: &mut Machine,
    dirfildes: i32,
    path_addr: i64,
    oflags: i32,
    mode: i32,
) -> Result<i32, Errno> {
    let mut sysflags = libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC;
    match oflags & fcntl::O_ACCMODE {
        fcntl::O_RDWR => sysflags |= libc::O_RDWR,
        fcntl::O_WRONLY => sysflags |= libc::O_WRONLY,
        _ => {
            tracing::debug!("O_TMPFILE requires O_WRONLY or O_RDWR");
            return Err(Errno::EINVAL);
        }
    }
    let supported =
        fcntl::O_ACCMODE | fcntl::O_CLOEXEC | fcntl::O_EXCL | fcntl::O_LARGEFILE;
    if oflags & !supported != 0 {
        tracing::debug!(flags = oflags & !supported, "O_TMPFILE flags not supported");
        return Err(Errno::EINVAL);
    }
    let path = m.system.load_str(path_addr)?;
    let dirfd = get_dir_fildes(m, dirfildes)?;
    let _mask = pal::unix::block_all_signals().expect("blocking host signals");
    let tmpdir = while_eintr(|| {
        // SAFETY: path is a NUL-terminated owned string.
        unsafe {
            libc::openat(
                dirfd,
                path.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        }
        .syscall_result()
    })
    .map_err(|e| Errno::from_host(e.0))?;
    let name = random_name();
    // SAFETY: name is a NUL-terminated owned string.
    match unsafe { libc::openat(tmpdir, name.as_ptr(), sysflags, mode as libc::c_uint) }
        .syscall_result()
    {
        Ok(fildes) => {
            // SAFETY: the file was just created with this exact name.
            unsafe {
                libc::unlinkat(tmpdir, name.as_ptr(), 0)
                    .syscall_result()
                    .expect("unlink of fresh tmpfile");
                // Renumber the anonymous file onto the directory descriptor
                // and retire the original number.
                assert_eq!(
                    libc::dup2(fildes, tmpdir).syscall_result().expect("dup2"),
                    tmpdir
                );
                libc::close(fildes);
                if oflags & fcntl::O_CLOEXEC != 0 {
                    libc::fcntl(tmpdir, libc::F_SETFD, libc::FD_CLOEXEC)
                        .syscall_result()
                        .expect("F_SETFD on tmpfile");
                }
            }
            m.system
                .fds
                .add(tmpdir, oflags)
                .expect("fresh tmpfile descriptor");
            Ok(tmpdir)
        }
        Err(e) => {
            // SAFETY: tmpdir is the directory descriptor opened above.
            unsafe { libc::close(tmpdir) };
            Err(Errno::from_host(e.0))
        }
    }
}

/// Twelve base-36 characters drawn from the host entropy pool.
fn random_name() -> std::ffi::CString {
    let mut seed = [0u8; 8];
    getrandom::getrandom(&mut seed).expect("host entropy");
    let mut rng = u64::from_ne_bytes(seed);
    let mut name = [0u8; 12];
    for c in &mut name {
        *c = b"0123456789abcdefghijklmnopqrstuvwxyz"[(rng % 36) as usize];
        rng /= 36;
    }
    std::ffi::CString::new(&name[..]).unwrap()
}
