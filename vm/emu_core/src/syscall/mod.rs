// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest syscall entry shims owned by this subsystem.

mod open;
mod pipe;

pub use open::sys_openat;
pub use pipe::sys_pipe2;

use crate::machine::Machine;
use linuxdefs::fcntl::AT_FDCWD;
use linuxdefs::Errno;

/// Resolves a guest dirfd argument to the host descriptor openat expects.
fn get_dir_fildes(m: &Machine, dirfildes: i32) -> Result<i32, Errno> {
    if dirfildes == AT_FDCWD {
        Ok(libc::AT_FDCWD)
    } else {
        Ok(m.system.fds.get(dirfildes)?.fildes)
    }
}
