//! Path-mutating syscalls: creation, deletion, rename/link/symlink,
//! readlink, chmod/chown.
//!
//! Deletion is the one family the kernel cannot run for us: removing a name
//! that also exists in a lower layer must leave a whiteout, so the overlay
//! performs the whole operation and the syscall is suppressed.

use std::os::fd::RawFd;

use nix::errno::Errno;

use super::{SyscallCtx, AT_FDCWD_ARG, SCRATCH_PRIMARY, SCRATCH_SECONDARY};
use crate::arch;
use crate::path::AT_FDCWD;

pub(crate) fn mkdirat_entry(ctx: &mut SyscallCtx) {
    let dirfd = ctx.arg(0) as RawFd;
    let path_addr = ctx.arg(1);
    let Some((_, vpath)) = ctx.read_vpath_at(dirfd, path_addr) else {
        return;
    };
    match ctx.overlay.prepare_create(&vpath) {
        Ok(backing) => {
            if ctx.rewrite_path(1, &backing, SCRATCH_PRIMARY) {
                ctx.set_arg(0, AT_FDCWD_ARG);
            }
        }
        Err(e) => ctx.skip_errno(e.errno()),
    }
}

pub(crate) fn unlink_entry(ctx: &mut SyscallCtx) {
    let path_addr = ctx.arg(0);
    let Some((_, vpath)) = ctx.read_vpath_at(AT_FDCWD, path_addr) else {
        return;
    };
    unlink_vpath(ctx, &vpath, false);
}

pub(crate) fn rmdir_entry(ctx: &mut SyscallCtx) {
    let path_addr = ctx.arg(0);
    let Some((_, vpath)) = ctx.read_vpath_at(AT_FDCWD, path_addr) else {
        return;
    };
    unlink_vpath(ctx, &vpath, true);
}

pub(crate) fn unlinkat_entry(ctx: &mut SyscallCtx) {
    let dirfd = ctx.arg(0) as RawFd;
    let path_addr = ctx.arg(1);
    let flags = ctx.arg(2) as i32;
    let Some((_, vpath)) = ctx.read_vpath_at(dirfd, path_addr) else {
        return;
    };
    unlink_vpath(ctx, &vpath, flags & libc::AT_REMOVEDIR != 0);
}

fn unlink_vpath(ctx: &mut SyscallCtx, vpath: &str, rmdir: bool) {
    let result = if rmdir {
        ctx.overlay.prepare_rmdir(vpath)
    } else {
        ctx.overlay.prepare_unlink(vpath)
    };
    match result {
        Ok(()) => ctx.skip_with(0),
        Err(e) => ctx.skip_errno(e.errno()),
    }
}

/// Legacy rename(oldpath, newpath).
pub(crate) fn rename_entry(ctx: &mut SyscallCtx) {
    let old_addr = ctx.arg(0);
    let new_addr = ctx.arg(1);
    let old = ctx.read_vpath_at(AT_FDCWD, old_addr);
    let new = ctx.read_vpath_at(AT_FDCWD, new_addr);
    rename_common(ctx, old, new, (0, 1), None, None);
}

pub(crate) fn renameat_entry(ctx: &mut SyscallCtx, has_flags: bool) {
    let old_dirfd = ctx.arg(0) as RawFd;
    let old_addr = ctx.arg(1);
    let new_dirfd = ctx.arg(2) as RawFd;
    let new_addr = ctx.arg(3);

    let old = ctx.read_vpath_at(old_dirfd, old_addr);
    let new = ctx.read_vpath_at(new_dirfd, new_addr);
    let flags = if has_flags {
        Some(arch::arg4(&ctx.regs) as u32)
    } else {
        None
    };
    rename_common(ctx, old, new, (1, 3), Some((0, 2)), flags);
}

fn rename_common(
    ctx: &mut SyscallCtx,
    old: Option<(String, String)>,
    new: Option<(String, String)>,
    path_args: (usize, usize),
    dirfd_args: Option<(usize, usize)>,
    flags: Option<u32>,
) {
    let (old_vpath, new_vpath) = match (old, new) {
        (None, None) => return,
        (Some(_), None) | (None, Some(_)) => {
            // A rename may not cross the overlay boundary.
            ctx.skip_errno(Errno::EXDEV);
            return;
        }
        (Some((_, o)), Some((_, n))) => (o, n),
    };

    if let Some(flags) = flags {
        if flags & libc::RENAME_EXCHANGE as u32 != 0 {
            ctx.skip_errno(Errno::ENOSYS);
            return;
        }
        if flags & libc::RENAME_NOREPLACE as u32 != 0 && ctx.overlay.resolve(&new_vpath).is_ok() {
            ctx.skip_errno(Errno::EEXIST);
            return;
        }
    }

    match ctx.overlay.prepare_rename(&old_vpath, &new_vpath) {
        Ok((old_backing, new_backing)) => {
            rewrite_pair(ctx, &old_backing, &new_backing, path_args, dirfd_args);
        }
        Err(e) => ctx.skip_errno(e.errno()),
    }
}

/// Legacy link(oldpath, newpath).
pub(crate) fn link_entry(ctx: &mut SyscallCtx) {
    let old_addr = ctx.arg(0);
    let new_addr = ctx.arg(1);
    let old = ctx.read_vpath_at(AT_FDCWD, old_addr);
    let new = ctx.read_vpath_at(AT_FDCWD, new_addr);
    link_common(ctx, old, new, (0, 1), None);
}

pub(crate) fn linkat_entry(ctx: &mut SyscallCtx) {
    let old_dirfd = ctx.arg(0) as RawFd;
    let old_addr = ctx.arg(1);
    let new_dirfd = ctx.arg(2) as RawFd;
    let new_addr = ctx.arg(3);

    let old = ctx.read_vpath_at(old_dirfd, old_addr);
    let new = ctx.read_vpath_at(new_dirfd, new_addr);
    link_common(ctx, old, new, (1, 3), Some((0, 2)));
}

fn link_common(
    ctx: &mut SyscallCtx,
    old: Option<(String, String)>,
    new: Option<(String, String)>,
    path_args: (usize, usize),
    dirfd_args: Option<(usize, usize)>,
) {
    let (old_vpath, new_vpath) = match (old, new) {
        (None, None) => return,
        (Some(_), None) | (None, Some(_)) => {
            ctx.skip_errno(Errno::EXDEV);
            return;
        }
        (Some((_, o)), Some((_, n))) => (o, n),
    };

    match ctx.overlay.prepare_link(&old_vpath, &new_vpath) {
        Ok((old_backing, new_backing)) => {
            rewrite_pair(ctx, &old_backing, &new_backing, path_args, dirfd_args);
        }
        Err(e) => ctx.skip_errno(e.errno()),
    }
}

/// Writes both backing paths into their scratch slots before touching any
/// register, so a failed second write leaves the syscall fully unredirected.
fn rewrite_pair(
    ctx: &mut SyscallCtx,
    first: &std::path::Path,
    second: &std::path::Path,
    path_args: (usize, usize),
    dirfd_args: Option<(usize, usize)>,
) {
    let Some(first_addr) = ctx.write_scratch(first, SCRATCH_PRIMARY) else {
        return;
    };
    let Some(second_addr) = ctx.write_scratch(second, SCRATCH_SECONDARY) else {
        return;
    };
    ctx.set_arg(path_args.0, first_addr);
    ctx.set_arg(path_args.1, second_addr);
    if let Some((first_dirfd, second_dirfd)) = dirfd_args {
        ctx.set_arg(first_dirfd, AT_FDCWD_ARG);
        ctx.set_arg(second_dirfd, AT_FDCWD_ARG);
    }
}

/// symlinkat(target, newdirfd, linkpath): only the linkpath is overlay
/// territory; the target string is stored verbatim.
pub(crate) fn symlinkat_entry(ctx: &mut SyscallCtx) {
    let new_dirfd = ctx.arg(1) as RawFd;
    let link_addr = ctx.arg(2);
    let Some((_, vpath)) = ctx.read_vpath_at(new_dirfd, link_addr) else {
        return;
    };
    match ctx.overlay.prepare_symlink(&vpath) {
        Ok(backing) => {
            if ctx.rewrite_path(2, &backing, SCRATCH_PRIMARY) {
                ctx.set_arg(1, AT_FDCWD_ARG);
            }
        }
        Err(e) => ctx.skip_errno(e.errno()),
    }
}

pub(crate) fn readlink_entry(ctx: &mut SyscallCtx) {
    let path_addr = ctx.arg(0);
    let Some((_, vpath)) = ctx.read_vpath_at(AT_FDCWD, path_addr) else {
        return;
    };
    match ctx.overlay.resolve_for_stat(&vpath) {
        Ok(backing) => {
            ctx.rewrite_path(0, &backing, SCRATCH_PRIMARY);
        }
        Err(e) => ctx.skip_errno(e.errno()),
    }
}

pub(crate) fn readlinkat_entry(ctx: &mut SyscallCtx) {
    let dirfd = ctx.arg(0) as RawFd;
    let path_addr = ctx.arg(1);
    let Some((_, vpath)) = ctx.read_vpath_at(dirfd, path_addr) else {
        return;
    };
    match ctx.overlay.resolve_for_stat(&vpath) {
        Ok(backing) => {
            if ctx.rewrite_path(1, &backing, SCRATCH_PRIMARY) {
                ctx.set_arg(0, AT_FDCWD_ARG);
            }
        }
        Err(e) => ctx.skip_errno(e.errno()),
    }
}

/// fchmodat and fchownat mutate the entry in place, so the overlay copies it
/// up first and the kernel applies the change to the upper copy.
pub(crate) fn fchmodat_entry(ctx: &mut SyscallCtx) {
    prepare_write_at(ctx);
}

pub(crate) fn fchownat_entry(ctx: &mut SyscallCtx) {
    prepare_write_at(ctx);
}

fn prepare_write_at(ctx: &mut SyscallCtx) {
    let dirfd = ctx.arg(0) as RawFd;
    let path_addr = ctx.arg(1);
    let Some((_, vpath)) = ctx.read_vpath_at(dirfd, path_addr) else {
        return;
    };
    match ctx.overlay.prepare_write(&vpath) {
        Ok(backing) => {
            if ctx.rewrite_path(1, &backing, SCRATCH_PRIMARY) {
                ctx.set_arg(0, AT_FDCWD_ARG);
            }
        }
        Err(e) => ctx.skip_errno(e.errno()),
    }
}
