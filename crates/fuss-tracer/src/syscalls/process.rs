//! Process-level syscalls that feed the per-tracee state: chdir/fchdir cwd
//! tracking and execve/execveat redirection.

use std::os::fd::RawFd;

use super::{SyscallCtx, AT_FDCWD_ARG, SCRATCH_PRIMARY};
use crate::path::AT_FDCWD;
use crate::PendingChdir;

/// chdir is rewritten like any other intercepted path, but the cwd the
/// supervisor records is the mountpoint-view absolute path, so later
/// relative paths resolve back into the overlay.
pub(crate) fn chdir_entry(ctx: &mut SyscallCtx) {
    let path_addr = ctx.arg(0);
    let Some(raw) = ctx.read_path(path_addr) else {
        return;
    };
    if raw.is_empty() {
        return;
    }
    let host = ctx.resolve_host(AT_FDCWD, &raw);

    if ctx.mount.should_intercept(&host) {
        let vpath = ctx.mount.translate(&host);
        match ctx.overlay.resolve_for_stat(&vpath) {
            Ok(backing) => {
                ctx.rewrite_path(0, &backing, SCRATCH_PRIMARY);
            }
            Err(e) => {
                ctx.skip_errno(e.errno());
                return;
            }
        }
    }

    ctx.proc.pending_chdir = Some(PendingChdir::Path(host));
}

pub(crate) fn fchdir_entry(ctx: &mut SyscallCtx) {
    let fd = ctx.arg(0) as RawFd;
    ctx.proc.pending_chdir = Some(PendingChdir::Fd(fd));
}

pub(crate) fn chdir_exit(ctx: &mut SyscallCtx, pending: PendingChdir, ret: i64) {
    if ret != 0 {
        return;
    }
    match pending {
        PendingChdir::Path(path) => ctx.proc.cwd = path,
        PendingChdir::Fd(fd) => {
            if let Some(path) = ctx.proc.fd_paths.get(&fd).cloned() {
                ctx.proc.cwd = path;
            }
        }
    }
}

/// execve resolves to a backing path without copy-up; the kernel loads the
/// image from the upper or lower layer directly.
pub(crate) fn execve_entry(ctx: &mut SyscallCtx) {
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

pub(crate) fn execveat_entry(ctx: &mut SyscallCtx) {
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
