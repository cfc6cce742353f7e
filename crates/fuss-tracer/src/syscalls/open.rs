//! open/openat redirection plus the descriptor-lifecycle hooks (close, dup
//! family).

use std::os::fd::RawFd;

use nix::fcntl::OFlag;
use tracing::trace;

use super::{SyscallCtx, AT_FDCWD_ARG, SCRATCH_PRIMARY};
use crate::path::AT_FDCWD;
use crate::{PendingDup, PendingOpen};

pub(crate) fn open_entry(ctx: &mut SyscallCtx) {
    let path_addr = ctx.arg(0);
    let flags = ctx.arg(1) as i32;
    open_common(ctx, AT_FDCWD, path_addr, flags, 0, None);
}

pub(crate) fn openat_entry(ctx: &mut SyscallCtx) {
    let dirfd = ctx.arg(0) as RawFd;
    let path_addr = ctx.arg(1);
    let flags = ctx.arg(2) as i32;
    open_common(ctx, dirfd, path_addr, flags, 1, Some(0));
}

fn open_common(
    ctx: &mut SyscallCtx,
    dirfd: RawFd,
    path_addr: u64,
    raw_flags: i32,
    path_arg: usize,
    dirfd_arg: Option<usize>,
) {
    let Some(raw) = ctx.read_path(path_addr) else {
        return;
    };
    if raw.is_empty() {
        return;
    }
    let host = ctx.resolve_host(dirfd, &raw);
    let flags = OFlag::from_bits_truncate(raw_flags);

    let mut dir_vpath = None;
    if ctx.mount.should_intercept(&host) {
        let vpath = ctx.mount.translate(&host);
        match ctx.overlay.resolve_for_open(&vpath, flags) {
            Ok(backing) => {
                trace!(pid = %ctx.pid, %vpath, backing = %backing.display(), "open redirected");
                if !ctx.rewrite_path(path_arg, &backing, SCRATCH_PRIMARY) {
                    return;
                }
                if let Some(idx) = dirfd_arg {
                    ctx.set_arg(idx, AT_FDCWD_ARG);
                }
                if flags.contains(OFlag::O_DIRECTORY) {
                    dir_vpath = Some(vpath);
                }
            }
            Err(e) => {
                ctx.skip_errno(e.errno());
                return;
            }
        }
    }

    // Recorded for every open so dirfd-relative paths resolve later, inside
    // the mountpoint or not.
    ctx.proc.pending_open = Some(PendingOpen {
        host_path: host,
        dir_vpath,
    });
}

pub(crate) fn open_exit(ctx: &mut SyscallCtx, pending: PendingOpen, ret: i64) {
    if ret < 0 {
        return;
    }
    let fd = ret as RawFd;
    ctx.proc.fd_paths.insert(fd, pending.host_path);
    if let Some(vpath) = pending.dir_vpath {
        ctx.fds.track_dir(fd, &vpath);
    }
}

/// close is never redirected; the kernel closes the descriptor and the
/// supervisor just forgets its bookkeeping.
pub(crate) fn close_entry(ctx: &mut SyscallCtx) {
    let fd = ctx.arg(0) as RawFd;
    ctx.proc.fd_paths.remove(&fd);
    ctx.fds.close(fd);
}

pub(crate) fn dup_entry(ctx: &mut SyscallCtx) {
    let oldfd = ctx.arg(0) as RawFd;
    ctx.proc.pending_dup = Some(PendingDup { oldfd });
}

/// dup2 and dup3 share the layout; the kernel returns the new descriptor,
/// which is all the exit hook needs.
pub(crate) fn dup2_entry(ctx: &mut SyscallCtx) {
    let oldfd = ctx.arg(0) as RawFd;
    ctx.proc.pending_dup = Some(PendingDup { oldfd });
}

pub(crate) fn dup_exit(ctx: &mut SyscallCtx, pending: PendingDup, ret: i64) {
    if ret < 0 {
        return;
    }
    let newfd = ret as RawFd;
    if newfd == pending.oldfd {
        return;
    }
    ctx.fds.dup(pending.oldfd, newfd);
    match ctx.proc.fd_paths.get(&pending.oldfd).cloned() {
        Some(path) => {
            ctx.proc.fd_paths.insert(newfd, path);
        }
        None => {
            ctx.proc.fd_paths.remove(&newfd);
        }
    }
}
