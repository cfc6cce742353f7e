//! Read-only metadata syscalls: the stat family, statfs, access, and xattr
//! reads. All follow the same shape: resolve the backing path and rewrite,
//! or synthesize the resolver's errno.

use std::os::fd::RawFd;

use super::{SyscallCtx, AT_FDCWD_ARG, SCRATCH_PRIMARY};
use crate::path::AT_FDCWD;

/// Shared entry handler: rewrites the path argument at `path_arg` (clearing
/// the dirfd argument at `dirfd_arg`, if any) to the resolved backing path.
fn resolve_and_rewrite(
    ctx: &mut SyscallCtx,
    dirfd: RawFd,
    path_addr: u64,
    path_arg: usize,
    dirfd_arg: Option<usize>,
) {
    let Some((_, vpath)) = ctx.read_vpath_at(dirfd, path_addr) else {
        return;
    };
    match ctx.overlay.resolve_for_stat(&vpath) {
        Ok(backing) => {
            if ctx.rewrite_path(path_arg, &backing, SCRATCH_PRIMARY) {
                if let Some(idx) = dirfd_arg {
                    ctx.set_arg(idx, AT_FDCWD_ARG);
                }
            }
        }
        Err(e) => ctx.skip_errno(e.errno()),
    }
}

/// stat and lstat: same argument layout, and the kernel applies the
/// follow/no-follow distinction to the rewritten backing path.
pub(crate) fn stat_entry(ctx: &mut SyscallCtx) {
    let path_addr = ctx.arg(0);
    resolve_and_rewrite(ctx, AT_FDCWD, path_addr, 0, None);
}

/// newfstatat and statx: (dirfd, path, ...). `AT_SYMLINK_NOFOLLOW` in the
/// flags argument keeps working against the backing path.
pub(crate) fn fstatat_entry(ctx: &mut SyscallCtx) {
    let dirfd = ctx.arg(0) as RawFd;
    let path_addr = ctx.arg(1);
    resolve_and_rewrite(ctx, dirfd, path_addr, 1, Some(0));
}

pub(crate) fn statfs_entry(ctx: &mut SyscallCtx) {
    let path_addr = ctx.arg(0);
    resolve_and_rewrite(ctx, AT_FDCWD, path_addr, 0, None);
}

pub(crate) fn access_entry(ctx: &mut SyscallCtx) {
    let path_addr = ctx.arg(0);
    resolve_and_rewrite(ctx, AT_FDCWD, path_addr, 0, None);
}

pub(crate) fn faccessat2_entry(ctx: &mut SyscallCtx) {
    let dirfd = ctx.arg(0) as RawFd;
    let path_addr = ctx.arg(1);
    resolve_and_rewrite(ctx, dirfd, path_addr, 1, Some(0));
}

/// getxattr, lgetxattr, listxattr, llistxattr all carry the path first.
pub(crate) fn xattr_entry(ctx: &mut SyscallCtx) {
    let path_addr = ctx.arg(0);
    resolve_and_rewrite(ctx, AT_FDCWD, path_addr, 0, None);
}
