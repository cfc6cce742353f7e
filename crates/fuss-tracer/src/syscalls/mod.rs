//! Syscall dispatch.
//!
//! Invoked twice per traced syscall, at entry and exit. Two redirection
//! strategies exist:
//!
//! * **Rewrite**: the overlay prepares a backing path, the dispatcher writes
//!   it into scratch space below the tracee's stack pointer and points the
//!   path argument register at it, and the kernel executes the real syscall.
//!   `*at` dirfd arguments are overwritten with `AT_FDCWD` since the
//!   rewritten path is absolute.
//! * **Skip and synthesize**: for effects the kernel cannot infer (whiteout
//!   deletion, merged listings) the overlay performs the operation, the
//!   syscall number is replaced with `getpid` (no arguments touched, always
//!   succeeds), and the queued result overwrites the return register at
//!   exit.

pub(crate) mod dir;
pub(crate) mod open;
pub(crate) mod path_ops;
pub(crate) mod process;
pub(crate) mod stat;

use std::os::fd::RawFd;
use std::path::Path;

use nix::errno::Errno;
use nix::unistd::Pid;
use tracing::{debug, trace};

use fuss_overlay::OverlayFs;

use crate::arch::{self, nr, Regs};
use crate::fdtable::FdTable;
use crate::memory;
use crate::path::MountResolver;
use crate::ProcessState;

/// Longest path the dispatcher reads out of or writes into a tracee.
pub(crate) const PATH_MAX: usize = 4096;

/// Scratch displacements below the stack pointer for rewritten paths. Both
/// exceed [`PATH_MAX`], so a path written at the secondary slot cannot run
/// into the primary one.
pub(crate) const SCRATCH_PRIMARY: u64 = 4096;
pub(crate) const SCRATCH_SECONDARY: u64 = 8192;

/// `AT_FDCWD` sign-extended the way the kernel reads 32-bit syscall args.
pub(crate) const AT_FDCWD_ARG: u64 = libc::AT_FDCWD as i64 as u64;

pub(crate) struct SyscallCtx<'a> {
    pub overlay: &'a OverlayFs,
    pub mount: &'a MountResolver,
    pub fds: &'a FdTable,
    pub proc: &'a mut ProcessState,
    pub pid: Pid,
    pub regs: Regs,
    /// Set when `regs` diverged from the tracee and needs a SETREGS.
    pub dirty: bool,
}

impl SyscallCtx<'_> {
    pub(crate) fn arg(&self, idx: usize) -> u64 {
        match idx {
            0 => arch::arg0(&self.regs),
            1 => arch::arg1(&self.regs),
            2 => arch::arg2(&self.regs),
            3 => arch::arg3(&self.regs),
            _ => unreachable!("argument index out of view"),
        }
    }

    pub(crate) fn set_arg(&mut self, idx: usize, v: u64) {
        match idx {
            0 => arch::set_arg0(&mut self.regs, v),
            1 => arch::set_arg1(&mut self.regs, v),
            2 => arch::set_arg2(&mut self.regs, v),
            3 => arch::set_arg3(&mut self.regs, v),
            _ => unreachable!("argument index out of view"),
        }
        self.dirty = true;
    }

    /// Reads the NUL-terminated path argument at `addr`.
    pub(crate) fn read_path(&self, addr: u64) -> Option<String> {
        memory::read_string(self.pid, addr, PATH_MAX)
    }

    /// Resolves a raw tracee path against the process cwd and `dirfd`.
    pub(crate) fn resolve_host(&self, dirfd: RawFd, raw: &str) -> String {
        self.mount
            .resolve_at(dirfd, raw, &self.proc.cwd, &self.proc.fd_paths)
    }

    /// Reads and resolves the path argument; yields the (host absolute,
    /// virtual) pair only when it falls inside the mountpoint.
    pub(crate) fn read_vpath_at(&self, dirfd: RawFd, addr: u64) -> Option<(String, String)> {
        let raw = self.read_path(addr)?;
        if raw.is_empty() {
            return None;
        }
        let host = self.resolve_host(dirfd, &raw);
        if !self.mount.should_intercept(&host) {
            return None;
        }
        let vpath = self.mount.translate(&host);
        Some((host, vpath))
    }

    /// Places `backing` as a NUL-terminated string in tracee scratch stack
    /// space; returns its address. None (registers untouched, redirection
    /// abandoned) if the path is not representable or the write fails, in
    /// which case the kernel runs the original syscall.
    pub(crate) fn write_scratch(&mut self, backing: &Path, slot: u64) -> Option<u64> {
        let s = backing.to_str()?;
        if s.len() >= PATH_MAX {
            return None;
        }
        let addr = arch::sp(&self.regs).wrapping_sub(slot);
        match memory::write_string(self.pid, addr, s) {
            Ok(()) => Some(addr),
            Err(e) => {
                debug!(pid = %self.pid, path = s, error = %e, "scratch write failed; syscall left unredirected");
                None
            }
        }
    }

    /// Single-path rewrite: scratch write plus argument redirect.
    pub(crate) fn rewrite_path(&mut self, arg_idx: usize, backing: &Path, slot: u64) -> bool {
        match self.write_scratch(backing, slot) {
            Some(addr) => {
                self.set_arg(arg_idx, addr);
                true
            }
            None => false,
        }
    }

    /// Suppresses the syscall (replacing it with `getpid`) and queues the
    /// synthesized return value for the exit stop.
    pub(crate) fn skip_with(&mut self, result: i64) {
        arch::set_sysno(&mut self.regs, nr::GETPID);
        self.proc.pending_result = Some(result);
        self.dirty = true;
    }

    pub(crate) fn skip_errno(&mut self, errno: Errno) {
        self.skip_with(-(errno as i64));
    }
}

pub(crate) fn handle_entry(ctx: &mut SyscallCtx) {
    let sysno = arch::sysno(&ctx.regs);
    trace!(pid = %ctx.pid, sysno, "syscall entry");
    match sysno {
        nr::OPEN => open::open_entry(ctx),
        nr::OPENAT => open::openat_entry(ctx),
        nr::CLOSE => open::close_entry(ctx),
        nr::DUP => open::dup_entry(ctx),
        nr::DUP2 | nr::DUP3 => open::dup2_entry(ctx),
        nr::STAT | nr::LSTAT => stat::stat_entry(ctx),
        nr::NEWFSTATAT | nr::STATX => stat::fstatat_entry(ctx),
        nr::STATFS => stat::statfs_entry(ctx),
        nr::ACCESS => stat::access_entry(ctx),
        nr::FACCESSAT2 => stat::faccessat2_entry(ctx),
        nr::GETXATTR | nr::LGETXATTR | nr::LISTXATTR | nr::LLISTXATTR => stat::xattr_entry(ctx),
        nr::MKDIRAT => path_ops::mkdirat_entry(ctx),
        nr::UNLINK => path_ops::unlink_entry(ctx),
        nr::RMDIR => path_ops::rmdir_entry(ctx),
        nr::UNLINKAT => path_ops::unlinkat_entry(ctx),
        nr::RENAME => path_ops::rename_entry(ctx),
        nr::RENAMEAT | nr::RENAMEAT2 => path_ops::renameat_entry(ctx, sysno == nr::RENAMEAT2),
        nr::LINK => path_ops::link_entry(ctx),
        nr::LINKAT => path_ops::linkat_entry(ctx),
        nr::SYMLINKAT => path_ops::symlinkat_entry(ctx),
        nr::READLINK => path_ops::readlink_entry(ctx),
        nr::READLINKAT => path_ops::readlinkat_entry(ctx),
        nr::FCHMODAT => path_ops::fchmodat_entry(ctx),
        nr::FCHOWNAT => path_ops::fchownat_entry(ctx),
        nr::GETDENTS64 => dir::getdents64_entry(ctx),
        nr::CHDIR => process::chdir_entry(ctx),
        nr::FCHDIR => process::fchdir_entry(ctx),
        nr::EXECVE => process::execve_entry(ctx),
        nr::EXECVEAT => process::execveat_entry(ctx),
        _ => {}
    }
}

pub(crate) fn handle_exit(ctx: &mut SyscallCtx) {
    if let Some(result) = ctx.proc.pending_result.take() {
        arch::set_retval(&mut ctx.regs, result as u64);
        ctx.dirty = true;
    }

    let ret = arch::retval(&ctx.regs) as i64;

    if let Some(pending) = ctx.proc.pending_open.take() {
        open::open_exit(ctx, pending, ret);
    }
    if let Some(pending) = ctx.proc.pending_dup.take() {
        open::dup_exit(ctx, pending, ret);
    }
    if let Some(pending) = ctx.proc.pending_chdir.take() {
        process::chdir_exit(ctx, pending, ret);
    }
}
