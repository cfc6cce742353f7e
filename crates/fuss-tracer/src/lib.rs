//! # fuss-tracer
//!
//! ptrace supervisor for the fuss overlay.
//!
//! The [`Tracer`] launches a command with the trace-me flag set, then drives
//! every process in the resulting tree between syscall-entry and
//! syscall-exit stops. At each stop the dispatcher decides whether the
//! syscall touches the virtual mountpoint and, if so, either rewrites its
//! path arguments to overlay backing paths (letting the kernel do the real
//! I/O) or suppresses it and synthesizes the result.
//!
//! All ptrace control runs on the one thread that spawned the child: many
//! kernels tie tracee ownership to the attaching thread.

pub mod arch;
pub mod fdtable;
pub mod memory;
pub mod path;
mod syscalls;

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, trace, warn};

use fuss_overlay::OverlayFs;

use fdtable::FdTable;
use path::MountResolver;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: io::Error,
    },

    #[error("ptrace setup failed: {0}")]
    Setup(Errno),

    #[error("wait failed: {0}")]
    Wait(Errno),
}

pub type Result<T> = std::result::Result<T, TraceError>;

/// Cross-stop state for an open in flight.
pub(crate) struct PendingOpen {
    /// Resolved absolute path in the mountpoint view, recorded under the
    /// returned descriptor for later dirfd-relative resolution.
    pub host_path: String,
    /// Set when the open was redirected with `O_DIRECTORY`: the descriptor
    /// must serve the merged listing for this virtual directory.
    pub dir_vpath: Option<String>,
}

pub(crate) struct PendingDup {
    pub oldfd: RawFd,
}

pub(crate) enum PendingChdir {
    Path(String),
    Fd(RawFd),
}

/// Per-tracee bookkeeping. Created when a pid first appears in the trace
/// loop, dropped when it exits.
pub(crate) struct ProcessState {
    pub cwd: String,
    pub fd_paths: HashMap<RawFd, String>,
    /// Toggled on each syscall-stop; entry and exit alternate strictly per
    /// pid.
    pub in_syscall: bool,
    /// Whether the initial stop handshake has been consumed.
    pub attached: bool,
    pub pending_open: Option<PendingOpen>,
    pub pending_dup: Option<PendingDup>,
    pub pending_chdir: Option<PendingChdir>,
    /// Synthesized return value queued by a suppressed syscall.
    pub pending_result: Option<i64>,
}

impl ProcessState {
    fn new(cwd: String, attached: bool) -> Self {
        Self {
            cwd,
            fd_paths: HashMap::new(),
            in_syscall: false,
            attached,
            pending_open: None,
            pending_dup: None,
            pending_chdir: None,
            pending_result: None,
        }
    }
}

pub struct Tracer {
    overlay: OverlayFs,
    resolver: MountResolver,
    fd_table: FdTable,
    procs: HashMap<Pid, ProcessState>,
}

impl Tracer {
    pub fn new(overlay: OverlayFs, mountpoint: &Path) -> Self {
        Self {
            overlay,
            resolver: MountResolver::new(mountpoint),
            fd_table: FdTable::new(),
            procs: HashMap::new(),
        }
    }

    /// Runs `argv` under supervision and returns the root command's exit
    /// code (`128 + signal` if it died on a signal).
    pub fn run(&mut self, argv: &[String]) -> Result<i32> {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        unsafe {
            cmd.pre_exec(|| {
                ptrace::traceme().map_err(|e| io::Error::from_raw_os_error(e as i32))
            });
        }

        let child = cmd.spawn().map_err(|source| TraceError::Spawn {
            command: argv[0].clone(),
            source,
        })?;
        let root = Pid::from_raw(child.id() as i32);

        // The child stops with SIGTRAP at its execve.
        waitpid(root, None).map_err(TraceError::Wait)?;
        ptrace::setoptions(root, Self::options()).map_err(TraceError::Setup)?;

        let cwd = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "/".to_string());
        self.procs.insert(root, ProcessState::new(cwd, true));

        let code = self.trace_loop(root);
        self.fd_table.close_all();
        code
    }

    fn options() -> ptrace::Options {
        ptrace::Options::PTRACE_O_TRACESYSGOOD
            | ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK
            | ptrace::Options::PTRACE_O_TRACEEXEC
    }

    fn trace_loop(&mut self, root: Pid) -> Result<i32> {
        let mut root_code = 0;
        resume(root, None);

        while !self.procs.is_empty() {
            let status = match waitpid(None, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(TraceError::Wait(e)),
            };

            match status {
                WaitStatus::Exited(pid, code) => {
                    trace!(%pid, code, "tracee exited");
                    if pid == root {
                        root_code = code;
                    }
                    self.procs.remove(&pid);
                }
                WaitStatus::Signaled(pid, sig, _) => {
                    trace!(%pid, signal = %sig, "tracee killed by signal");
                    if pid == root {
                        root_code = 128 + sig as i32;
                    }
                    self.procs.remove(&pid);
                }
                WaitStatus::PtraceSyscall(pid) => {
                    self.ensure_proc(pid);
                    self.handle_syscall(pid);
                    resume(pid, None);
                }
                WaitStatus::PtraceEvent(pid, _, event) => {
                    self.ensure_proc(pid);
                    if matches!(
                        event,
                        libc::PTRACE_EVENT_FORK
                            | libc::PTRACE_EVENT_VFORK
                            | libc::PTRACE_EVENT_CLONE
                    ) {
                        if let Ok(raw) = ptrace::getevent(pid) {
                            self.register_child(pid, Pid::from_raw(raw as i32));
                        }
                    }
                    resume(pid, None);
                }
                WaitStatus::Stopped(pid, sig) => {
                    self.ensure_proc(pid);
                    let attached = self.procs.get(&pid).map(|p| p.attached).unwrap_or(true);
                    match sig {
                        Signal::SIGSTOP if !attached => {
                            // First-stop handshake of a freshly attached
                            // child.
                            if let Some(proc) = self.procs.get_mut(&pid) {
                                proc.attached = true;
                            }
                            resume(pid, None);
                        }
                        // Swallow terminal job-control signals so
                        // interactive shells survive being traced.
                        Signal::SIGTTIN | Signal::SIGTTOU | Signal::SIGTSTP => resume(pid, None),
                        Signal::SIGTRAP => resume(pid, None),
                        other => resume(pid, Some(other)),
                    }
                }
                _ => {}
            }
        }

        Ok(root_code)
    }

    /// Registers a pid the loop has not seen yet (a child stopping before
    /// its parent's clone event was handled).
    fn ensure_proc(&mut self, pid: Pid) {
        if self.procs.contains_key(&pid) {
            return;
        }
        let cwd = std::fs::read_link(format!("/proc/{pid}/cwd"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "/".to_string());
        debug!(%pid, %cwd, "registering unseen tracee");
        self.procs.insert(pid, ProcessState::new(cwd, false));
        let _ = ptrace::setoptions(pid, Self::options());
    }

    /// Registers a clone-family child with a copy of the parent's cwd and
    /// descriptor map; the virtual FD table is process-wide already.
    fn register_child(&mut self, parent: Pid, child: Pid) {
        if self.procs.contains_key(&child) {
            return;
        }
        let (cwd, fd_paths) = match self.procs.get(&parent) {
            Some(p) => (p.cwd.clone(), p.fd_paths.clone()),
            None => ("/".to_string(), HashMap::new()),
        };
        trace!(%parent, %child, "tracee forked");
        let mut state = ProcessState::new(cwd, false);
        state.fd_paths = fd_paths;
        self.procs.insert(child, state);
    }

    fn handle_syscall(&mut self, pid: Pid) {
        let regs = match arch::get_regs(pid) {
            Ok(regs) => regs,
            Err(e) => {
                warn!(%pid, error = %e, "failed to read tracee registers");
                return;
            }
        };

        let Tracer {
            overlay,
            resolver,
            fd_table,
            procs,
        } = self;
        let Some(proc) = procs.get_mut(&pid) else {
            return;
        };

        let entering = !proc.in_syscall;
        proc.in_syscall = entering;

        let mut ctx = syscalls::SyscallCtx {
            overlay,
            mount: resolver,
            fds: fd_table,
            proc,
            pid,
            regs,
            dirty: false,
        };
        if entering {
            syscalls::handle_entry(&mut ctx);
        } else {
            syscalls::handle_exit(&mut ctx);
        }
        if ctx.dirty {
            if let Err(e) = arch::set_regs(pid, &ctx.regs) {
                debug!(%pid, error = %e, "failed to write tracee registers");
            }
        }
    }
}

/// Resumes a tracee until its next syscall stop, optionally re-injecting a
/// signal. Failures (typically ESRCH races with exit) are ignored; the wait
/// loop observes the outcome either way.
fn resume(pid: Pid, sig: Option<Signal>) {
    let _ = ptrace::syscall(pid, sig);
}
