//! Per-architecture syscall ABI: numbers and a view over the tracee's
//! registers.
//!
//! Registers are transferred with `PTRACE_GETREGSET`/`PTRACE_SETREGSET`
//! (`NT_PRSTATUS`), which works the same way on x86-64 and aarch64. Legacy
//! syscalls that aarch64 never had are given sentinel numbers that cannot
//! match a real syscall, so the dispatcher simply never sees them there.

use std::mem;

use nix::errno::Errno;
use nix::unistd::Pid;

pub type Regs = libc::user_regs_struct;

pub fn get_regs(pid: Pid) -> nix::Result<Regs> {
    let mut regs: Regs = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: &mut regs as *mut Regs as *mut libc::c_void,
        iov_len: mem::size_of::<Regs>(),
    };
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            libc::NT_PRSTATUS as libc::c_long,
            &mut iov as *mut libc::iovec,
        )
    };
    Errno::result(res).map(|_| regs)
}

pub fn set_regs(pid: Pid, regs: &Regs) -> nix::Result<()> {
    let mut copy = *regs;
    let mut iov = libc::iovec {
        iov_base: &mut copy as *mut Regs as *mut libc::c_void,
        iov_len: mem::size_of::<Regs>(),
    };
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid.as_raw(),
            libc::NT_PRSTATUS as libc::c_long,
            &mut iov as *mut libc::iovec,
        )
    };
    Errno::result(res).map(drop)
}

#[cfg(target_arch = "x86_64")]
pub mod nr {
    pub const OPEN: u64 = 2;
    pub const CLOSE: u64 = 3;
    pub const STAT: u64 = 4;
    pub const LSTAT: u64 = 6;
    pub const ACCESS: u64 = 21;
    pub const DUP: u64 = 32;
    pub const DUP2: u64 = 33;
    pub const GETPID: u64 = 39;
    pub const EXECVE: u64 = 59;
    pub const CHDIR: u64 = 80;
    pub const FCHDIR: u64 = 81;
    pub const RENAME: u64 = 82;
    pub const RMDIR: u64 = 84;
    pub const LINK: u64 = 86;
    pub const UNLINK: u64 = 87;
    pub const READLINK: u64 = 89;
    pub const STATFS: u64 = 137;
    pub const GETXATTR: u64 = 191;
    pub const LGETXATTR: u64 = 192;
    pub const LISTXATTR: u64 = 194;
    pub const LLISTXATTR: u64 = 195;
    pub const GETDENTS64: u64 = 217;
    pub const OPENAT: u64 = 257;
    pub const MKDIRAT: u64 = 258;
    pub const FCHOWNAT: u64 = 260;
    pub const NEWFSTATAT: u64 = 262;
    pub const UNLINKAT: u64 = 263;
    pub const RENAMEAT: u64 = 264;
    pub const LINKAT: u64 = 265;
    pub const SYMLINKAT: u64 = 266;
    pub const READLINKAT: u64 = 267;
    pub const FCHMODAT: u64 = 268;
    pub const DUP3: u64 = 292;
    pub const RENAMEAT2: u64 = 316;
    pub const EXECVEAT: u64 = 322;
    pub const STATX: u64 = 332;
    pub const FACCESSAT2: u64 = 439;
}

#[cfg(target_arch = "aarch64")]
pub mod nr {
    pub const GETXATTR: u64 = 8;
    pub const LGETXATTR: u64 = 9;
    pub const LISTXATTR: u64 = 11;
    pub const LLISTXATTR: u64 = 12;
    pub const DUP: u64 = 23;
    pub const DUP3: u64 = 24;
    pub const MKDIRAT: u64 = 34;
    pub const UNLINKAT: u64 = 35;
    pub const SYMLINKAT: u64 = 36;
    pub const LINKAT: u64 = 37;
    pub const STATFS: u64 = 43;
    pub const CHDIR: u64 = 49;
    pub const FCHDIR: u64 = 50;
    pub const FCHMODAT: u64 = 53;
    pub const FCHOWNAT: u64 = 54;
    pub const OPENAT: u64 = 56;
    pub const CLOSE: u64 = 57;
    pub const GETDENTS64: u64 = 61;
    pub const READLINKAT: u64 = 78;
    pub const NEWFSTATAT: u64 = 79;
    pub const GETPID: u64 = 172;
    pub const EXECVE: u64 = 221;
    pub const RENAMEAT2: u64 = 276;
    pub const EXECVEAT: u64 = 281;
    pub const STATX: u64 = 291;
    pub const FACCESSAT2: u64 = 439;

    // Legacy syscalls with no aarch64 number. The sentinels can never match
    // a real syscall number.
    pub const OPEN: u64 = u64::MAX;
    pub const STAT: u64 = u64::MAX - 1;
    pub const LSTAT: u64 = u64::MAX - 2;
    pub const DUP2: u64 = u64::MAX - 3;
    pub const RMDIR: u64 = u64::MAX - 4;
    pub const UNLINK: u64 = u64::MAX - 5;
    pub const READLINK: u64 = u64::MAX - 6;
    pub const RENAMEAT: u64 = u64::MAX - 7;
    pub const ACCESS: u64 = u64::MAX - 8;
    pub const RENAME: u64 = u64::MAX - 9;
    pub const LINK: u64 = u64::MAX - 10;
}

#[cfg(target_arch = "x86_64")]
mod view {
    use super::Regs;

    pub fn sysno(r: &Regs) -> u64 {
        r.orig_rax
    }
    pub fn set_sysno(r: &mut Regs, v: u64) {
        r.orig_rax = v;
    }
    pub fn retval(r: &Regs) -> u64 {
        r.rax
    }
    pub fn set_retval(r: &mut Regs, v: u64) {
        r.rax = v;
    }
    pub fn arg0(r: &Regs) -> u64 {
        r.rdi
    }
    pub fn set_arg0(r: &mut Regs, v: u64) {
        r.rdi = v;
    }
    pub fn arg1(r: &Regs) -> u64 {
        r.rsi
    }
    pub fn set_arg1(r: &mut Regs, v: u64) {
        r.rsi = v;
    }
    pub fn arg2(r: &Regs) -> u64 {
        r.rdx
    }
    pub fn set_arg2(r: &mut Regs, v: u64) {
        r.rdx = v;
    }
    pub fn arg3(r: &Regs) -> u64 {
        r.r10
    }
    pub fn set_arg3(r: &mut Regs, v: u64) {
        r.r10 = v;
    }
    pub fn arg4(r: &Regs) -> u64 {
        r.r8
    }
    pub fn sp(r: &Regs) -> u64 {
        r.rsp
    }
}

#[cfg(target_arch = "aarch64")]
mod view {
    use super::Regs;

    pub fn sysno(r: &Regs) -> u64 {
        r.regs[8]
    }
    pub fn set_sysno(r: &mut Regs, v: u64) {
        r.regs[8] = v;
    }
    pub fn retval(r: &Regs) -> u64 {
        r.regs[0]
    }
    pub fn set_retval(r: &mut Regs, v: u64) {
        r.regs[0] = v;
    }
    pub fn arg0(r: &Regs) -> u64 {
        r.regs[0]
    }
    pub fn set_arg0(r: &mut Regs, v: u64) {
        r.regs[0] = v;
    }
    pub fn arg1(r: &Regs) -> u64 {
        r.regs[1]
    }
    pub fn set_arg1(r: &mut Regs, v: u64) {
        r.regs[1] = v;
    }
    pub fn arg2(r: &Regs) -> u64 {
        r.regs[2]
    }
    pub fn set_arg2(r: &mut Regs, v: u64) {
        r.regs[2] = v;
    }
    pub fn arg3(r: &Regs) -> u64 {
        r.regs[3]
    }
    pub fn set_arg3(r: &mut Regs, v: u64) {
        r.regs[3] = v;
    }
    pub fn arg4(r: &Regs) -> u64 {
        r.regs[4]
    }
    pub fn sp(r: &Regs) -> u64 {
        r.sp
    }
}

pub use view::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysno_round_trips_through_view() {
        let mut regs: Regs = unsafe { std::mem::zeroed() };
        set_sysno(&mut regs, nr::OPENAT);
        assert_eq!(sysno(&regs), nr::OPENAT);
        set_retval(&mut regs, (-2i64) as u64);
        assert_eq!(retval(&regs) as i64, -2);
    }

    #[test]
    fn test_args_are_independent() {
        let mut regs: Regs = unsafe { std::mem::zeroed() };
        set_arg0(&mut regs, 1);
        set_arg1(&mut regs, 2);
        set_arg2(&mut regs, 3);
        set_arg3(&mut regs, 4);
        assert_eq!(
            (arg0(&regs), arg1(&regs), arg2(&regs), arg3(&regs)),
            (1, 2, 3, 4)
        );
    }
}
