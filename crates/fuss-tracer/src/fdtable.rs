//! Registry of tracee descriptors known to refer to intercepted
//! directories.
//!
//! Only directory descriptors need supervisor-side handles: their merged
//! listings are synthesized. Everything else flows through the kernel on a
//! rewritten path. The table is shared across all traced pids because
//! descriptors inherited over fork refer to the same open files.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct DirHandle {
    vpath: String,
    /// Index of the next merged entry to stream out of getdents64.
    pos: usize,
}

#[derive(Debug, Default)]
pub struct FdTable {
    dirs: Mutex<HashMap<RawFd, DirHandle>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `fd` as a handle on the merged directory `vpath`, with the
    /// read position reset.
    pub fn track_dir(&self, fd: RawFd, vpath: &str) {
        self.dirs.lock().unwrap().insert(
            fd,
            DirHandle {
                vpath: vpath.to_string(),
                pos: 0,
            },
        );
    }

    /// Virtual directory path behind `fd`, if tracked.
    pub fn dir(&self, fd: RawFd) -> Option<String> {
        self.dirs.lock().unwrap().get(&fd).map(|h| h.vpath.clone())
    }

    pub fn pos(&self, fd: RawFd) -> usize {
        self.dirs.lock().unwrap().get(&fd).map_or(0, |h| h.pos)
    }

    pub fn set_pos(&self, fd: RawFd, pos: usize) {
        if let Some(h) = self.dirs.lock().unwrap().get_mut(&fd) {
            h.pos = pos;
        }
    }

    /// Forgets `fd`. Idempotent.
    pub fn close(&self, fd: RawFd) {
        self.dirs.lock().unwrap().remove(&fd);
    }

    /// Mirrors a successful dup family call: `newfd` takes over whatever
    /// `oldfd` refers to, dropping any handle it previously carried.
    pub fn dup(&self, oldfd: RawFd, newfd: RawFd) {
        let mut dirs = self.dirs.lock().unwrap();
        match dirs.get(&oldfd).cloned() {
            Some(handle) => {
                dirs.insert(newfd, handle);
            }
            None => {
                dirs.remove(&newfd);
            }
        }
    }

    pub fn close_all(&self) {
        self.dirs.lock().unwrap().clear();
    }
}
