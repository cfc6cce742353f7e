//! Whiteout and opaque-directory marker encoding.
//!
//! Two interoperable styles are supported: a sibling file named `.wh.<name>`
//! (the file-prefix style) or a character device with `rdev == 0` at the
//! deleted name itself (the char-device style, which requires CAP_MKNOD).
//! Opaque directories are marked either by a `.wh..wh..opq` sentinel file
//! inside the directory or by the `trusted.overlay.opaque` xattr set to `y`.

use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::{mknod, Mode, SFlag};

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";
const OPAQUE_XATTR: &CStr = c"trusted.overlay.opaque";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WhiteoutStyle {
    #[default]
    FilePrefix,
    CharDevice,
}

pub fn whiteout_name(name: &str) -> String {
    format!("{WHITEOUT_PREFIX}{name}")
}

pub fn whiteout_target(wh_name: &str) -> &str {
    wh_name.strip_prefix(WHITEOUT_PREFIX).unwrap_or(wh_name)
}

pub fn is_whiteout_name(name: &str) -> bool {
    name.starts_with(WHITEOUT_PREFIX)
}

/// Path of the `.wh.` sibling marking `path` as deleted. None for paths
/// without a usable final component.
fn sibling(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    Some(path.with_file_name(whiteout_name(name)))
}

/// True iff `path` is deleted under either whiteout encoding.
pub fn is_whiteout(path: &Path) -> bool {
    is_whiteout_file(path) || is_whiteout_chardev(path)
}

fn is_whiteout_file(path: &Path) -> bool {
    match sibling(path) {
        Some(wh) => fs::symlink_metadata(wh)
            .map(|m| m.file_type().is_file())
            .unwrap_or(false),
        None => false,
    }
}

pub(crate) fn is_whiteout_chardev(path: &Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(m) => m.file_type().is_char_device() && m.rdev() == 0,
        Err(_) => false,
    }
}

/// True iff the directory hides all same-named lower-layer content.
pub fn is_opaque_dir(path: &Path) -> bool {
    is_opaque_by_xattr(path) || is_opaque_by_file(path)
}

fn is_opaque_by_file(path: &Path) -> bool {
    fs::symlink_metadata(path.join(OPAQUE_MARKER)).is_ok()
}

fn is_opaque_by_xattr(path: &Path) -> bool {
    let Some(cpath) = path_cstr(path) else {
        return false;
    };
    let mut buf = [0u8; 16];
    let n = unsafe {
        libc::getxattr(
            cpath.as_ptr(),
            OPAQUE_XATTR.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    n == 1 && buf[0] == b'y'
}

/// Creates the marker recording that `path` is deleted.
pub fn create_whiteout(path: &Path, style: WhiteoutStyle) -> io::Result<()> {
    match style {
        WhiteoutStyle::CharDevice => {
            mknod(path, SFlag::S_IFCHR, Mode::from_bits_truncate(0o666), 0)
                .map_err(io::Error::from)
        }
        WhiteoutStyle::FilePrefix => {
            let wh = sibling(path).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "path has no file name")
            })?;
            fs::File::create(wh).map(|_| ())
        }
    }
}

/// Removes any whiteout at `path`, in whichever encoding it exists.
pub fn remove_whiteout(path: &Path) {
    if let Some(wh) = sibling(path) {
        let _ = fs::remove_file(wh);
    }
    if is_whiteout_chardev(path) {
        let _ = fs::remove_file(path);
    }
}

/// Marks an upper-layer directory as opaque.
pub fn set_opaque_dir(path: &Path, style: WhiteoutStyle) -> io::Result<()> {
    match style {
        WhiteoutStyle::CharDevice => {
            let cpath = path_cstr(path).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "path is not representable")
            })?;
            let res = unsafe {
                libc::setxattr(
                    cpath.as_ptr(),
                    OPAQUE_XATTR.as_ptr(),
                    b"y".as_ptr() as *const libc::c_void,
                    1,
                    0,
                )
            };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
        WhiteoutStyle::FilePrefix => fs::File::create(path.join(OPAQUE_MARKER)).map(|_| ()),
    }
}

pub(crate) fn path_cstr(path: &Path) -> Option<CString> {
    CString::new(path.as_os_str().as_bytes()).ok()
}

/// Copies extended attributes from `src` to `dst`, best-effort. Attributes
/// that cannot be read or written (permissions, unsupported namespaces) are
/// skipped.
pub(crate) fn copy_xattrs(src: &Path, dst: &Path) {
    let (Some(csrc), Some(cdst)) = (path_cstr(src), path_cstr(dst)) else {
        return;
    };
    let mut names = [0u8; 4096];
    let n = unsafe {
        libc::llistxattr(csrc.as_ptr(), names.as_mut_ptr() as *mut libc::c_char, names.len())
    };
    if n <= 0 {
        return;
    }
    for name in names[..n as usize].split(|&b| b == 0).filter(|s| !s.is_empty()) {
        let Ok(cname) = CString::new(name) else {
            continue;
        };
        let mut value = [0u8; 4096];
        let vn = unsafe {
            libc::lgetxattr(
                csrc.as_ptr(),
                cname.as_ptr(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        };
        if vn < 0 {
            continue;
        }
        unsafe {
            libc::lsetxattr(
                cdst.as_ptr(),
                cname.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                vn as usize,
                0,
            );
        }
    }
}
