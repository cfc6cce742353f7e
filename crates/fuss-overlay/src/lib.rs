//! # fuss-overlay
//!
//! Copy-up-on-write, whiteout-based layered filesystem logic.
//!
//! An [`OverlayFs`] maps a virtual path (absolute, rooted at the overlay
//! root `/`) to a concrete backing path: either in the writable upper layer,
//! or in the highest lower layer that still holds the entry and is not
//! masked by a whiteout. Mutating operations are expressed as
//! `prepare_*` calls that perform any required copy-up or whiteout
//! bookkeeping in the upper layer and hand back the backing path(s) the
//! caller should operate on.

pub mod merge;
pub mod whiteout;

use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use thiserror::Error;
use tracing::debug;

pub use merge::{DirEntry, DirMerger};
pub use whiteout::WhiteoutStyle;

/// Errors from overlay resolution and preparation.
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("no overlay entry at {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl OverlayError {
    /// Errno projection; resolver failures surface to tracees as negative
    /// return values.
    pub fn errno(&self) -> Errno {
        match self {
            OverlayError::NotFound(_) => Errno::ENOENT,
            OverlayError::Io(e) => e
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, OverlayError>;

/// Immutable layer configuration.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Read-only lower layers, index 0 is the top-most lower.
    pub lower_dirs: Vec<PathBuf>,
    /// The single writable upper layer.
    pub upper_dir: PathBuf,
    pub whiteout: WhiteoutStyle,
}

#[derive(Debug)]
pub struct OverlayFs {
    lower_dirs: Vec<PathBuf>,
    upper_dir: PathBuf,
    whiteout: WhiteoutStyle,
}

/// Joins a virtual path (rooted at `/`) onto a layer directory.
fn join_virtual(base: &Path, vpath: &str) -> PathBuf {
    base.join(vpath.trim_start_matches('/'))
}

/// Strict ancestors of a virtual path, excluding the root: for `/a/b/c`
/// yields `/a` then `/a/b`.
fn strict_ancestors(vpath: &str) -> impl Iterator<Item = &str> {
    let trimmed = vpath.trim_end_matches('/');
    trimmed
        .char_indices()
        .filter(|&(i, c)| c == '/' && i > 0)
        .map(move |(i, _)| &trimmed[..i])
}

impl OverlayFs {
    pub fn new(cfg: OverlayConfig) -> Self {
        Self {
            lower_dirs: cfg.lower_dirs,
            upper_dir: cfg.upper_dir,
            whiteout: cfg.whiteout,
        }
    }

    pub fn whiteout_style(&self) -> WhiteoutStyle {
        self.whiteout
    }

    fn upper_path(&self, vpath: &str) -> PathBuf {
        join_virtual(&self.upper_dir, vpath)
    }

    fn not_found(vpath: &str) -> OverlayError {
        OverlayError::NotFound(vpath.to_string())
    }

    /// Resolves a virtual path to its backing path. The upper layer always
    /// wins; among lowers the lowest index wins; a whiteout at any layer
    /// masks every layer below it, and an opaque upper ancestor hides all
    /// lower content beneath it.
    pub fn resolve(&self, vpath: &str) -> Result<(PathBuf, bool)> {
        let upper = self.upper_path(vpath);
        if whiteout::is_whiteout(&upper) {
            return Err(Self::not_found(vpath));
        }
        if fs::symlink_metadata(&upper).is_ok() {
            return Ok((upper, true));
        }

        if self.opaque_ancestor_blocks(vpath) {
            return Err(Self::not_found(vpath));
        }

        for lower in &self.lower_dirs {
            let lower_path = join_virtual(lower, vpath);
            if whiteout::is_whiteout(&lower_path) {
                return Err(Self::not_found(vpath));
            }
            if fs::symlink_metadata(&lower_path).is_ok() {
                return Ok((lower_path, false));
            }
        }

        Err(Self::not_found(vpath))
    }

    fn opaque_ancestor_blocks(&self, vpath: &str) -> bool {
        strict_ancestors(vpath).any(|anc| whiteout::is_opaque_dir(&self.upper_path(anc)))
    }

    /// Backing path for an open. Creates (parents plus whiteout removal) or
    /// copies up as the open flags demand.
    pub fn resolve_for_open(&self, vpath: &str, flags: OFlag) -> Result<PathBuf> {
        let resolved = self.resolve(vpath);

        if flags.contains(OFlag::O_CREAT) && resolved.is_err() {
            self.copy_up_parents(vpath)?;
            let upper = self.upper_path(vpath);
            whiteout::remove_whiteout(&upper);
            return Ok(upper);
        }

        let (real, in_upper) = resolved?;

        let wants_write =
            flags.intersects(OFlag::O_WRONLY | OFlag::O_RDWR) || flags.contains(OFlag::O_TRUNC);
        if wants_write && !in_upper {
            self.copy_up(vpath)?;
            return Ok(self.upper_path(vpath));
        }

        Ok(real)
    }

    /// Backing path for read-only metadata operations (stat, readlink,
    /// access, xattr reads). Symlink following is left to the kernel on the
    /// backing path, so both follow and no-follow variants share this.
    pub fn resolve_for_stat(&self, vpath: &str) -> Result<PathBuf> {
        self.resolve(vpath).map(|(p, _)| p)
    }

    /// Upper path for a new entry: parents materialized, stale whiteout
    /// cleared. The caller performs the actual creation.
    pub fn prepare_create(&self, vpath: &str) -> Result<PathBuf> {
        self.copy_up_parents(vpath)?;
        let upper = self.upper_path(vpath);
        whiteout::remove_whiteout(&upper);
        Ok(upper)
    }

    /// Upper path for an in-place mutation (chmod, chown, truncate-by-path);
    /// copies the entry up first.
    pub fn prepare_write(&self, vpath: &str) -> Result<PathBuf> {
        self.copy_up(vpath)?;
        Ok(self.upper_path(vpath))
    }

    /// Removes a file from the merged view: deletes any upper entry and, if
    /// the name also exists in a lower layer, leaves a whiteout behind.
    pub fn prepare_unlink(&self, vpath: &str) -> Result<()> {
        let (real, in_upper) = self.resolve(vpath)?;
        let in_lower = self.exists_in_lower(vpath);
        if in_upper {
            fs::remove_file(&real)?;
        }
        if in_lower {
            self.create_whiteout(vpath)?;
        }
        Ok(())
    }

    /// Directory variant of [`prepare_unlink`](Self::prepare_unlink).
    pub fn prepare_rmdir(&self, vpath: &str) -> Result<()> {
        let (real, in_upper) = self.resolve(vpath)?;
        let in_lower = self.exists_in_lower(vpath);
        if in_upper {
            fs::remove_dir(&real)?;
        }
        if in_lower {
            self.create_whiteout(vpath)?;
        }
        Ok(())
    }

    /// Prepares both sides of a rename: the source is copied up, the
    /// destination's parents materialized and its stale whiteout cleared,
    /// and a whiteout is left at the source if a lower layer still holds it.
    /// Returns the upper-layer backing paths for (old, new).
    pub fn prepare_rename(&self, old_vpath: &str, new_vpath: &str) -> Result<(PathBuf, PathBuf)> {
        self.copy_up(old_vpath)?;
        self.copy_up_parents(new_vpath)?;

        let old_upper = self.upper_path(old_vpath);
        let new_upper = self.upper_path(new_vpath);

        whiteout::remove_whiteout(&new_upper);

        if self.exists_in_lower(old_vpath) {
            self.create_whiteout(old_vpath)?;
        }

        Ok((old_upper, new_upper))
    }

    /// Like rename preparation but the source stays: copy-up old, prepare
    /// the destination.
    pub fn prepare_link(&self, old_vpath: &str, new_vpath: &str) -> Result<(PathBuf, PathBuf)> {
        self.copy_up(old_vpath)?;
        self.copy_up_parents(new_vpath)?;

        let old_upper = self.upper_path(old_vpath);
        let new_upper = self.upper_path(new_vpath);

        whiteout::remove_whiteout(&new_upper);

        Ok((old_upper, new_upper))
    }

    /// Upper path at which a new symlink may be created.
    pub fn prepare_symlink(&self, link_vpath: &str) -> Result<PathBuf> {
        self.copy_up_parents(link_vpath)?;
        let upper = self.upper_path(link_vpath);
        whiteout::remove_whiteout(&upper);
        Ok(upper)
    }

    /// Merged directory listing: upper entries first, then each lower unless
    /// the upper directory is opaque. Whiteouts consume their targets.
    /// Entries come back name-sorted with ordinals 1..=n.
    pub fn read_dir(&self, vpath: &str) -> Result<Vec<DirEntry>> {
        let mut merger = DirMerger::new();

        let upper = self.upper_path(vpath);
        if let Ok(entries) = fs::read_dir(&upper) {
            Self::merge_layer(&mut merger, entries);
        }

        if whiteout::is_opaque_dir(&upper) {
            return Ok(merger.into_entries());
        }

        for lower in &self.lower_dirs {
            let Ok(entries) = fs::read_dir(join_virtual(lower, vpath)) else {
                continue;
            };
            Self::merge_layer(&mut merger, entries);
        }

        Ok(merger.into_entries())
    }

    fn merge_layer(merger: &mut DirMerger, entries: fs::ReadDir) {
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                debug!(path = ?entry.path(), "skipping non-UTF-8 directory entry");
                continue;
            };
            if whiteout::is_whiteout_name(&name) {
                merger.add_whiteout(whiteout::whiteout_target(&name));
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            // A char-dev-style whiteout occupies the deleted name itself.
            if whiteout::is_whiteout_chardev(&entry.path()) {
                merger.add_whiteout(&name);
                continue;
            }
            merger.add(DirEntry {
                name,
                file_type: (meta.mode() >> 12) as u8,
                ino: meta.ino(),
                off: 0,
            });
        }
    }

    fn exists_in_lower(&self, vpath: &str) -> bool {
        self.lower_dirs
            .iter()
            .any(|lower| fs::symlink_metadata(join_virtual(lower, vpath)).is_ok())
    }

    fn create_whiteout(&self, vpath: &str) -> Result<()> {
        self.copy_up_parents(vpath)?;
        whiteout::create_whiteout(&self.upper_path(vpath), self.whiteout)?;
        Ok(())
    }

    /// Materializes `vpath` in the upper layer if it only exists below.
    fn copy_up(&self, vpath: &str) -> Result<()> {
        let (real, in_upper) = self.resolve(vpath)?;
        if in_upper {
            return Ok(());
        }
        self.copy_up_parents(vpath)?;
        copy_up_node(&real, &self.upper_path(vpath))?;
        Ok(())
    }

    /// Ensures every ancestor directory of `vpath` exists in the upper
    /// layer, copying up lower directories node by node and creating plain
    /// 0755 directories where no layer has one.
    fn copy_up_parents(&self, vpath: &str) -> Result<()> {
        for anc in strict_ancestors(vpath) {
            let upper = self.upper_path(anc);
            if fs::metadata(&upper).is_ok() {
                continue;
            }
            match self.resolve(anc) {
                Ok((real, _)) => copy_up_node(&real, &upper)?,
                Err(_) => fs::create_dir_all(&upper).map_err(OverlayError::Io)?,
            }
        }
        Ok(())
    }
}

/// Copies a single filesystem node (directory, symlink, or regular file)
/// from a lower backing path into the upper layer, preserving permission
/// bits and, best-effort, ownership and xattrs.
fn copy_up_node(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    let perm = meta.mode() & 0o7777;
    let file_type = meta.file_type();

    if file_type.is_dir() {
        match fs::DirBuilder::new().mode(perm).create(dst) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    } else if file_type.is_symlink() {
        let target = fs::read_link(src)?;
        std::os::unix::fs::symlink(&target, dst)?;
    } else {
        fs::copy(src, dst)?;
    }

    if let Some(cdst) = whiteout::path_cstr(dst) {
        unsafe { libc::lchown(cdst.as_ptr(), meta.uid(), meta.gid()) };
    }
    if !file_type.is_symlink() {
        let _ = fs::set_permissions(dst, fs::Permissions::from_mode(perm));
    }

    whiteout::copy_xattrs(src, dst);

    Ok(())
}
