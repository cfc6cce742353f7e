//! Union of directory entries across overlay layers.

use std::collections::{BTreeMap, HashSet};

/// A single entry in a merged directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// Inode type nibble (`st_mode >> 12`), the encoding `linux_dirent64`
    /// uses for `d_type`.
    pub file_type: u8,
    pub ino: u64,
    /// 1-based position in the sorted listing, assigned on finalization.
    pub off: i64,
}

/// Accumulates entries layer by layer.
///
/// The first entry added under a name wins, so callers must add the upper
/// layer before any lower. A whiteout observed for a name drops that name
/// from the result, no matter which side of the whiteout it was added on.
#[derive(Debug, Default)]
pub struct DirMerger {
    entries: BTreeMap<String, DirEntry>,
    whiteouts: HashSet<String>,
}

impl DirMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: DirEntry) {
        if self.whiteouts.contains(&entry.name) {
            return;
        }
        self.entries.entry(entry.name.clone()).or_insert(entry);
    }

    pub fn add_whiteout(&mut self, name: &str) {
        self.whiteouts.insert(name.to_string());
        self.entries.remove(name);
    }

    /// Finalizes the merge: entries sorted by name (byte-lexicographic, the
    /// BTreeMap key order) with ordinals 1..=n.
    pub fn into_entries(self) -> Vec<DirEntry> {
        self.entries
            .into_values()
            .enumerate()
            .map(|(i, mut e)| {
                e.off = i as i64 + 1;
                e
            })
            .collect()
    }
}
