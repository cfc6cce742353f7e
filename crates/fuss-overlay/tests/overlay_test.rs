//! Overlay resolver behaviour against real directory layers.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use tempfile::TempDir;

use fuss_overlay::{whiteout, OverlayConfig, OverlayFs, WhiteoutStyle};

/// Builds an overlay from layer fixtures. Each layer is a list of
/// `(path, is_dir, mode)` entries; files get their path as contents. The
/// first fixture is the top-most lower, a fresh upper is appended.
fn build_overlay(layers: &[&[(&str, bool, u32)]]) -> (OverlayFs, Vec<TempDir>, PathBuf) {
    let mut dirs = Vec::new();
    for layer in layers {
        let dir = TempDir::new().unwrap();
        for (path, is_dir, mode) in *layer {
            let full = dir.path().join(path);
            if *is_dir {
                fs::create_dir_all(&full).unwrap();
            } else {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent).unwrap();
                }
                fs::write(&full, path.as_bytes()).unwrap();
            }
            fs::set_permissions(&full, fs::Permissions::from_mode(*mode)).unwrap();
        }
        dirs.push(dir);
    }

    let upper = TempDir::new().unwrap();
    let upper_path = upper.path().to_path_buf();
    dirs.push(upper);

    let fs = OverlayFs::new(OverlayConfig {
        lower_dirs: layers
            .iter()
            .enumerate()
            .map(|(i, _)| dirs[i].path().to_path_buf())
            .collect(),
        upper_dir: upper_path.clone(),
        whiteout: WhiteoutStyle::FilePrefix,
    });
    (fs, dirs, upper_path)
}

fn names(entries: &[fuss_overlay::DirEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.name.as_str()).collect()
}

#[test]
fn test_resolve_prefers_topmost_lower() {
    let (fs, dirs, _) = build_overlay(&[
        &[("shared", false, 0o644), ("only_top", false, 0o644)],
        &[("shared", false, 0o644), ("only_bottom", false, 0o644)],
    ]);

    let (p, in_upper) = fs.resolve("/shared").unwrap();
    assert!(!in_upper);
    assert_eq!(p, dirs[0].path().join("shared"));

    let (p, _) = fs.resolve("/only_bottom").unwrap();
    assert_eq!(p, dirs[1].path().join("only_bottom"));
}

#[test]
fn test_resolve_prefers_upper_over_lowers() {
    let (fs, _dirs, upper) = build_overlay(&[&[("f", false, 0o644)]]);
    fs::write(upper.join("f"), b"upper wins").unwrap();

    let (p, in_upper) = fs.resolve("/f").unwrap();
    assert!(in_upper);
    assert_eq!(p, upper.join("f"));
}

#[test]
fn test_whiteout_in_upper_masks_lower() {
    let (fs, _dirs, upper) = build_overlay(&[&[("f", false, 0o644)]]);
    whiteout::create_whiteout(&upper.join("f"), WhiteoutStyle::FilePrefix).unwrap();

    let err = fs.resolve("/f").unwrap_err();
    assert_eq!(err.errno(), nix::errno::Errno::ENOENT);
}

#[test]
fn test_whiteout_in_higher_lower_masks_lower_layers() {
    let (fs, dirs, _) = build_overlay(&[&[], &[("f", false, 0o644)]]);
    // Whiteout written into the top lower layer masks the bottom one.
    fs::write(dirs[0].path().join(".wh.f"), b"").unwrap();

    assert!(fs.resolve("/f").is_err());
}

#[test]
fn test_missing_path_is_not_found() {
    let (fs, _dirs, _) = build_overlay(&[&[]]);
    assert!(fs.resolve("/nope").is_err());
}

#[test]
fn test_open_read_only_resolves_lower_without_copy_up() {
    let (fs, dirs, upper) = build_overlay(&[&[("hello", false, 0o644)]]);

    let backing = fs.resolve_for_open("/hello", OFlag::O_RDONLY).unwrap();
    assert_eq!(backing, dirs[0].path().join("hello"));
    assert!(!upper.join("hello").exists());
}

#[test]
fn test_open_for_write_copies_up() {
    // Mirrors the append-triggers-copy-up scenario: a 0640 lower file must
    // come back as an identical upper copy, lower byte-unchanged.
    let (fs, dirs, upper) = build_overlay(&[&[]]);
    let lower_file = dirs[0].path().join("hello");
    fs::write(&lower_file, b"abc").unwrap();
    fs::set_permissions(&lower_file, fs::Permissions::from_mode(0o640)).unwrap();

    let backing = fs
        .resolve_for_open("/hello", OFlag::O_WRONLY | OFlag::O_APPEND)
        .unwrap();
    assert_eq!(backing, upper.join("hello"));
    assert_eq!(fs::read(&backing).unwrap(), b"abc");
    assert_eq!(
        fs::metadata(&backing).unwrap().permissions().mode() & 0o7777,
        0o640
    );
    assert_eq!(fs::read(&lower_file).unwrap(), b"abc");
}

#[test]
fn test_open_create_materializes_parents_and_clears_whiteout() {
    let (fs, _dirs, upper) = build_overlay(&[&[("a", true, 0o755)]]);
    fs::create_dir_all(upper.join("a")).unwrap();
    whiteout::create_whiteout(&upper.join("a/new"), WhiteoutStyle::FilePrefix).unwrap();

    let backing = fs
        .resolve_for_open("/a/new", OFlag::O_WRONLY | OFlag::O_CREAT)
        .unwrap();
    assert_eq!(backing, upper.join("a/new"));
    assert!(upper.join("a").is_dir());
    assert!(!whiteout::is_whiteout(&upper.join("a/new")));
}

#[test]
fn test_copy_up_parents_preserves_lower_directory_modes() {
    let (fs, _dirs, upper) = build_overlay(&[&[
        ("a", true, 0o750),
        ("a/b", true, 0o755),
        ("a/b/f", false, 0o644),
    ]]);

    fs.prepare_write("/a/b/f").unwrap();
    assert!(upper.join("a/b/f").is_file());
    assert_eq!(
        fs::metadata(upper.join("a")).unwrap().permissions().mode() & 0o7777,
        0o750
    );
}

#[test]
fn test_unlink_lower_file_leaves_whiteout() {
    // The hide-a-lower-file scenario: rm of /a/b.txt must leave
    // upper/a/.wh.b.txt and the lower file untouched.
    let (fs, dirs, upper) = build_overlay(&[&[("a", true, 0o755), ("a/b.txt", false, 0o644)]]);

    fs.prepare_unlink("/a/b.txt").unwrap();

    assert!(upper.join("a/.wh.b.txt").is_file());
    assert!(dirs[0].path().join("a/b.txt").is_file());
    assert!(fs.resolve("/a/b.txt").is_err());
    assert!(!names(&fs.read_dir("/a").unwrap()).contains(&"b.txt"));
}

#[test]
fn test_unlink_upper_only_file_leaves_no_whiteout() {
    let (fs, _dirs, upper) = build_overlay(&[&[]]);
    fs::write(upper.join("f"), b"x").unwrap();

    fs.prepare_unlink("/f").unwrap();

    assert!(!upper.join("f").exists());
    assert!(!upper.join(".wh.f").exists());
}

#[test]
fn test_unlink_missing_path_fails() {
    let (fs, _dirs, _) = build_overlay(&[&[]]);
    assert!(fs.prepare_unlink("/nope").is_err());
}

#[test]
fn test_rmdir_lower_dir_leaves_whiteout() {
    let (fs, _dirs, upper) = build_overlay(&[&[("d", true, 0o755)]]);

    fs.prepare_rmdir("/d").unwrap();
    assert!(whiteout::is_whiteout(&upper.join("d")));
    assert!(fs.resolve("/d").is_err());
}

#[test]
fn test_rename_copies_up_and_whites_out_source() {
    // mv /x -> /y where x lives in a lower layer: upper/y carries the bytes,
    // a whiteout covers x, and the old name resolves NOT_FOUND.
    let (fs, dirs, upper) = build_overlay(&[&[]]);
    fs::write(dirs[0].path().join("x"), b"foo").unwrap();

    let (old_backing, new_backing) = fs.prepare_rename("/x", "/y").unwrap();
    assert_eq!(old_backing, upper.join("x"));
    assert_eq!(new_backing, upper.join("y"));
    // The caller's redirected rename(2) would do this.
    fs::rename(&old_backing, &new_backing).unwrap();

    assert_eq!(fs::read(upper.join("y")).unwrap(), b"foo");
    assert!(!upper.join("x").exists());
    assert!(fs.resolve("/x").is_err());
    let (p, _) = fs.resolve("/y").unwrap();
    assert_eq!(fs::read(p).unwrap(), b"foo");
}

#[test]
fn test_symlink_preparation_and_copy_up() {
    let (fs, dirs, upper) = build_overlay(&[&[]]);
    std::os::unix::fs::symlink("target", dirs[0].path().join("ln")).unwrap();

    // Copy-up of a symlink preserves the target string.
    fs.prepare_write("/ln").unwrap();
    assert_eq!(fs::read_link(upper.join("ln")).unwrap(), Path::new("target"));

    let link_path = fs.prepare_symlink("/sub/fresh").unwrap();
    assert_eq!(link_path, upper.join("sub/fresh"));
    assert!(upper.join("sub").is_dir());
}

#[test]
fn test_read_dir_merges_layers_in_order() {
    // Exact merged-listing scenario: L1{a,b} L2{b,c} upper{a, .wh.c}
    // must list exactly a, b.
    let (fs, _dirs, upper) = build_overlay(&[
        &[("a", false, 0o644), ("b", false, 0o644)],
        &[("b", false, 0o644), ("c", false, 0o644)],
    ]);
    fs::write(upper.join("a"), b"upper").unwrap();
    fs::write(upper.join(".wh.c"), b"").unwrap();

    let entries = fs.read_dir("/").unwrap();
    assert_eq!(names(&entries), ["a", "b"]);
    assert_eq!(entries[0].off, 1);
    assert_eq!(entries[1].off, 2);
    // The upper copy of `a` wins the merge.
    let upper_ino = fs::metadata(upper.join("a")).unwrap();
    use std::os::unix::fs::MetadataExt;
    assert_eq!(entries[0].ino, upper_ino.ino());
}

#[test]
fn test_read_dir_opaque_upper_hides_lower_entries() {
    let (fs, _dirs, upper) = build_overlay(&[&[("d", true, 0o755), ("d/drop", false, 0o644)]]);
    fs::create_dir_all(upper.join("d")).unwrap();
    fs::write(upper.join("d/keep"), b"").unwrap();
    whiteout::set_opaque_dir(&upper.join("d"), WhiteoutStyle::FilePrefix).unwrap();

    assert_eq!(names(&fs.read_dir("/d").unwrap()), ["keep"]);
}

#[test]
fn test_resolve_blocked_by_opaque_ancestor() {
    let (fs, _dirs, upper) = build_overlay(&[&[("d", true, 0o755), ("d/drop", false, 0o644)]]);
    fs::create_dir_all(upper.join("d")).unwrap();
    whiteout::set_opaque_dir(&upper.join("d"), WhiteoutStyle::FilePrefix).unwrap();

    assert!(fs.resolve("/d/drop").is_err());
}

#[test]
fn test_read_dir_reports_type_nibbles() {
    let (fs, _dirs, _) = build_overlay(&[&[("d", true, 0o755), ("f", false, 0o644)]]);
    let entries = fs.read_dir("/").unwrap();
    assert_eq!(names(&entries), ["d", "f"]);
    assert_eq!(entries[0].file_type, libc::DT_DIR);
    assert_eq!(entries[1].file_type, libc::DT_REG);
}
