//! Filesystem utilities for overlay trees.
//!
//! Copying overlays into scratch trees and site directories, and finding
//! the newest modification under a tree for staleness checks.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::{lchown, symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Give `dst` the owner of `md`. Only root can hand files to other users,
/// so failures are warnings for root and ignored otherwise.
pub fn copy_ownership(md: &fs::Metadata, dst: &Path) {
    if let Err(err) = lchown(dst, Some(md.uid()), Some(md.gid())) {
        if nix::unistd::geteuid().is_root() {
            warn!(file = %dst.display(), error = %err, "failed to copy ownership");
        } else {
            debug!(file = %dst.display(), error = %err, "ownership not copied");
        }
    }
}

/// Remove whatever sits at `path`, if anything.
fn clear_entry(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove directory: {}", path.display())),
        Ok(_) => fs::remove_file(path)
            .with_context(|| format!("Failed to remove file: {}", path.display())),
        Err(_) => Ok(()),
    }
}

/// Recursively copy `src` into `dst`, preserving symlinks, modes and
/// (best effort) ownership. Files already in `dst` are replaced by the
/// same-named entries from `src`; directories already in `dst` are left
/// as they are, mode and owner included.
///
/// Returns the relative paths of the non-directory entries copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<Vec<PathBuf>> {
    copy_tree_filtered(src, dst, |_, _| true)
}

/// [`copy_tree`], skipping non-directory entries for which `keep` returns
/// false. Directories are always created.
pub fn copy_tree_filtered(
    src: &Path,
    dst: &Path,
    mut keep: impl FnMut(&Path, fs::FileType) -> bool,
) -> Result<Vec<PathBuf>> {
    let mut copied = Vec::new();

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to read directory: {}", src.display()))?;
        let src_path = entry.path();
        let rel = src_path.strip_prefix(src).unwrap_or(src_path);
        let dst_path = dst.join(rel);
        let md = fs::symlink_metadata(src_path)
            .with_context(|| format!("Failed to stat {}", src_path.display()))?;
        let file_type = md.file_type();

        if !file_type.is_dir() && !keep(rel, file_type) {
            continue;
        }

        if file_type.is_dir() {
            // Existing directories keep their own mode and owner.
            if dst_path.is_dir() && !dst_path.is_symlink() {
                continue;
            }
            clear_entry(&dst_path)?;
            fs::create_dir_all(&dst_path)
                .with_context(|| format!("Failed to create directory: {}", dst_path.display()))?;
            fs::set_permissions(&dst_path, fs::Permissions::from_mode(md.mode() & 0o7777))
                .with_context(|| format!("Failed to set mode on {}", dst_path.display()))?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(src_path)?;
            clear_entry(&dst_path)?;
            symlink(&target, &dst_path)
                .with_context(|| format!("Failed to create symlink: {}", dst_path.display()))?;
            copied.push(rel.to_path_buf());
        } else {
            clear_entry(&dst_path)?;
            fs::copy(src_path, &dst_path)
                .with_context(|| format!("Failed to copy file: {}", src_path.display()))?;
            copied.push(rel.to_path_buf());
        }
        copy_ownership(&md, &dst_path);
    }

    Ok(copied)
}

/// Newest modification time of `root` or anything below it; `None` when
/// `root` does not exist.
pub fn newest_mtime(root: &Path) -> Result<Option<SystemTime>> {
    if fs::symlink_metadata(root).is_err() {
        return Ok(None);
    }
    let mut newest: Option<SystemTime> = None;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let modified = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?
            .modified()?;
        if newest.map_or(true, |n| modified > n) {
            newest = Some(modified);
        }
    }
    Ok(newest)
}

/// Number of files (non-directories) under `root`.
pub fn count_files(root: &Path) -> usize {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| !e.file_type().is_dir())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_copy_tree() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");

        fs::create_dir_all(src.join("subdir")).unwrap();
        fs::write(src.join("file.txt"), "hello").unwrap();
        fs::write(src.join("subdir/nested.txt"), "world").unwrap();
        fs::set_permissions(src.join("subdir/nested.txt"), fs::Permissions::from_mode(0o750)).unwrap();
        symlink("file.txt", src.join("link")).unwrap();

        let copied = copy_tree(&src, &dst).unwrap();

        assert_eq!(
            copied,
            [
                PathBuf::from("file.txt"),
                PathBuf::from("link"),
                PathBuf::from("subdir/nested.txt")
            ]
        );
        assert_eq!(fs::read_to_string(dst.join("subdir/nested.txt")).unwrap(), "world");
        assert_eq!(
            fs::metadata(dst.join("subdir/nested.txt")).unwrap().mode() & 0o777,
            0o750
        );
        assert!(dst.join("link").is_symlink());
        assert_eq!(fs::read_link(dst.join("link")).unwrap(), PathBuf::from("file.txt"));
    }

    #[test]
    fn filtered_copy_skips_rejected_files() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::write(src.join("etc/hosts"), "h").unwrap();
        fs::write(src.join("etc/motd.ww"), "m").unwrap();

        let mut skipped = Vec::new();
        let copied = copy_tree_filtered(&src, &dst, |rel, _| {
            let keep = rel.extension().map_or(true, |e| e != "ww");
            if !keep {
                skipped.push(rel.to_path_buf());
            }
            keep
        })
        .unwrap();

        assert_eq!(copied, [PathBuf::from("etc/hosts")]);
        assert_eq!(skipped, [PathBuf::from("etc/motd.ww")]);
        assert!(dst.join("etc").is_dir());
        assert!(!dst.join("etc/motd.ww").exists());
    }

    #[test]
    fn later_copy_overwrites_and_keeps_others() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        let dst = temp.path().join("dst");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("f"), "from a").unwrap();
        fs::write(a.join("only-a"), "a").unwrap();
        fs::write(b.join("f"), "from b").unwrap();

        copy_tree(&a, &dst).unwrap();
        copy_tree(&b, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("f")).unwrap(), "from b");
        assert_eq!(fs::read_to_string(dst.join("only-a")).unwrap(), "a");
    }

    #[test]
    fn existing_directories_keep_their_mode() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("tmp")).unwrap();
        fs::create_dir_all(src.join("new")).unwrap();
        fs::set_permissions(src.join("tmp"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(src.join("new"), fs::Permissions::from_mode(0o750)).unwrap();
        fs::write(src.join("tmp/f"), "x").unwrap();
        fs::create_dir_all(dst.join("tmp")).unwrap();
        fs::set_permissions(&dst, fs::Permissions::from_mode(0o711)).unwrap();
        fs::set_permissions(dst.join("tmp"), fs::Permissions::from_mode(0o1777)).unwrap();

        copy_tree(&src, &dst).unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().mode() & 0o7777;
        assert_eq!(mode(&dst), 0o711);
        assert_eq!(mode(&dst.join("tmp")), 0o1777);
        assert_eq!(mode(&dst.join("new")), 0o750);
        assert_eq!(fs::read_to_string(dst.join("tmp/f")).unwrap(), "x");
    }

    #[test]
    fn file_replaces_symlink_without_following_it() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        let outside = temp.path().join("outside");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(&outside, "untouched").unwrap();
        symlink(&outside, dst.join("f")).unwrap();
        fs::write(src.join("f"), "new").unwrap();

        copy_tree(&src, &dst).unwrap();

        assert!(!dst.join("f").is_symlink());
        assert_eq!(fs::read_to_string(&outside).unwrap(), "untouched");
    }

    #[test]
    fn newest_mtime_sees_nested_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("tree");
        fs::create_dir_all(root.join("a/b")).unwrap();
        let deep = root.join("a/b/c");
        fs::write(&deep, "x").unwrap();

        let future = SystemTime::now() + Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&deep)
            .unwrap()
            .set_modified(future)
            .unwrap();

        let newest = newest_mtime(&root).unwrap().unwrap();
        assert!(newest > SystemTime::now() + Duration::from_secs(1800));
        assert_eq!(newest_mtime(&temp.path().join("absent")).unwrap(), None);
        assert_eq!(count_files(&root), 1);
    }
}
