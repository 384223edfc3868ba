//! Atomic replacement of rendered files.
//!
//! New content goes to a temporary sibling first and is renamed over the
//! destination, so readers see either the old or the new file. Existing
//! files are copied to `<dest>.wwbackup` once before the first overwrite.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::template::{Emitted, EmittedKind};

pub const BACKUP_SUFFIX: &str = ".wwbackup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Destination already had this content.
    Unchanged,
    Written,
}

pub fn backup_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

fn parent_of(dest: &Path) -> Result<&Path> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    Ok(parent)
}

fn tmp_prefix(dest: &Path) -> String {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(".{}.", name)
}

fn back_up(dest: &Path) {
    let backup = backup_path(dest);
    if backup.exists() {
        return;
    }
    match fs::copy(dest, &backup) {
        Ok(_) => debug!(file = %dest.display(), backup = %backup.display(), "backed up file"),
        Err(err) => warn!(file = %dest.display(), error = %err, "could not create backup"),
    }
}

/// Replace `dest` with `content`, mode `mode`.
pub fn write_atomic(dest: &Path, content: &[u8], mode: u32, backup: bool) -> Result<WriteOutcome> {
    if let Ok(md) = fs::symlink_metadata(dest) {
        if md.is_dir() {
            anyhow::bail!("Refusing to replace directory {} with a file", dest.display());
        }
        if md.is_file() {
            let current = fs::read(dest)
                .with_context(|| format!("Failed to read {}", dest.display()))?;
            if current == content {
                debug!(file = %dest.display(), "content unchanged, skipping write");
                return Ok(WriteOutcome::Unchanged);
            }
            if backup {
                back_up(dest);
            }
        }
    }

    let parent = parent_of(dest)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(&tmp_prefix(dest))
        .tempfile_in(parent)
        .with_context(|| format!("Failed to create temporary file in {}", parent.display()))?;
    tmp.write_all(content)
        .with_context(|| format!("Failed to write temporary file for {}", dest.display()))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set mode on {}", dest.display()))?;
    tmp.persist(dest)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move file into place: {}", dest.display()))?;
    debug!(file = %dest.display(), mode = %format!("{:o}", mode), "wrote file");
    Ok(WriteOutcome::Written)
}

/// Point `dest` at `target`, replacing whatever was there.
pub fn write_symlink(dest: &Path, target: &str) -> Result<WriteOutcome> {
    if let Ok(current) = fs::read_link(dest) {
        if current == Path::new(target) {
            return Ok(WriteOutcome::Unchanged);
        }
    }
    let parent = parent_of(dest)?;
    let tmp = tempfile::Builder::new()
        .prefix(&tmp_prefix(dest))
        .make_in(parent, |path| symlink(target, path))
        .with_context(|| format!("Failed to create temporary link in {}", parent.display()))?;
    tmp.persist(dest)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move link into place: {}", dest.display()))?;
    debug!(file = %dest.display(), link = target, "wrote symlink");
    Ok(WriteOutcome::Written)
}

/// Write one emitter output with `mode` for regular files.
pub fn write_emitted(out: &Emitted, mode: u32, backup: bool) -> Result<WriteOutcome> {
    match &out.kind {
        EmittedKind::Content(text) => write_atomic(&out.path, text.as_bytes(), mode, backup),
        EmittedKind::Symlink(target) => write_symlink(&out.path, target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[test]
    fn identical_content_is_skipped() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("motd");
        fs::write(&dest, "same").unwrap();
        let before = fs::metadata(&dest).unwrap().ino();

        assert_eq!(write_atomic(&dest, b"same", 0o644, true).unwrap(), WriteOutcome::Unchanged);
        assert_eq!(fs::metadata(&dest).unwrap().ino(), before);
        assert!(!backup_path(&dest).exists());
    }

    #[test]
    fn overwrite_backs_up_once() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("hosts");
        fs::write(&dest, "v1").unwrap();

        assert_eq!(write_atomic(&dest, b"v2", 0o600, true).unwrap(), WriteOutcome::Written);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "v2");
        assert_eq!(fs::read_to_string(backup_path(&dest)).unwrap(), "v1");
        assert_eq!(fs::metadata(&dest).unwrap().mode() & 0o777, 0o600);

        write_atomic(&dest, b"v3", 0o600, true).unwrap();
        assert_eq!(fs::read_to_string(backup_path(&dest)).unwrap(), "v1");
    }

    #[test]
    fn failed_backup_does_not_block_the_write() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("hosts");
        fs::write(&dest, "v1").unwrap();
        symlink(temp.path().join("missing/dir/backup"), backup_path(&dest)).unwrap();

        assert_eq!(write_atomic(&dest, b"v2", 0o644, true).unwrap(), WriteOutcome::Written);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "v2");
        assert!(!temp.path().join("missing").exists());
    }

    #[test]
    fn nobackup_skips_backup() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("f");
        fs::write(&dest, "old").unwrap();
        write_atomic(&dest, b"new", 0o644, false).unwrap();
        assert!(!backup_path(&dest).exists());
    }

    #[test]
    fn creates_parents_and_leaves_no_temporaries() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("a/b/c.conf");
        write_atomic(&dest, b"x", 0o644, true).unwrap();
        let names: Vec<_> = fs::read_dir(temp.path().join("a/b"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, ["c.conf"]);
    }

    #[test]
    fn symlink_replaces_file() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("link");
        fs::write(&dest, "plain").unwrap();

        assert_eq!(write_symlink(&dest, "/etc/target").unwrap(), WriteOutcome::Written);
        assert_eq!(fs::read_link(&dest).unwrap(), PathBuf::from("/etc/target"));
        assert_eq!(write_symlink(&dest, "/etc/target").unwrap(), WriteOutcome::Unchanged);
    }
}
