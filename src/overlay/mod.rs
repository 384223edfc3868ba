//! Overlay source resolution and member management.
//!
//! An overlay named `n` can live in two places:
//!
//! ```text
//! <distribution_overlay_dir>/n/rootfs/...   shipped, never written
//! <site_overlay_dir>/n/rootfs/...           local, writable
//! ```
//!
//! The site copy shadows the distribution copy. Any mutation of an overlay
//! that exists only in the distribution tree first promotes the whole
//! overlay into the site tree (copy-on-write), so later reads of untouched
//! siblings see the same promoted copy.
//!
//! Overlays without a `rootfs/` directory are legacy overlays whose files
//! sit directly in the overlay directory.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{lchown, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::artifact::filesystem::{copy_tree, copy_tree_filtered, count_files};
use crate::config::Config;
use crate::error::OverlayError;
use crate::template::{is_template, DEFAULT_TEMPLATE};
use crate::writer::write_atomic;

pub const ROOTFS_DIR: &str = "rootfs";
const LOCK_DIR: &str = ".locks";

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9\-._:]+$").expect("overlay name pattern is valid"))
}

/// Overlay names are path segments: word characters plus `-._:`, and no
/// leading dot (those are reserved for lock and staging entries).
pub fn validate_name(name: &str) -> Result<()> {
    if !name_re().is_match(name) || name.starts_with('.') {
        return Err(OverlayError::InvalidName(name.to_string()).into());
    }
    Ok(())
}

/// Member path relative to an overlay root. Leading `/` is ignored;
/// `..` is rejected.
pub fn member_relpath(path: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                bail!("member path must stay inside the overlay: {}", path)
            }
        }
    }
    if out.as_os_str().is_empty() {
        bail!("empty member path: '{}'", path);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Site,
    Distribution,
}

/// A resolved overlay: where its files are and which tree they are in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlay {
    name: String,
    path: PathBuf,
    tier: Tier,
}

impl Overlay {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn is_site(&self) -> bool {
        self.tier == Tier::Site
    }

    /// Directory holding the overlay's files.
    pub fn rootfs(&self) -> PathBuf {
        let rootfs = self.path.join(ROOTFS_DIR);
        if rootfs.is_dir() {
            rootfs
        } else {
            self.path.clone()
        }
    }

    pub fn member(&self, rel: &Path) -> PathBuf {
        self.rootfs().join(rel)
    }
}

/// Row of `list_overlays`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayInfo {
    pub name: String,
    pub site: bool,
    pub distribution: bool,
    pub files: usize,
}

/// Row of `list_members`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    pub path: PathBuf,
    pub is_dir: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Exclusive per-overlay lock, released when dropped.
///
/// The lock file is left in place: unlinking a lock another process may
/// be waiting on would let two holders exist at once.
#[derive(Debug)]
struct OverlayLock {
    file: File,
}

impl Drop for OverlayLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Site and distribution overlay trees.
#[derive(Debug, Clone)]
pub struct OverlayStore {
    site_dir: PathBuf,
    distribution_dir: PathBuf,
}

impl OverlayStore {
    pub fn new(site_dir: impl Into<PathBuf>, distribution_dir: impl Into<PathBuf>) -> Self {
        Self {
            site_dir: site_dir.into(),
            distribution_dir: distribution_dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.paths.site_overlay_dir,
            &config.paths.distribution_overlay_dir,
        )
    }

    fn site_path(&self, name: &str) -> PathBuf {
        self.site_dir.join(name)
    }

    fn distribution_path(&self, name: &str) -> PathBuf {
        self.distribution_dir.join(name)
    }

    /// Site copy first, then the distribution copy.
    pub fn resolve(&self, name: &str) -> Result<Overlay> {
        validate_name(name)?;
        let site = self.site_path(name);
        if site.is_dir() {
            return Ok(Overlay {
                name: name.to_string(),
                path: site,
                tier: Tier::Site,
            });
        }
        let dist = self.distribution_path(name);
        if dist.is_dir() {
            return Ok(Overlay {
                name: name.to_string(),
                path: dist,
                tier: Tier::Distribution,
            });
        }
        Err(OverlayError::NotFound(name.to_string()).into())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    /// Create an empty site overlay.
    pub fn create(&self, name: &str) -> Result<Overlay> {
        validate_name(name)?;
        let site = self.site_path(name);
        if site.exists() {
            return Err(OverlayError::AlreadyExists(name.to_string()).into());
        }
        fs::create_dir_all(site.join(ROOTFS_DIR))
            .with_context(|| format!("Failed to create overlay directory: {}", site.display()))?;
        info!(overlay = name, path = %site.display(), "created site overlay");
        Ok(Overlay {
            name: name.to_string(),
            path: site,
            tier: Tier::Site,
        })
    }

    fn lock(&self, name: &str) -> Result<OverlayLock> {
        let dir = self.site_dir.join(LOCK_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create lock directory: {}", dir.display()))?;
        let path = dir.join(format!("{}.lock", name));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to create lock file: {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(OverlayLock { file })
    }

    /// Resolve `name` to a writable site overlay, promoting a
    /// distribution-only overlay first.
    ///
    /// Promotion runs under the overlay's lock and copies into a staging
    /// directory that is renamed into place, so concurrent callers promote
    /// once and nobody sees a half-copied site tree.
    pub fn ensure_writable(&self, name: &str) -> Result<Overlay> {
        let resolved = self.resolve(name)?;
        if resolved.is_site() {
            return Ok(resolved);
        }

        let _lock = self.lock(name)?;
        let site = self.site_path(name);
        if site.is_dir() {
            debug!(overlay = name, "already promoted by another writer");
            return self.resolve(name);
        }

        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}.promote.", name))
            .tempdir_in(&self.site_dir)
            .with_context(|| format!("Failed to create staging directory in {}", self.site_dir.display()))?;
        copy_tree(resolved.path(), staging.path()).with_context(|| {
            format!("Failed to copy distribution overlay '{}' to site", name)
        })?;
        // The staging directory already exists, so the copy left its mode alone.
        let md = fs::metadata(resolved.path())
            .with_context(|| format!("Failed to stat {}", resolved.path().display()))?;
        fs::set_permissions(staging.path(), fs::Permissions::from_mode(md.mode() & 0o7777))
            .with_context(|| format!("Failed to set mode on {}", staging.path().display()))?;
        fs::rename(staging.path(), &site)
            .with_context(|| format!("Failed to move promoted overlay into {}", site.display()))?;
        info!(overlay = name, path = %site.display(), "promoted distribution overlay to site");

        self.resolve(name)
    }

    /// Remove a site overlay. Without `force`, the overlay must be empty.
    pub fn delete(&self, name: &str, force: bool) -> Result<()> {
        let overlay = self.resolve(name)?;
        if !overlay.is_site() {
            return Err(OverlayError::DistributionDelete(name.to_string()).into());
        }
        if !force && count_files(&overlay.rootfs()) > 0 {
            bail!("overlay '{}' is not empty; use force to delete it", name);
        }
        let _lock = self.lock(name)?;
        fs::remove_dir_all(overlay.path())
            .with_context(|| format!("Failed to remove overlay: {}", overlay.path().display()))?;
        info!(overlay = name, "deleted site overlay");
        Ok(())
    }

    /// Every overlay in either tree, sorted by name.
    pub fn list_overlays(&self) -> Result<Vec<OverlayInfo>> {
        let mut found: BTreeMap<String, (bool, bool)> = BTreeMap::new();
        for (dir, is_site) in [(&self.site_dir, true), (&self.distribution_dir, false)] {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries {
                let entry = entry?;
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if validate_name(&name).is_err() || !entry.file_type()?.is_dir() {
                    continue;
                }
                let flags = found.entry(name).or_default();
                if is_site {
                    flags.0 = true;
                } else {
                    flags.1 = true;
                }
            }
        }

        found
            .into_iter()
            .map(|(name, (site, distribution))| -> Result<OverlayInfo> {
                let overlay = self.resolve(&name)?;
                Ok(OverlayInfo {
                    files: count_files(&overlay.rootfs()),
                    name,
                    site,
                    distribution,
                })
            })
            .collect()
    }

    /// Members of `name`, sorted by path.
    pub fn list_members(&self, name: &str) -> Result<Vec<MemberInfo>> {
        let rootfs = self.resolve(name)?.rootfs();
        let mut out = Vec::new();
        for entry in WalkDir::new(&rootfs)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.with_context(|| format!("Failed to walk {}", rootfs.display()))?;
            let md = entry.metadata()?;
            out.push(MemberInfo {
                path: entry.path().strip_prefix(&rootfs).unwrap_or(entry.path()).to_path_buf(),
                is_dir: md.is_dir(),
                mode: md.mode() & 0o7777,
                uid: md.uid(),
                gid: md.gid(),
            });
        }
        Ok(out)
    }

    fn existing_member(&self, overlay: &Overlay, path: &str) -> Result<PathBuf> {
        let full = overlay.member(&member_relpath(path)?);
        if fs::symlink_metadata(&full).is_err() {
            return Err(OverlayError::MemberNotFound {
                overlay: overlay.name().to_string(),
                member: path.to_string(),
            }
            .into());
        }
        Ok(full)
    }

    /// Full path of an existing member, without promoting.
    pub fn member_path(&self, name: &str, path: &str) -> Result<PathBuf> {
        let overlay = self.resolve(name)?;
        self.existing_member(&overlay, path)
    }

    pub fn read_member(&self, name: &str, path: &str) -> Result<String> {
        let full = self.member_path(name, path)?;
        fs::read_to_string(&full).with_context(|| format!("Failed to read {}", full.display()))
    }

    /// Write `content` to a member, creating parent directories.
    pub fn write_member(&self, name: &str, path: &str, content: &[u8], mode: u32) -> Result<PathBuf> {
        let overlay = self.ensure_writable(name)?;
        let full = overlay.member(&member_relpath(path)?);
        write_atomic(&full, content, mode, false)?;
        Ok(full)
    }

    /// Copy host file `source` into the overlay at `dest` (defaults to the
    /// source path itself). A `dest` naming an existing directory receives
    /// the file under its own name.
    pub fn import_file(
        &self,
        name: &str,
        source: &Path,
        dest: Option<&str>,
        overwrite: bool,
        create_dirs: bool,
    ) -> Result<PathBuf> {
        let md = fs::metadata(source)
            .with_context(|| format!("Failed to stat {}", source.display()))?;
        if !md.is_file() {
            bail!("can only import regular files: {}", source.display());
        }
        let dest = dest.map(str::to_string).unwrap_or_else(|| source.display().to_string());
        let overlay = self.ensure_writable(name)?;
        let mut full = overlay.member(&member_relpath(&dest)?);
        if full.is_dir() {
            if let Some(file_name) = source.file_name() {
                full.push(file_name);
            }
        }

        if full.exists() && !overwrite {
            return Err(OverlayError::MemberExists {
                overlay: name.to_string(),
                member: dest,
            }
            .into());
        }
        if let Some(parent) = full.parent() {
            if !parent.is_dir() && !create_dirs {
                bail!("destination directory does not exist: {}", parent.display());
            }
        }

        let content =
            fs::read(source).with_context(|| format!("Failed to read {}", source.display()))?;
        write_atomic(&full, &content, md.mode() & 0o7777, false)?;
        info!(overlay = name, source = %source.display(), dest = %full.display(), "imported file");
        Ok(full)
    }

    pub fn mkdir(&self, name: &str, path: &str, mode: u32) -> Result<PathBuf> {
        let overlay = self.ensure_writable(name)?;
        let full = overlay.member(&member_relpath(path)?);
        fs::create_dir_all(&full)
            .with_context(|| format!("Failed to create directory: {}", full.display()))?;
        fs::set_permissions(&full, fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to set mode on {}", full.display()))?;
        Ok(full)
    }

    pub fn chmod(&self, name: &str, path: &str, mode: u32) -> Result<()> {
        let overlay = self.ensure_writable(name)?;
        let full = self.existing_member(&overlay, path)?;
        fs::set_permissions(&full, fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to set mode on {}", full.display()))?;
        mark_changed(&overlay)?;
        debug!(overlay = name, file = path, mode = %format!("{:o}", mode), "changed mode");
        Ok(())
    }

    /// Change owner; a `None` group is left unchanged.
    pub fn chown(&self, name: &str, path: &str, uid: u32, gid: Option<u32>) -> Result<()> {
        let overlay = self.ensure_writable(name)?;
        let full = self.existing_member(&overlay, path)?;
        lchown(&full, Some(uid), gid)
            .with_context(|| format!("Failed to change owner of {}", full.display()))?;
        mark_changed(&overlay)?;
        debug!(overlay = name, file = path, uid, gid, "changed owner");
        Ok(())
    }

    /// Remove a member. Without `force` only files and empty directories
    /// are removed; with `parents`, directories left empty are removed too.
    pub fn delete_member(&self, name: &str, path: &str, force: bool, parents: bool) -> Result<()> {
        let overlay = self.ensure_writable(name)?;
        let full = self.existing_member(&overlay, path)?;
        let md = fs::symlink_metadata(&full)?;

        let removed = match (md.is_dir(), force) {
            (true, true) => fs::remove_dir_all(&full),
            (true, false) => fs::remove_dir(&full),
            (false, _) => fs::remove_file(&full),
        };
        removed.with_context(|| format!("Failed to remove {}:{}", name, path))?;
        info!(overlay = name, file = path, "removed member");

        if parents {
            let rootfs = overlay.rootfs();
            let mut dir = full.parent();
            while let Some(current) = dir {
                if current == rootfs || !current.starts_with(&rootfs) {
                    break;
                }
                if fs::remove_dir(current).is_err() {
                    break;
                }
                debug!(dir = %current.display(), "removed empty parent");
                dir = current.parent();
            }
        }
        Ok(())
    }

    /// Get a member ready for editing and return its path. A new template
    /// member is seeded with starter content; other new members start empty.
    pub fn prepare_edit(&self, name: &str, path: &str, create_dirs: bool) -> Result<PathBuf> {
        let overlay = self.ensure_writable(name)?;
        let full = overlay.member(&member_relpath(path)?);
        if full.exists() {
            return Ok(full);
        }
        if let Some(parent) = full.parent() {
            if !parent.is_dir() {
                if !create_dirs {
                    bail!("destination directory does not exist: {}", parent.display());
                }
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }
        let seed = if is_template(&full) { DEFAULT_TEMPLATE } else { "" };
        write_atomic(&full, seed.as_bytes(), 0o644, false)?;
        Ok(full)
    }

    /// Copy the plain files of overlay `name` into `dst`. Template members
    /// are not copied; their relative paths are returned for rendering.
    pub fn layer_into(&self, name: &str, dst: &Path) -> Result<Layered> {
        let overlay = self.resolve(name)?;
        let rootfs = overlay.rootfs();
        if rootfs == overlay.path() {
            warn!(overlay = name, "overlay has no rootfs directory, using legacy layout");
        }
        let mut templates = Vec::new();
        let files = copy_tree_filtered(&rootfs, dst, |rel, ft| {
            if ft.is_file() && is_template(rel) {
                templates.push(rel.to_path_buf());
                false
            } else {
                true
            }
        })
        .with_context(|| format!("Failed to copy overlay '{}'", name))?;
        debug!(
            overlay = name,
            files = files.len(),
            templates = templates.len(),
            "layered overlay"
        );
        Ok(Layered {
            overlay,
            files,
            templates,
        })
    }
}

/// Bump the mtime of the overlay's root. Mode and owner changes only touch
/// ctime, which archive staleness checks do not look at.
fn mark_changed(overlay: &Overlay) -> Result<()> {
    let root = overlay.rootfs();
    File::open(&root)
        .and_then(|dir| dir.set_modified(SystemTime::now()))
        .with_context(|| format!("Failed to update mtime of {}", root.display()))
}

/// What [`OverlayStore::layer_into`] put into a tree.
#[derive(Debug, Clone)]
pub struct Layered {
    pub overlay: Overlay,
    /// Plain members copied, relative to the overlay root.
    pub files: Vec<PathBuf>,
    /// Template members left behind, relative to the overlay root.
    pub templates: Vec<PathBuf>,
}
