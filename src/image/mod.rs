//! Image rootfs lookup for templates that pull files out of node images.
//!
//! Pulling and caching images happens elsewhere; this only maps an
//! image name to its unpacked rootfs directory.

use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ImageStore {
    image_dir: PathBuf,
}

impl ImageStore {
    pub fn new(image_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
        }
    }

    /// Rootfs directory of `name`, if the image has been imported.
    pub fn rootfs(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return None;
        }
        let rootfs = self.image_dir.join(name).join("rootfs");
        rootfs.is_dir().then_some(rootfs)
    }

    /// Contents of `path` inside image `name`, one trailing newline
    /// trimmed. Missing images or files yield an empty string.
    pub fn read_file(&self, name: &str, path: &str) -> String {
        if name.is_empty() {
            warn!(file = path, "image is not defined for node");
            return String::new();
        }
        let Some(rootfs) = self.rootfs(name) else {
            warn!(image = name, file = path, "template requires file(s) from non-existent image");
            return String::new();
        };
        let relative = strip_root(Path::new(path));
        let full = rootfs.join(&relative);
        debug!(image = name, file = %full.display(), "including file from image");
        if !full.is_file() {
            warn!(image = name, file = path, "requested file from image does not exist");
            return String::new();
        }
        match fs::read_to_string(&full) {
            Ok(content) => content
                .strip_suffix('\n')
                .map(str::to_string)
                .unwrap_or(content),
            Err(err) => {
                warn!(image = name, file = path, error = %err, "image include failed");
                String::new()
            }
        }
    }
}

/// Make an in-image path relative, dropping root and parent components
/// so lookups cannot escape the rootfs.
fn strip_root(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}
