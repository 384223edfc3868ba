//! Node/profile store interface.
//!
//! The overlay engine only needs read access to per-node attributes:
//! identity, network devices, overlay lists per context and free-form
//! tags. [`NodeStore`] is that boundary; [`NodesFile`] is the TOML-backed
//! implementation the binary uses.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::OverlayError;

/// Context name for the overlay set applied at provisioning time.
pub const SYSTEM_CONTEXT: &str = "system";
/// Context name for the overlay set refreshed while the node runs.
pub const RUNTIME_CONTEXT: &str = "runtime";

/// Read-only provider of node attributes.
pub trait NodeStore: Send + Sync {
    fn get_node(&self, id: &str) -> Result<NodeInfo>;

    fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// Modification time of the backing document, when there is one.
    fn modified(&self) -> Option<SystemTime>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetDev {
    pub device: String,
    pub hwaddr: String,
    pub ipaddr: String,
    pub ipaddr6: String,
    pub netmask: String,
    pub gateway: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub onboot: bool,
    pub primary: bool,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelInfo {
    pub version: String,
    pub args: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeInfo {
    /// Filled from the table key when loaded from a [`NodesFile`].
    #[serde(skip)]
    pub id: String,
    pub cluster_name: String,
    pub image_name: String,
    pub kernel: KernelInfo,
    pub system_overlay: Vec<String>,
    pub runtime_overlay: Vec<String>,
    pub network_devices: BTreeMap<String, NetDev>,
    pub tags: BTreeMap<String, String>,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Overlay list configured for `context`; unknown contexts have none.
    pub fn overlays_for(&self, context: &str) -> &[String] {
        match context {
            SYSTEM_CONTEXT => &self.system_overlay,
            RUNTIME_CONTEXT => &self.runtime_overlay,
            _ => &[],
        }
    }

    /// Whether `overlay` appears in any of this node's contexts.
    pub fn uses_overlay(&self, overlay: &str) -> bool {
        self.system_overlay
            .iter()
            .chain(self.runtime_overlay.iter())
            .any(|name| name == overlay)
    }
}

/// Keep the nodes named in `names`, preserving store order. An empty
/// filter keeps everything.
pub fn filter_by_name(nodes: Vec<NodeInfo>, names: &[String]) -> Vec<NodeInfo> {
    if names.is_empty() {
        return nodes;
    }
    nodes
        .into_iter()
        .filter(|node| names.iter().any(|name| name == &node.id))
        .collect()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct NodesToml {
    nodes: BTreeMap<String, NodeInfo>,
}

/// Node store backed by a TOML document of `[nodes.<id>]` tables.
#[derive(Debug, Clone)]
pub struct NodesFile {
    path: Option<PathBuf>,
    nodes: Vec<NodeInfo>,
}

impl NodesFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| OverlayError::Config {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let mut store = Self::parse(&text, path)?;
        store.path = Some(path.to_path_buf());
        Ok(store)
    }

    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        let parsed: NodesToml = toml::from_str(text).map_err(|err| OverlayError::Config {
            path: origin.to_path_buf(),
            message: err.to_string(),
        })?;
        let nodes = parsed
            .nodes
            .into_iter()
            .map(|(id, mut node)| {
                node.id = id;
                node
            })
            .collect();
        Ok(Self { path: None, nodes })
    }

    /// In-memory store, used for host builds and tests.
    pub fn from_nodes(nodes: Vec<NodeInfo>) -> Self {
        Self { path: None, nodes }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl NodeStore for NodesFile {
    fn get_node(&self, id: &str) -> Result<NodeInfo> {
        self.nodes
            .iter()
            .find(|node| node.id == id)
            .cloned()
            .ok_or_else(|| {
                OverlayError::Config {
                    path: self.path.clone().unwrap_or_default(),
                    message: format!("no such node: {}", id),
                }
                .into()
            })
    }

    fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.nodes.clone())
    }

    fn modified(&self) -> Option<SystemTime> {
        let path = self.path.as_ref()?;
        fs::metadata(path).and_then(|md| md.modified()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NODES: &str = r#"
[nodes.n1]
cluster_name = "c1"
image_name = "rocky9"
system_overlay = ["wwinit", "n1-extra"]
runtime_overlay = ["generic"]
kernel = { args = "quiet" }

[nodes.n1.network_devices.default]
device = "eth0"
hwaddr = "aa:bb:cc:dd:ee:ff"
ipaddr = "10.0.0.11"
netmask = "255.255.255.0"
type = "ethernet"
onboot = true

[nodes.n1.tags]
role = "compute"

[nodes.n2]
system_overlay = ["wwinit"]
"#;

    #[test]
    fn parse_nodes_document() {
        let store = NodesFile::parse(NODES, Path::new("nodes.toml")).unwrap();
        let nodes = store.list_nodes().unwrap();
        assert_eq!(nodes.len(), 2);

        let n1 = store.get_node("n1").unwrap();
        assert_eq!(n1.id, "n1");
        assert_eq!(n1.overlays_for(SYSTEM_CONTEXT), ["wwinit", "n1-extra"]);
        assert_eq!(n1.overlays_for(RUNTIME_CONTEXT), ["generic"]);
        assert!(n1.overlays_for("other").is_empty());
        assert_eq!(n1.network_devices["default"].kind, "ethernet");
        assert_eq!(n1.tags["role"], "compute");
        assert_eq!(n1.kernel.args, "quiet");
        assert!(n1.uses_overlay("generic"));
        assert!(!n1.uses_overlay("missing"));
    }

    #[test]
    fn unknown_node_is_config_error() {
        let store = NodesFile::parse(NODES, Path::new("nodes.toml")).unwrap();
        let err = store.get_node("nope").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OverlayError>(),
            Some(OverlayError::Config { .. })
        ));
    }

    #[test]
    fn load_tracks_document_mtime() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nodes.toml");
        fs::write(&path, NODES).unwrap();

        let store = NodesFile::load(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        assert!(store.modified().is_some());
        assert!(NodesFile::from_nodes(vec![]).modified().is_none());
    }

    #[test]
    fn filter_keeps_requested_nodes() {
        let nodes = vec![NodeInfo::new("a"), NodeInfo::new("b"), NodeInfo::new("c")];
        let kept = filter_by_name(nodes.clone(), &["c".to_string(), "a".to_string()]);
        let ids: Vec<_> = kept.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["a", "c"]);
        assert_eq!(filter_by_name(nodes, &[]).len(), 3);
    }
}
