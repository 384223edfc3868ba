//! Template context: the variables a template sees for one render target.
//!
//! A context is assembled once per node (or for the provisioning host
//! itself) from the node record, the global configuration and the full
//! node list. Field names are PascalCase so templates read
//! `{{ Id }}`, `{{ NetDevs.default.Ipaddr }}` or `{% if Dhcp.enabled %}`.

use anyhow::{Context as _, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use time::OffsetDateTime;

use crate::config::{
    ipv4_network, netmask_prefix, Config, DhcpConfig, NfsConfig, PathsConfig, SshConfig,
    TftpConfig, WarewulfConfig,
};
use crate::node::{NetDev, NodeInfo, NodeStore};

/// Where and when a build happens.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub build_host: String,
    pub build_time: OffsetDateTime,
}

impl Provenance {
    pub fn now() -> Self {
        Self {
            build_host: local_hostname().unwrap_or_default(),
            build_time: OffsetDateTime::now_utc(),
        }
    }

    fn formatted_time(&self) -> String {
        let t = self.build_time;
        format!(
            "{:02}-{:02}-{:04} {:02}:{:02}:{:02} UTC",
            u8::from(t.month()),
            t.day(),
            t.year(),
            t.hour(),
            t.minute(),
            t.second()
        )
    }
}

/// Hostname of the machine running the build.
pub fn local_hostname() -> Result<String> {
    let name = nix::unistd::gethostname().context("reading local hostname")?;
    Ok(name.to_string_lossy().into_owned())
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct KernelContext {
    pub version: String,
    pub args: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetDevContext {
    pub device: String,
    pub hwaddr: String,
    pub ipaddr: String,
    pub ipaddr6: String,
    pub netmask: String,
    pub gateway: String,
    #[serde(rename = "Type")]
    pub kind: String,
    pub on_boot: bool,
    pub primary: bool,
    pub prefix: String,
    #[serde(rename = "IpCIDR")]
    pub ip_cidr: String,
    pub network: String,
    pub tags: BTreeMap<String, String>,
}

impl From<&NetDev> for NetDevContext {
    fn from(dev: &NetDev) -> Self {
        let prefix = netmask_prefix(&dev.netmask);
        let ip_cidr = match prefix {
            Some(p) if !dev.ipaddr.is_empty() => format!("{}/{}", dev.ipaddr, p),
            _ => String::new(),
        };
        Self {
            device: dev.device.clone(),
            hwaddr: dev.hwaddr.clone(),
            ipaddr: dev.ipaddr.clone(),
            ipaddr6: dev.ipaddr6.clone(),
            netmask: dev.netmask.clone(),
            gateway: dev.gateway.clone(),
            kind: dev.kind.clone(),
            on_boot: dev.onboot,
            primary: dev.primary,
            prefix: prefix.map(|p| p.to_string()).unwrap_or_default(),
            ip_cidr,
            network: ipv4_network(&dev.ipaddr, &dev.netmask)
                .map(|n| n.to_string())
                .unwrap_or_default(),
            tags: dev.tags.clone(),
        }
    }
}

/// The per-node slice of another node, as seen through `AllNodes`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeSummary {
    pub id: String,
    pub hostname: String,
    pub cluster_name: String,
    pub image_name: String,
    pub net_devs: BTreeMap<String, NetDevContext>,
    pub tags: BTreeMap<String, String>,
}

impl From<&NodeInfo> for NodeSummary {
    fn from(node: &NodeInfo) -> Self {
        Self {
            id: node.id.clone(),
            hostname: node.id.clone(),
            cluster_name: node.cluster_name.clone(),
            image_name: node.image_name.clone(),
            net_devs: net_devs(node),
            tags: node.tags.clone(),
        }
    }
}

fn net_devs(node: &NodeInfo) -> BTreeMap<String, NetDevContext> {
    node.network_devices
        .iter()
        .map(|(name, dev)| (name.clone(), NetDevContext::from(dev)))
        .collect()
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateContext {
    pub id: String,
    pub hostname: String,
    pub cluster_name: String,
    pub image_name: String,
    pub container: String,
    pub kernel: KernelContext,
    pub net_devs: BTreeMap<String, NetDevContext>,
    pub tags: BTreeMap<String, String>,
    pub keys: BTreeMap<String, String>,
    pub system_overlay: Vec<String>,
    pub runtime_overlay: Vec<String>,
    pub ipaddr: String,
    pub ipaddr6: String,
    pub netmask: String,
    pub network: String,
    #[serde(rename = "NetworkCIDR")]
    pub network_cidr: String,
    pub ipv6: bool,
    pub dhcp: DhcpConfig,
    pub nfs: NfsConfig,
    pub tftp: TftpConfig,
    pub ssh: SshConfig,
    pub warewulf: WarewulfConfig,
    pub paths: PathsConfig,
    pub overlay: String,
    pub build_host: String,
    pub build_time: String,
    pub build_time_unix: String,
    pub build_source: String,
    pub all_nodes: Vec<NodeSummary>,
}

impl TemplateContext {
    /// Assemble the context for `node`. Pure: all inputs are explicit.
    pub fn build(
        node: &NodeInfo,
        config: &Config,
        all_nodes: &[NodeInfo],
        provenance: &Provenance,
    ) -> Self {
        Self {
            id: node.id.clone(),
            hostname: node.id.clone(),
            cluster_name: node.cluster_name.clone(),
            image_name: node.image_name.clone(),
            container: node.image_name.clone(),
            kernel: KernelContext {
                version: node.kernel.version.clone(),
                args: node.kernel.args.clone(),
            },
            net_devs: net_devs(node),
            tags: node.tags.clone(),
            keys: node.tags.clone(),
            system_overlay: node.system_overlay.clone(),
            runtime_overlay: node.runtime_overlay.clone(),
            ipaddr: config.ipaddr.clone(),
            ipaddr6: config.ipaddr6.clone(),
            netmask: config.netmask.clone(),
            network: config.network.clone(),
            network_cidr: config.network_cidr(),
            ipv6: !config.ipaddr6.is_empty(),
            dhcp: config.dhcp.clone(),
            nfs: config.nfs.clone(),
            tftp: config.tftp.clone(),
            ssh: config.ssh.clone(),
            warewulf: config.warewulf.clone(),
            paths: config.paths.clone(),
            overlay: String::new(),
            build_host: provenance.build_host.clone(),
            build_time: provenance.formatted_time(),
            build_time_unix: provenance.build_time.unix_timestamp().to_string(),
            build_source: String::new(),
            all_nodes: all_nodes.iter().map(NodeSummary::from).collect(),
        }
    }

    /// Copy of this context for rendering one template from `overlay`.
    pub fn for_source(&self, overlay: &str, source: &Path) -> Self {
        let mut ctx = self.clone();
        ctx.overlay = overlay.to_string();
        ctx.build_source = source.display().to_string();
        ctx
    }

    /// Flattened `dotted.name -> value` view used by the directive
    /// preprocessor. `AllNodes` is left out.
    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Ok(Value::Object(map)) = serde_json::to_value(self) {
            for (key, value) in map {
                if key == "AllNodes" {
                    continue;
                }
                flatten(&key, &value, &mut out);
            }
        }
        out
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten(&format!("{}.{}", prefix, key), child, out);
            }
        }
        Value::Array(items) => {
            let joined = items
                .iter()
                .map(scalar)
                .collect::<Vec<_>>()
                .join(",");
            out.insert(prefix.to_string(), joined);
        }
        other => {
            out.insert(prefix.to_string(), scalar(other));
        }
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Builds contexts by looking nodes up in a [`NodeStore`].
pub struct ContextBuilder<'a> {
    config: &'a Config,
    store: &'a dyn NodeStore,
    provenance: Provenance,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(config: &'a Config, store: &'a dyn NodeStore) -> Self {
        Self {
            config,
            store,
            provenance: Provenance::now(),
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// Context for the node called `id`.
    pub fn node(&self, id: &str) -> Result<TemplateContext> {
        let node = self
            .store
            .get_node(id)
            .with_context(|| format!("looking up node '{}'", id))?;
        self.for_node(&node)
    }

    /// Context for an already-resolved node record.
    pub fn for_node(&self, node: &NodeInfo) -> Result<TemplateContext> {
        let all_nodes = self.store.list_nodes().context("listing nodes")?;
        Ok(TemplateContext::build(
            node,
            self.config,
            &all_nodes,
            &self.provenance,
        ))
    }

    /// Context for the provisioning host itself.
    pub fn host(&self) -> Result<TemplateContext> {
        let hostname = local_hostname()?;
        self.for_node(&NodeInfo::new(hostname))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodesFile;
    use time::macros::datetime;

    fn fixed_provenance() -> Provenance {
        Provenance {
            build_host: "head".to_string(),
            build_time: datetime!(2024-03-05 07:08:09 UTC),
        }
    }

    fn sample_node() -> NodeInfo {
        let mut node = NodeInfo::new("n1");
        node.image_name = "rocky9".to_string();
        node.network_devices.insert(
            "default".to_string(),
            NetDev {
                device: "eth0".to_string(),
                ipaddr: "10.0.0.11".to_string(),
                netmask: "255.255.255.0".to_string(),
                ..NetDev::default()
            },
        );
        node.tags.insert("role".to_string(), "compute".to_string());
        node
    }

    #[test]
    fn node_context_fields() {
        let mut config = Config::default();
        config.ipaddr = "10.0.0.1".to_string();
        config.netmask = "255.255.255.0".to_string();
        config.network = "10.0.0.0".to_string();

        let node = sample_node();
        let ctx = TemplateContext::build(&node, &config, &[node.clone()], &fixed_provenance());

        assert_eq!(ctx.id, "n1");
        assert_eq!(ctx.container, "rocky9");
        assert_eq!(ctx.network_cidr, "10.0.0.0/24");
        assert!(!ctx.ipv6);
        assert_eq!(ctx.build_time, "03-05-2024 07:08:09 UTC");
        assert_eq!(ctx.build_host, "head");
        let dev = &ctx.net_devs["default"];
        assert_eq!(dev.prefix, "24");
        assert_eq!(dev.ip_cidr, "10.0.0.11/24");
        assert_eq!(dev.network, "10.0.0.0");
        assert_eq!(ctx.keys, ctx.tags);
        assert_eq!(ctx.all_nodes.len(), 1);
    }

    #[test]
    fn unparseable_netmask_leaves_derived_fields_empty() {
        let mut node = sample_node();
        if let Some(dev) = node.network_devices.get_mut("default") {
            dev.netmask = "garbage".to_string();
        }
        let ctx = TemplateContext::build(&node, &Config::default(), &[], &fixed_provenance());
        let dev = &ctx.net_devs["default"];
        assert_eq!(dev.prefix, "");
        assert_eq!(dev.ip_cidr, "");
        assert_eq!(dev.network, "");
    }

    #[test]
    fn variables_are_flattened() {
        let node = sample_node();
        let ctx = TemplateContext::build(&node, &Config::default(), &[], &fixed_provenance());
        let vars = ctx.variables();
        assert_eq!(vars["Id"], "n1");
        assert_eq!(vars["Tags.role"], "compute");
        assert_eq!(vars["NetDevs.default.IpCIDR"], "10.0.0.11/24");
        assert_eq!(vars["Dhcp.enabled"], "true");
        assert_eq!(vars["Ipv6"], "false");
        assert!(!vars.keys().any(|k| k.starts_with("AllNodes")));
    }

    #[test]
    fn builder_propagates_lookup_failure() {
        let store = NodesFile::from_nodes(vec![sample_node()]);
        let config = Config::default();
        let builder = ContextBuilder::new(&config, &store).with_provenance(fixed_provenance());

        let ctx = builder.node("n1").unwrap();
        assert_eq!(ctx.hostname, "n1");
        assert!(builder.node("missing").is_err());
    }

    #[test]
    fn for_source_records_provenance() {
        let ctx = TemplateContext::default().for_source("wwinit", Path::new("/ov/wwinit/rootfs/motd.ww"));
        assert_eq!(ctx.overlay, "wwinit");
        assert_eq!(ctx.build_source, "/ov/wwinit/rootfs/motd.ww");
    }
}
