//! Global service configuration.
//!
//! One TOML document describes the provisioning host: its addressing,
//! where overlays and archives live, how builds run, and the per-service
//! blocks (DHCP, NFS, TFTP, SSH) that templates branch on. Every section
//! is optional; missing values fall back to the defaults below.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::error::OverlayError;

/// Default location of the configuration document.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/warewulf/overlay-builder.toml";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_ENV: &str = "OVERLAY_BUILDER_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub ipaddr: String,
    pub ipaddr6: String,
    pub netmask: String,
    pub network: String,
    pub paths: PathsConfig,
    pub build: BuildConfig,
    pub warewulf: WarewulfConfig,
    pub dhcp: DhcpConfig,
    pub nfs: NfsConfig,
    pub tftp: TftpConfig,
    pub ssh: SshConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub site_overlay_dir: PathBuf,
    pub distribution_overlay_dir: PathBuf,
    pub provision_dir: PathBuf,
    pub sysconf_dir: PathBuf,
    pub image_dir: PathBuf,
    pub nodes_file: PathBuf,
    pub host_root: PathBuf,
    /// Parent for per-build scratch trees; empty means the system temp dir.
    pub scratch_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            site_overlay_dir: PathBuf::from("/var/lib/warewulf/overlays"),
            distribution_overlay_dir: PathBuf::from("/usr/share/warewulf/overlays"),
            provision_dir: PathBuf::from("/srv/warewulf/provision"),
            sysconf_dir: PathBuf::from("/etc/warewulf"),
            image_dir: PathBuf::from("/var/lib/warewulf/chroots"),
            nodes_file: PathBuf::from("/etc/warewulf/nodes.toml"),
            host_root: PathBuf::from("/"),
            scratch_dir: PathBuf::new(),
        }
    }
}

impl PathsConfig {
    /// Directory holding the per-node archive directories.
    pub fn overlay_provision_dir(&self) -> PathBuf {
        self.provision_dir.join("overlays")
    }

    pub fn scratch_parent(&self) -> PathBuf {
        if self.scratch_dir.as_os_str().is_empty() {
            std::env::temp_dir()
        } else {
            self.scratch_dir.clone()
        }
    }
}

/// Compression applied to the packed archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Zstd,
}

impl Compression {
    /// File name suffix appended to the archive path.
    pub fn extension(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Zstd => ".zst",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Worker pool width; 0 means one worker per CPU.
    pub workers: usize,
    pub compression: Compression,
    pub autobuild: bool,
    pub enable_host_overlay: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            compression: Compression::Gzip,
            autobuild: true,
            enable_host_overlay: true,
        }
    }
}

impl BuildConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WarewulfConfig {
    pub port: u16,
    pub secure: bool,
    pub update_interval: u32,
    pub autobuild_overlays: bool,
    pub syslog: bool,
}

impl Default for WarewulfConfig {
    fn default() -> Self {
        Self {
            port: 9873,
            secure: true,
            update_interval: 60,
            autobuild_overlays: true,
            syslog: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DhcpConfig {
    pub enabled: bool,
    pub template: String,
    pub range_start: String,
    pub range_end: String,
    pub systemd_name: String,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            template: "default".to_string(),
            range_start: String::new(),
            range_end: String::new(),
            systemd_name: "dhcpd".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NfsConfig {
    pub enabled: bool,
    pub systemd_name: String,
    pub export_paths: Vec<NfsExport>,
}

impl Default for NfsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            systemd_name: "nfs-server".to_string(),
            export_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NfsExport {
    pub path: String,
    pub export_options: String,
    pub mount_options: String,
    pub mount: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TftpConfig {
    pub enabled: bool,
    pub tftp_root: String,
    pub systemd_name: String,
    pub ipxe: Vec<String>,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tftp_root: "/var/lib/tftpboot".to_string(),
            systemd_name: "tftp".to_string(),
            ipxe: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub key_types: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key_types: vec![
                "rsa".to_string(),
                "dsa".to_string(),
                "ecdsa".to_string(),
                "ed25519".to_string(),
            ],
        }
    }
}

impl Config {
    /// Load the configuration document at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| OverlayError::Config {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::parse(&text, path)
    }

    /// Load from `OVERLAY_BUILDER_CONFIG` or the default path. A missing
    /// default file yields the built-in defaults.
    pub fn load_default() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        let path = Path::new(DEFAULT_CONFIG_PATH);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        let mut config: Config = toml::from_str(text).map_err(|err| OverlayError::Config {
            path: origin.to_path_buf(),
            message: err.to_string(),
        })?;
        if config.network.is_empty() {
            if let Some(net) = ipv4_network(&config.ipaddr, &config.netmask) {
                config.network = net.to_string();
            }
        }
        Ok(config)
    }

    /// `network/prefix` form of the host network, empty when unknown.
    pub fn network_cidr(&self) -> String {
        let network = if self.network.is_empty() {
            ipv4_network(&self.ipaddr, &self.netmask)
        } else {
            self.network.parse().ok()
        };
        match (network, netmask_prefix(&self.netmask)) {
            (Some(net), Some(prefix)) => format!("{}/{}", net, prefix),
            _ => String::new(),
        }
    }

    /// Create the directories builds write into.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            &self.paths.site_overlay_dir,
            &self.paths.overlay_provision_dir(),
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating directory '{}'", dir.display()))?;
        }
        Ok(())
    }

    /// Configuration rooted entirely under `root`, used by tests and
    /// throwaway builds.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            ipaddr: "10.0.0.1".to_string(),
            netmask: "255.255.255.0".to_string(),
            network: "10.0.0.0".to_string(),
            paths: PathsConfig {
                site_overlay_dir: root.join("var/lib/warewulf/overlays"),
                distribution_overlay_dir: root.join("usr/share/warewulf/overlays"),
                provision_dir: root.join("srv/warewulf/provision"),
                sysconf_dir: root.join("etc/warewulf"),
                image_dir: root.join("var/lib/warewulf/chroots"),
                nodes_file: root.join("etc/warewulf/nodes.toml"),
                host_root: root.join("host"),
                scratch_dir: root.join("tmp"),
            },
            ..Self::default()
        }
    }
}

/// Prefix length of a dotted netmask; `None` for unparseable or
/// non-contiguous masks.
pub fn netmask_prefix(netmask: &str) -> Option<u32> {
    let mask = u32::from(netmask.trim().parse::<Ipv4Addr>().ok()?);
    let prefix = mask.leading_ones();
    if mask.checked_shl(prefix).unwrap_or(0) != 0 {
        return None;
    }
    Some(prefix)
}

/// Network address of `ipaddr` under `netmask`.
pub fn ipv4_network(ipaddr: &str, netmask: &str) -> Option<Ipv4Addr> {
    let ip = u32::from(ipaddr.trim().parse::<Ipv4Addr>().ok()?);
    let mask = u32::from(netmask.trim().parse::<Ipv4Addr>().ok()?);
    Some(Ipv4Addr::from(ip & mask))
}
