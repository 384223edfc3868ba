//! Overlay archive builds.
//!
//! One build target is a node, an optional context name (`system`,
//! `runtime`) and an ordered overlay list. Building it walks through
//!
//! ```text
//! Pending -> StalenessCheck -> Skipped
//!                           -> Layering -> Rendering -> Packing -> Published
//! ```
//!
//! with `Failed` reachable from every active state. Layering and rendering
//! happen in a private scratch directory that is removed however the build
//! ends; the archive is published by renaming a finished temporary file.
//!
//! Batches submit one job per target to a [`pool::WorkerPool`] and collect
//! one [`TargetOutcome`] per target. A failing target never stops the
//! others.

pub mod pool;

use anyhow::{bail, Context as _, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

use crate::artifact::cpio::build_cpio;
use crate::artifact::filesystem::{copy_ownership, newest_mtime};
use crate::config::{Compression, Config};
use crate::error::OverlayError;
use crate::node::{NodeInfo, NodeStore, RUNTIME_CONTEXT, SYSTEM_CONTEXT};
use crate::overlay::{Overlay, OverlayStore};
use crate::template::{
    context::local_hostname, output_path, ContextBuilder, Provenance, RenderOutput, Renderer,
    TemplateContext,
};
use crate::writer::write_emitted;

use pool::{Job, WorkerPool};

/// Overlay rendered onto the provisioning host itself.
pub const HOST_OVERLAY: &str = "host";

const ARCHIVE_SUFFIX: &str = ".img";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Pending,
    StalenessCheck,
    Skipped,
    Layering,
    Rendering,
    Packing,
    Published,
    Failed,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildState::Pending => "pending",
            BuildState::StalenessCheck => "staleness-check",
            BuildState::Skipped => "skipped",
            BuildState::Layering => "layering",
            BuildState::Rendering => "rendering",
            BuildState::Packing => "packing",
            BuildState::Published => "published",
            BuildState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a single build produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    /// The archive was newer than its sources.
    Skipped(PathBuf),
    Built(PathBuf),
}

impl BuildStatus {
    pub fn archive(&self) -> &Path {
        match self {
            BuildStatus::Skipped(path) | BuildStatus::Built(path) => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    pub node: String,
    pub context: Option<String>,
    pub overlays: Vec<String>,
}

impl BuildTarget {
    pub fn new(node: &NodeInfo, context: Option<&str>, overlays: &[String]) -> Self {
        Self {
            node: node.id.clone(),
            context: context.map(str::to_string),
            overlays: effective_overlays(node, context, overlays).to_vec(),
        }
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{}/{}", self.node, context),
            None => write!(f, "{}/{}", self.node, self.overlays.join("-")),
        }
    }
}

/// Result of one target in a batch.
#[derive(Debug)]
pub struct TargetOutcome {
    pub target: BuildTarget,
    pub result: Result<BuildStatus>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<TargetOutcome>,
}

impl BatchReport {
    pub fn failed(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn built(&self) -> usize {
        self.count(|status| matches!(status, BuildStatus::Built(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|status| matches!(status, BuildStatus::Skipped(_)))
    }

    fn count(&self, pred: impl Fn(&BuildStatus) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.result.as_ref().is_ok_and(&pred))
            .count()
    }

    /// `Err(BatchFailed)` naming every failed target, if any failed.
    pub fn into_result(self) -> Result<Self> {
        let failed: Vec<String> = self.failed().map(|o| o.target.to_string()).collect();
        if failed.is_empty() {
            Ok(self)
        } else {
            Err(OverlayError::BatchFailed { failed }.into())
        }
    }
}

/// The overlays a target builds: the explicit list, or the node's list for
/// `context` when none is given.
fn effective_overlays<'a>(
    node: &'a NodeInfo,
    context: Option<&str>,
    overlays: &'a [String],
) -> &'a [String] {
    match context {
        Some(context) if overlays.is_empty() => node.overlays_for(context),
        _ => overlays,
    }
}

/// Archive path without the compression suffix:
/// `<provision>/overlays/<node>/__SYSTEM__.img` for a context, otherwise
/// the overlay names joined by `-`.
pub fn image_path(
    config: &Config,
    node: &str,
    context: Option<&str>,
    overlays: &[String],
) -> Result<PathBuf> {
    if node.is_empty() || node.contains('/') || node.starts_with('.') {
        bail!("invalid node name for overlay image: '{}'", node);
    }
    let name = match context {
        Some(context) if !context.is_empty() => format!("__{}__", context.to_uppercase()),
        _ if overlays.is_empty() => return Err(OverlayError::NoOverlays(node.to_string()).into()),
        _ => overlays.join("-"),
    };
    Ok(config
        .paths
        .overlay_provision_dir()
        .join(node)
        .join(format!("{}{}", name, ARCHIVE_SUFFIX)))
}

fn with_extension(path: PathBuf, compression: Compression) -> PathBuf {
    let mut name = path.into_os_string();
    name.push(compression.extension());
    PathBuf::from(name)
}

/// A template waiting to be rendered into a layered tree.
#[derive(Debug)]
struct PendingTemplate {
    /// Position of the supplying overlay in the target's list.
    layer: usize,
    overlay: String,
    source: PathBuf,
}

/// What layering left in a tree: templates keyed by output path and the
/// overlay position that last supplied each plain file.
#[derive(Debug)]
struct Layers {
    templates: Vec<(PathBuf, PendingTemplate)>,
    plain: BTreeMap<PathBuf, usize>,
}

/// Builds overlay archives and renders overlays into directories.
pub struct Builder<'a> {
    config: &'a Config,
    nodes: &'a dyn NodeStore,
    overlays: OverlayStore,
    renderer: Renderer,
    provenance: Provenance,
}

impl<'a> Builder<'a> {
    pub fn new(config: &'a Config, nodes: &'a dyn NodeStore) -> Self {
        Self {
            config,
            nodes,
            overlays: OverlayStore::from_config(config),
            renderer: Renderer::new(config),
            provenance: Provenance::now(),
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn overlay_store(&self) -> &OverlayStore {
        &self.overlays
    }

    fn contexts(&self) -> ContextBuilder<'_> {
        ContextBuilder::new(self.config, self.nodes).with_provenance(self.provenance.clone())
    }

    /// Published archive path, compression suffix included.
    pub fn archive_path(
        &self,
        node: &str,
        context: Option<&str>,
        overlays: &[String],
    ) -> Result<PathBuf> {
        let base = image_path(self.config, node, context, overlays)?;
        Ok(with_extension(base, self.config.build.compression))
    }

    /// Whether `archive` is missing or older than any of its sources.
    pub fn is_stale(&self, archive: &Path, sources: &[Overlay]) -> Result<bool> {
        let built = match fs::metadata(archive) {
            Ok(md) => md
                .modified()
                .with_context(|| format!("Failed to read mtime of {}", archive.display()))?,
            Err(_) => return Ok(true),
        };
        let mut newest: Option<SystemTime> = self.nodes.modified();
        for overlay in sources {
            if let Some(mtime) = newest_mtime(overlay.path())? {
                newest = newest.max(Some(mtime));
            }
        }
        Ok(newest.is_some_and(|n| n > built))
    }

    /// Build one target. With no explicit `overlays`, the node's overlay
    /// list for `context` is used.
    pub fn build_overlay(
        &self,
        node: &NodeInfo,
        context: Option<&str>,
        overlays: &[String],
        force: bool,
    ) -> Result<BuildStatus> {
        let target = BuildTarget::new(node, context, overlays);
        let mut state = BuildState::Pending;
        let result = self.run_target(node, &target, force, &mut state);
        if let Err(err) = &result {
            let failed = BuildState::Failed;
            debug!(build = %target, from = %state, to = %failed, "state");
            warn!(build = %target, state = %state, error = %format!("{:#}", err), "overlay build failed");
        }
        result
    }

    fn run_target(
        &self,
        node: &NodeInfo,
        target: &BuildTarget,
        force: bool,
        state: &mut BuildState,
    ) -> Result<BuildStatus> {
        let mut enter = |next: BuildState| {
            let from = *state;
            debug!(build = %target, from = %from, to = %next, "state");
            *state = next;
        };

        if target.overlays.is_empty() {
            return Err(OverlayError::NoOverlays(target.node.clone()).into());
        }
        let archive = self.archive_path(&target.node, target.context.as_deref(), &target.overlays)?;

        enter(BuildState::StalenessCheck);
        let sources = target
            .overlays
            .iter()
            .map(|name| self.overlays.resolve(name))
            .collect::<Result<Vec<_>>>()?;
        if !force && !self.is_stale(&archive, &sources)? {
            enter(BuildState::Skipped);
            info!(build = %target, archive = %archive.display(), "overlay archive is up to date");
            return Ok(BuildStatus::Skipped(archive));
        }

        enter(BuildState::Layering);
        let scratch_parent = self.config.paths.scratch_parent();
        fs::create_dir_all(&scratch_parent).with_context(|| {
            format!("Failed to create scratch directory: {}", scratch_parent.display())
        })?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!(".overlay-{}-", target.node))
            .tempdir_in(&scratch_parent)
            .with_context(|| {
                format!("Failed to create scratch directory in {}", scratch_parent.display())
            })?;
        let layers = self.layer(&target.overlays, scratch.path())?;

        enter(BuildState::Rendering);
        let ctx = self
            .contexts()
            .for_node(node)
            .with_context(|| format!("Failed to build template context for '{}'", node.id))?;
        self.render_templates(&ctx, &layers, scratch.path())?;

        enter(BuildState::Packing);
        build_cpio(scratch.path(), &archive, self.config.build.compression)
            .with_context(|| format!("Failed to pack overlay archive for {}", target))?;

        enter(BuildState::Published);
        info!(build = %target, archive = %archive.display(), "built overlay archive");
        Ok(BuildStatus::Built(archive))
    }

    /// Copy `overlays` into `dir` in order, collecting the templates still
    /// to render. A later overlay's plain file or template replaces an
    /// earlier template for the same output.
    fn layer(&self, overlays: &[String], dir: &Path) -> Result<Layers> {
        let mut templates: BTreeMap<PathBuf, PendingTemplate> = BTreeMap::new();
        let mut plain = BTreeMap::new();
        for (layer, name) in overlays.iter().enumerate() {
            let layered = self.overlays.layer_into(name, dir)?;
            for file in layered.files {
                templates.remove(&file);
                plain.insert(file, layer);
            }
            for template in layered.templates {
                let pending = PendingTemplate {
                    layer,
                    overlay: name.clone(),
                    source: layered.overlay.member(&template),
                };
                templates.insert(output_path(&template), pending);
            }
        }
        let mut templates: Vec<(PathBuf, PendingTemplate)> = templates.into_iter().collect();
        templates.sort_by_key(|(_, pending)| pending.layer);
        Ok(Layers { templates, plain })
    }

    /// Render `layers.templates` into `dir` in overlay order. Outputs that
    /// a later overlay supplies as a plain file are left alone.
    fn render_templates(&self, ctx: &TemplateContext, layers: &Layers, dir: &Path) -> Result<usize> {
        let mut written = 0;
        for (out, pending) in &layers.templates {
            let source = &pending.source;
            let md = fs::metadata(source)
                .with_context(|| format!("Failed to stat template {}", source.display()))?;
            let ctx = ctx.for_source(&pending.overlay, source);
            let output = self.renderer.render(&ctx, source, &dir.join(out))?;
            if output.aborted() {
                continue;
            }
            for emitted in &output.files {
                let rel = emitted.path.strip_prefix(dir).unwrap_or(emitted.path.as_path());
                if layers.plain.get(rel).is_some_and(|&layer| layer > pending.layer) {
                    debug!(file = %rel.display(), template = %source.display(), "output shadowed by a later overlay");
                    continue;
                }
                write_emitted(emitted, md.mode() & 0o7777, output.backup).with_context(|| {
                    format!("Failed to write {} from template {}", emitted.path.display(), source.display())
                })?;
                copy_ownership(&md, &emitted.path);
                written += 1;
            }
        }
        Ok(written)
    }

    /// Layer and render `overlays` for `node` straight into `dir`, without
    /// packing. Returns the number of files rendered from templates.
    pub fn build_overlay_in_dir(&self, node: &NodeInfo, overlays: &[String], dir: &Path) -> Result<usize> {
        if overlays.is_empty() {
            return Err(OverlayError::NoOverlays(node.id.clone()).into());
        }
        if !dir.is_dir() {
            bail!("output {} must be a directory", dir.display());
        }
        debug!(node = %node.id, overlays = %overlays.join(","), dir = %dir.display(), "building overlays in directory");
        let layers = self.layer(overlays, dir)?;
        let ctx = self
            .contexts()
            .for_node(node)
            .with_context(|| format!("Failed to build template context for '{}'", node.id))?;
        self.render_templates(&ctx, &layers, dir)
    }

    /// Render the `host` overlay onto the provisioning host.
    pub fn build_host_overlay(&self) -> Result<()> {
        if !self.config.build.enable_host_overlay {
            info!("host overlay is disabled");
            return Ok(());
        }
        let host = NodeInfo::new(local_hostname()?);
        let root = &self.config.paths.host_root;
        let written = self
            .build_overlay_in_dir(&host, &[HOST_OVERLAY.to_string()], root)
            .with_context(|| format!("Failed to build host overlay into {}", root.display()))?;
        info!(host = %host.id, root = %root.display(), files = written, "built host overlay");
        Ok(())
    }

    /// Render one overlay member for node `node_id` without writing it.
    pub fn render_member(&self, overlay: &str, path: &str, node_id: &str) -> Result<RenderOutput> {
        let source = self.overlays.member_path(overlay, path)?;
        let ctx = self.contexts().node(node_id)?.for_source(overlay, &source);
        let dest = output_path(Path::new(path.trim_start_matches('/')));
        self.renderer.render(&ctx, &source, &dest)
    }

    /// Build every target in `targets`, `workers` at a time.
    pub fn build_targets(&self, targets: &[(NodeInfo, BuildTarget)], force: bool) -> BatchReport {
        let pool = WorkerPool::new(self.config.build.effective_workers());
        info!(targets = targets.len(), workers = pool.width(), "building overlay archives");
        let jobs: Vec<Job<'_, Result<BuildStatus>>> = targets
            .iter()
            .map(|(node, target)| {
                Box::new(move || {
                    self.build_overlay(node, target.context.as_deref(), &target.overlays, force)
                }) as Job<'_, Result<BuildStatus>>
            })
            .collect();
        let results = pool.run(jobs);

        let outcomes = targets
            .iter()
            .zip(results)
            .map(|((_, target), result)| {
                if let Err(err) = &result {
                    error!(build = %target, error = %format!("{:#}", err), "target failed");
                }
                TargetOutcome {
                    target: target.clone(),
                    result,
                }
            })
            .collect();
        let report = BatchReport { outcomes };
        info!(
            built = report.built(),
            skipped = report.skipped(),
            failed = report.failed().count(),
            "overlay build finished"
        );
        report
    }

    /// System and runtime archives for every node in `nodes`.
    pub fn build_all_overlays(&self, nodes: &[NodeInfo], force: bool) -> Result<BatchReport> {
        let mut targets = Vec::new();
        for node in nodes {
            for context in [SYSTEM_CONTEXT, RUNTIME_CONTEXT] {
                if node.overlays_for(context).is_empty() {
                    debug!(node = %node.id, context, "no overlays configured");
                    continue;
                }
                targets.push((node.clone(), BuildTarget::new(node, Some(context), &[])));
            }
        }
        self.build_targets(&targets, force).into_result()
    }

    /// One archive per node holding exactly `overlays`.
    pub fn build_specific_overlays(
        &self,
        nodes: &[NodeInfo],
        overlays: &[String],
        force: bool,
    ) -> Result<BatchReport> {
        if overlays.is_empty() {
            bail!("no overlays given to build");
        }
        let targets: Vec<_> = nodes
            .iter()
            .map(|node| (node.clone(), BuildTarget::new(node, None, overlays)))
            .collect();
        self.build_targets(&targets, force).into_result()
    }

    /// Archive for a booting node: rebuilt when missing, or when stale and
    /// `autobuild` is on. `None` when no complete archive can be produced.
    pub fn prepare_image(&self, node: &NodeInfo, context: Option<&str>, overlays: &[String]) -> Option<PathBuf> {
        match self.try_prepare_image(node, context, overlays) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(node = %node.id, error = %format!("{:#}", err), "overlay archive not available");
                None
            }
        }
    }

    fn try_prepare_image(&self, node: &NodeInfo, context: Option<&str>, overlays: &[String]) -> Result<PathBuf> {
        let overlays = effective_overlays(node, context, overlays);
        let archive = self.archive_path(&node.id, context, overlays)?;
        if !archive.is_file() {
            self.build_overlay(node, context, overlays, true)?;
        } else if self.config.build.autobuild {
            self.build_overlay(node, context, overlays, false)?;
        }
        if !archive.is_file() {
            bail!("overlay archive missing after build: {}", archive.display());
        }
        Ok(archive)
    }

    /// Remove a target's archive in every compression variant.
    pub fn remove_image(&self, node: &str, context: Option<&str>, overlays: &[String]) -> Result<()> {
        let base = image_path(self.config, node, context, overlays)?;
        for compression in [Compression::None, Compression::Gzip, Compression::Zstd] {
            let path = with_extension(base.clone(), compression);
            match fs::remove_file(&path) {
                Ok(()) => debug!(archive = %path.display(), "removed overlay archive"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("Failed to remove {}", path.display()))
                }
            }
        }
        Ok(())
    }
}
