//! Overlay template rendering.
//!
//! A template member (`*.ww`) goes through three stages:
//!
//! 1. variable substitution against a [`TemplateContext`] (minijinja),
//! 2. the `#WW` line directives ([`directive`]),
//! 3. splitting into one or more output files ([`emitter`]).
//!
//! Writing the results is left to [`crate::writer`].

pub mod context;
pub mod directive;
pub mod emitter;
pub mod funcs;

use anyhow::{Context as _, Result};
use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::error::OverlayError;
use crate::image::ImageStore;

pub use context::{ContextBuilder, Provenance, TemplateContext};
pub use directive::Preprocessor;
pub use emitter::{Emitted, EmittedKind};
pub use funcs::RenderFlags;

/// File name suffix marking a template member.
pub const TEMPLATE_SUFFIX: &str = ".ww";

pub fn is_template(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(TEMPLATE_SUFFIX) && n.len() > TEMPLATE_SUFFIX.len())
}

/// `dir/name.ww` -> `dir/name`; non-templates are returned unchanged.
pub fn output_path(path: &Path) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_suffix(TEMPLATE_SUFFIX)) {
        Some(stripped) if is_template(path) => PathBuf::from(stripped),
        _ => path.to_path_buf(),
    }
}

/// Result of rendering one template member.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    /// Empty when the template called `abort()`.
    pub files: Vec<Emitted>,
    pub backup: bool,
}

impl RenderOutput {
    pub fn aborted(&self) -> bool {
        self.files.is_empty()
    }
}

/// Renders template members with a fixed function environment.
#[derive(Debug, Clone)]
pub struct Renderer {
    sysconf_dir: PathBuf,
    images: ImageStore,
}

impl Renderer {
    pub fn new(config: &Config) -> Self {
        Self {
            sysconf_dir: config.paths.sysconf_dir.clone(),
            images: ImageStore::new(&config.paths.image_dir),
        }
    }

    /// Render `source` for `ctx`. Output files land next to `dest`, which
    /// is where the template's own output goes when it names no file.
    pub fn render(&self, ctx: &TemplateContext, source: &Path, dest: &Path) -> Result<RenderOutput> {
        let text = fs::read_to_string(source)
            .with_context(|| format!("Failed to read template {}", source.display()))?;
        self.render_str(ctx, &text, source, dest)
    }

    /// Render template text; `source` is only used for naming and errors.
    pub fn render_str(
        &self,
        ctx: &TemplateContext,
        text: &str,
        source: &Path,
        dest: &Path,
    ) -> Result<RenderOutput> {
        let render_error = |err: Box<dyn std::error::Error + Send + Sync>| OverlayError::Render {
            node: ctx.id.clone(),
            file: source.to_path_buf(),
            source: err,
        };

        let flags = Arc::new(RenderFlags::default());
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        funcs::register(&mut env, &self.sysconf_dir, &self.images, &flags);

        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "template".to_string());
        let rendered = env
            .render_named_str(&name, text, ctx)
            .map_err(|err| render_error(Box::new(err)))?;

        if flags.aborted() {
            debug!(node = %ctx.id, file = %source.display(), "template aborted, nothing written");
            return Ok(RenderOutput {
                files: Vec::new(),
                backup: flags.backup(),
            });
        }

        let variables = ctx.variables();
        let processed = Preprocessor::new(&variables, &self.sysconf_dir)
            .process(&rendered)
            .with_context(|| {
                format!(
                    "Failed to process directives in '{}' for node '{}'",
                    source.display(),
                    ctx.id
                )
            })?;

        let files = emitter::split(&processed, dest).with_context(|| {
            format!(
                "Failed to split output of '{}' for node '{}'",
                source.display(),
                ctx.id
            )
        })?;
        debug!(
            node = %ctx.id,
            file = %source.display(),
            outputs = files.len(),
            "rendered template"
        );
        Ok(RenderOutput {
            files,
            backup: flags.backup(),
        })
    }
}

/// Default content seeded into a newly created template member.
pub const DEFAULT_TEMPLATE: &str = r#"# This is a template file.
#
# This file (suffix '.ww') is written without the suffix when the overlay
# is rendered for each node. Some of the values and logic available here:
#
# Node name = {{ Id }}
# Cluster = {{ ClusterName }}
# Network config = {{ NetDevs.default.Ipaddr }}, {{ NetDevs.default.Hwaddr }}, etc.
#
# Conditional lines use #WWIFDEF / #WWELSE / #WWEND at the start of a line,
# and {% raw %}{{ file("name") }}{% endraw %} starts another output file.

"#;
