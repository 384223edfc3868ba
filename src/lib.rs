//! Per-node overlay templating and archive building for diskless
//! provisioning.
//!
//! An overlay is a named tree of files applied to provisioned nodes. Files
//! ending in `.ww` are templates, rendered for each node before the tree is
//! packed into a `newc` cpio archive that the boot server hands out.
//!
//! # Architecture
//!
//! ```text
//! Builder (build)
//!     │
//!     ├── OverlayStore (overlay)     site/distribution lookup, copy-on-write
//!     ├── Renderer (template)        minijinja -> #WW directives -> file markers
//!     ├── write_atomic (writer)      skip-if-identical, .wwbackup, rename
//!     ├── build_cpio (artifact)      deterministic archive, atomic publish
//!     └── WorkerPool (build::pool)   bounded batch builds
//!
//! NodeStore (node), ImageStore (image) and Config (config) are read-only
//! inputs passed in explicitly.
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use overlay_builder::{Builder, Config, NodeStore, NodesFile};
//!
//! let config = Config::load_default()?;
//! let nodes = NodesFile::load(&config.paths.nodes_file)?;
//! let builder = Builder::new(&config, &nodes);
//! builder.build_all_overlays(&nodes.list_nodes()?, false)?;
//! ```

pub mod artifact;
pub mod build;
pub mod config;
pub mod error;
pub mod image;
pub mod node;
pub mod overlay;
pub mod template;
pub mod writer;

pub use build::{BatchReport, BuildStatus, BuildTarget, Builder};
pub use config::Config;
pub use error::OverlayError;
pub use node::{NodeInfo, NodeStore, NodesFile};
pub use overlay::{Overlay, OverlayStore};
pub use template::{Renderer, TemplateContext};
