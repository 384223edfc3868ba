//! Archive and tree helpers for overlay images.
//!
//! - [`cpio`] - Reproducible `newc` archives, optionally gzip or zstd compressed
//! - [`filesystem`] - Tree copying, ownership, and modification-time scans

pub mod cpio;
pub mod filesystem;
