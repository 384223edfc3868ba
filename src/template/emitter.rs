//! Split one rendered template into the files it describes.
//!
//! A line containing `{{ /* file "name" */ }}` starts a new destination;
//! a line containing `{{ /* softlink "target" */ }}` turns the current
//! destination into a symlink. Marker lines never reach the output.

use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::overlay::member_relpath;

/// Marker produced by the `file()` template function.
pub fn file_marker(name: &str) -> String {
    format!("{{{{ /* file \"{}\" */ }}}}", name)
}

/// Marker produced by the `softlink()` template function.
pub fn softlink_marker(target: &str) -> String {
    format!("{{{{ /* softlink \"{}\" */ }}}}", target)
}

fn file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{\{\s*/\*\s*file\s*["'](.*)["']\s*\*/\s*\}\}"#)
            .expect("file marker pattern is valid")
    })
}

fn softlink_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{\{\s*/\*\s*softlink\s*["'](.*)["']\s*\*/\s*\}\}"#)
            .expect("softlink marker pattern is valid")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmittedKind {
    Content(String),
    Symlink(String),
}

/// One output file of a render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emitted {
    pub path: PathBuf,
    pub kind: EmittedKind,
}

struct Segment {
    path: PathBuf,
    buffer: String,
    link: Option<String>,
}

impl Segment {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            buffer: String::new(),
            link: None,
        }
    }

    fn is_blank(&self) -> bool {
        self.link.is_none() && self.buffer.trim().is_empty()
    }

    fn finish(self) -> Emitted {
        let kind = match self.link {
            Some(target) => EmittedKind::Symlink(target),
            None => EmittedKind::Content(self.buffer),
        };
        Emitted {
            path: self.path,
            kind,
        }
    }
}

/// Split `rendered` into output files. `default` is where the template's
/// output goes when it names no file; named files are placed next to it
/// and may not climb out of that directory.
pub fn split(rendered: &str, default: &Path) -> Result<Vec<Emitted>> {
    let dir = default.parent().unwrap_or_else(|| Path::new(""));
    let mut out = Vec::new();
    let mut current = Segment::new(default.to_path_buf());
    let mut seen_marker = false;

    for line in rendered.split_inclusive('\n') {
        if let Some(caps) = file_re().captures(line) {
            let name = member_relpath(&caps[1])
                .with_context(|| format!("Invalid output file name in marker: '{}'", &caps[1]))?;
            let next = Segment::new(dir.join(name));
            let previous = std::mem::replace(&mut current, next);
            // Whitespace ahead of the first marker is not a file.
            if seen_marker || !previous.is_blank() {
                out.push(previous.finish());
            }
            seen_marker = true;
            continue;
        }
        if let Some(caps) = softlink_re().captures(line) {
            current.link = Some(caps[1].to_string());
            continue;
        }
        current.buffer.push_str(line);
    }

    out.push(current.finish());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(e: &Emitted) -> &str {
        match &e.kind {
            EmittedKind::Content(text) => text,
            EmittedKind::Symlink(_) => panic!("expected content for {}", e.path.display()),
        }
    }

    #[test]
    fn no_marker_uses_template_name() {
        let out = split("hello\n", Path::new("/s/etc/motd")).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, PathBuf::from("/s/etc/motd"));
        assert_eq!(content(&out[0]), "hello\n");
    }

    #[test]
    fn two_markers_fan_out() {
        let rendered = format!(
            "{}\nalpha\n{}\nbeta\n",
            file_marker("a.conf"),
            file_marker("b.conf")
        );
        let out = split(&rendered, Path::new("/s/etc/multi")).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].path, PathBuf::from("/s/etc/a.conf"));
        assert_eq!(content(&out[0]), "alpha\n");
        assert_eq!(out[1].path, PathBuf::from("/s/etc/b.conf"));
        assert_eq!(content(&out[1]), "beta\n");
    }

    #[test]
    fn non_blank_preamble_keeps_default_name() {
        let rendered = format!("head\n{}\nbody\n", file_marker("other"));
        let out = split(&rendered, Path::new("d/main")).unwrap();
        let paths: Vec<_> = out.iter().map(|e| e.path.clone()).collect();
        assert_eq!(paths, [PathBuf::from("d/main"), PathBuf::from("d/other")]);
        assert_eq!(content(&out[0]), "head\n");
    }

    #[test]
    fn marker_text_around_tag_is_dropped() {
        let rendered = "# {{ /* file '/abs/name' */ }} trailing\nx\n";
        let out = split(rendered, Path::new("d/t")).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, PathBuf::from("d/abs/name"));
        assert_eq!(content(&out[0]), "x\n");
    }

    #[test]
    fn marker_names_stay_inside_the_tree() {
        let rendered = format!("{}\nx\n", file_marker("../../x"));
        assert!(split(&rendered, Path::new("d/t")).is_err());

        let rendered = format!("{}\nx\n", file_marker("./sub/./y"));
        let out = split(&rendered, Path::new("d/t")).unwrap();
        assert_eq!(out[0].path, PathBuf::from("d/sub/y"));
    }

    #[test]
    fn softlink_makes_symlink() {
        let rendered = format!(
            "{}\n{}\n",
            file_marker("link"),
            softlink_marker("/usr/lib/target")
        );
        let out = split(&rendered, Path::new("d/t")).unwrap();
        assert_eq!(
            out,
            [Emitted {
                path: PathBuf::from("d/link"),
                kind: EmittedKind::Symlink("/usr/lib/target".to_string()),
            }]
        );
    }
}
