//! Line directives applied to rendered template output.
//!
//! After variable substitution, lines starting with one of the `#WW`
//! tokens below control what reaches the output:
//!
//! ```text
//! #WWIFDEF NAME          include following lines unless NAME is "false"
//! #WWIFNDEF NAME         include following lines only if NAME is "false"
//! #WWIF NAME             same as #WWIFDEF
//! #WWIF NAME == VALUE    include following lines only if NAME equals VALUE
//!                        (the first word after `==`; the rest is ignored)
//! #WWELSE                flip inclusion
//! #WWEND                 back to unconditional inclusion
//! #WWINCLUDE PATH        splice the file at PATH verbatim
//! ```
//!
//! NAME is looked up in the flattened template variables; a NAME that is
//! not a variable is used as the value itself, so `#WWIFDEF {{ Tags.x }}`
//! works once substitution has run.
//!
//! There is a single skip flag. Conditionals do not nest: an inner
//! `#WWEND` ends every open region. Lines that look like directives but
//! do not parse are ordinary text.

use anyhow::Result;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

use crate::error::OverlayError;

const PREFIX: &str = "#WW";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Directive<'a> {
    IfDef(&'a str),
    IfNDef(&'a str),
    IfEq(&'a str, &'a str),
    Else,
    End,
    Include(&'a str),
}

impl<'a> Directive<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        if !line.starts_with(PREFIX) {
            return None;
        }
        let mut tokens = line.split_whitespace();
        let keyword = tokens.next()?;
        let args: Vec<&str> = tokens.collect();
        match (keyword, args.as_slice()) {
            ("#WWEND", _) => Some(Directive::End),
            ("#WWELSE", _) => Some(Directive::Else),
            ("#WWIFDEF", [name, ..]) => Some(Directive::IfDef(name)),
            ("#WWIFNDEF", [name, ..]) => Some(Directive::IfNDef(name)),
            ("#WWIF", [name]) => Some(Directive::IfDef(name)),
            ("#WWIF", [name, "==", value, ..]) => Some(Directive::IfEq(name, value)),
            ("#WWINCLUDE", [_, ..]) => {
                let path = line[keyword.len()..].trim();
                Some(Directive::Include(path))
            }
            _ => None,
        }
    }
}

pub struct Preprocessor<'a> {
    variables: &'a BTreeMap<String, String>,
    include_root: PathBuf,
}

impl<'a> Preprocessor<'a> {
    /// `include_root` anchors relative `#WWINCLUDE` paths.
    pub fn new(variables: &'a BTreeMap<String, String>, include_root: impl Into<PathBuf>) -> Self {
        Self {
            variables,
            include_root: include_root.into(),
        }
    }

    fn value<'v>(&'v self, name: &'v str) -> &'v str {
        self.variables.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn process(&self, input: &str) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut skip = false;

        for raw in input.split_inclusive('\n') {
            let line = raw.trim_end_matches(['\n', '\r']);
            match Directive::parse(line) {
                Some(Directive::End) => skip = false,
                Some(Directive::Else) => skip = !skip,
                _ if skip => {}
                Some(Directive::IfDef(name)) => skip = self.value(name) == "false",
                Some(Directive::IfNDef(name)) => skip = self.value(name) != "false",
                Some(Directive::IfEq(name, value)) => skip = self.value(name) != value,
                Some(Directive::Include(path)) => {
                    let path = self.resolve(path);
                    trace!(file = %path.display(), "splicing include");
                    let content = fs::read_to_string(&path).map_err(|source| {
                        OverlayError::Include {
                            path: path.clone(),
                            source,
                        }
                    })?;
                    out.push_str(&content);
                }
                None => out.push_str(raw),
            }
        }

        Ok(out)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.include_root.join(candidate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn run(input: &str, pairs: &[(&str, &str)]) -> String {
        let variables = vars(pairs);
        Preprocessor::new(&variables, "/nonexistent")
            .process(input)
            .unwrap()
    }

    const IFDEF_ELSE: &str = "head\n#WWIFDEF FLAG\nif-text\n#WWELSE\nelse-text\n#WWEND\ntail\n";

    #[test]
    fn ifdef_false_takes_else_branch() {
        assert_eq!(run(IFDEF_ELSE, &[("FLAG", "false")]), "head\nelse-text\ntail\n");
    }

    #[test]
    fn ifdef_any_other_value_takes_if_branch() {
        assert_eq!(run(IFDEF_ELSE, &[("FLAG", "true")]), "head\nif-text\ntail\n");
        assert_eq!(run(IFDEF_ELSE, &[("FLAG", "yes")]), "head\nif-text\ntail\n");
    }

    #[test]
    fn unknown_name_is_its_own_value() {
        assert_eq!(
            run("#WWIFDEF false\nhidden\n#WWEND\nshown\n", &[]),
            "shown\n"
        );
        assert_eq!(run("#WWIFNDEF false\nshown\n#WWEND\n", &[]), "shown\n");
    }

    #[test]
    fn ifndef_is_inverse() {
        let input = "#WWIFNDEF FLAG\nonly-when-false\n#WWEND\n";
        assert_eq!(run(input, &[("FLAG", "false")]), "only-when-false\n");
        assert_eq!(run(input, &[("FLAG", "true")]), "");
    }

    #[test]
    fn if_with_equality() {
        let input = "#WWIF Tags.role == compute\ncompute\n#WWELSE\nother\n#WWEND\n";
        assert_eq!(run(input, &[("Tags.role", "compute")]), "compute\n");
        assert_eq!(run(input, &[("Tags.role", "login")]), "other\n");

        let trailing = "#WWIF Tags.role == compute node\nyes\n#WWEND\n";
        assert_eq!(run(trailing, &[("Tags.role", "compute")]), "yes\n");
        assert_eq!(run(trailing, &[("Tags.role", "login")]), "");

        let bare = "#WWIF FLAG\nyes\n#WWEND\n";
        assert_eq!(run(bare, &[("FLAG", "false")]), "");
        assert_eq!(run(bare, &[("FLAG", "1")]), "yes\n");
    }

    #[test]
    fn malformed_directives_pass_through() {
        let input = "#WWIFDEF\n#WWIF a !=  b\n#WWIF a ==\n#WWINCLUDE\n#WWSOMETHING x\n";
        assert_eq!(run(input, &[]), input);
    }

    #[test]
    fn nested_blocks_share_one_flag() {
        // The inner END re-enables output even though the outer block is false.
        let input = "#WWIFDEF A\na\n#WWIFDEF B\nb\n#WWEND\nafter-inner\n#WWEND\nend\n";
        assert_eq!(run(input, &[("A", "false"), ("B", "true")]), "after-inner\nend\n");
    }

    #[test]
    fn include_splices_verbatim() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("snippet"), "{{ not rendered }}\n").unwrap();
        let variables = vars(&[]);
        let pre = Preprocessor::new(&variables, temp.path());

        assert_eq!(
            pre.process("a\n#WWINCLUDE snippet\nb\n").unwrap(),
            "a\n{{ not rendered }}\nb\n"
        );
        let absolute = format!("#WWINCLUDE {}\n", temp.path().join("snippet").display());
        assert_eq!(pre.process(&absolute).unwrap(), "{{ not rendered }}\n");
    }

    #[test]
    fn include_skipped_inside_excluded_region() {
        let variables = vars(&[("X", "false")]);
        let pre = Preprocessor::new(&variables, "/nonexistent");
        assert_eq!(
            pre.process("#WWIFDEF X\n#WWINCLUDE missing\n#WWEND\nok\n").unwrap(),
            "ok\n"
        );
    }

    #[test]
    fn missing_include_is_an_error() {
        let variables = vars(&[]);
        let pre = Preprocessor::new(&variables, "/nonexistent");
        let err = pre.process("#WWINCLUDE missing\n").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OverlayError>(),
            Some(OverlayError::Include { .. })
        ));
    }

    #[test]
    fn last_line_without_newline_is_kept() {
        assert_eq!(run("a\nb", &[]), "a\nb");
    }
}
