//! Functions callable from overlay templates.

use minijinja::value::{Value, ValueKind};
use minijinja::{escape_formatter, Environment, Error, ErrorKind, Output, State};
use std::fmt::Write as _;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::emitter::{file_marker, softlink_marker};
use crate::image::ImageStore;

/// Per-render switches templates flip through `abort()` and `nobackup()`.
#[derive(Debug, Default)]
pub struct RenderFlags {
    abort: AtomicBool,
    no_backup: AtomicBool,
}

impl RenderFlags {
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    pub fn disable_backup(&self) {
        self.no_backup.store(true, Ordering::Relaxed);
    }

    pub fn backup(&self) -> bool {
        !self.no_backup.load(Ordering::Relaxed)
    }
}

fn host_path(sysconf_dir: &Path, path: &str) -> PathBuf {
    if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        sysconf_dir.join(path)
    }
}

/// Host file contents, one trailing newline trimmed.
pub fn include(sysconf_dir: &Path, path: &str) -> String {
    let full = host_path(sysconf_dir, path);
    debug!(file = %full.display(), "including file into template");
    match fs::read_to_string(&full) {
        Ok(content) => content
            .strip_suffix('\n')
            .map(str::to_string)
            .unwrap_or(content),
        Err(err) => {
            debug!(file = %full.display(), error = %err, "could not include file into template");
            String::new()
        }
    }
}

/// Lines of a host file up to the first one containing `abort`, then
/// `abort` itself.
pub fn include_block(sysconf_dir: &Path, path: &str, abort: &str) -> String {
    let full = host_path(sysconf_dir, path);
    debug!(file = %full.display(), "including file block into template");
    let file = match fs::File::open(&full) {
        Ok(file) => file,
        Err(err) => {
            info!(file = %full.display(), error = %err, "couldn't read block");
            return abort.to_string();
        }
    };
    let mut out = String::new();
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if line.contains(abort) {
            break;
        }
        out.push_str(&line);
        out.push('\n');
    }
    out.push_str(abort);
    out
}

/// Register the template function library on `env`.
pub fn register(
    env: &mut Environment<'_>,
    sysconf_dir: &Path,
    images: &ImageStore,
    flags: &Arc<RenderFlags>,
) {
    let root = sysconf_dir.to_path_buf();
    env.add_function("Include", move |path: String| include(&root, &path));

    let root = sysconf_dir.to_path_buf();
    env.add_function("IncludeBlock", move |path: String, abort: String| {
        include_block(&root, &path, &abort)
    });

    let images = images.clone();
    env.add_function("IncludeFrom", move |image: String, path: String| {
        images.read_file(&image, &path)
    });

    let f = Arc::clone(flags);
    env.add_function("ImportLink", move |path: String| {
        match fs::canonicalize(&path) {
            Ok(target) => {
                debug!(link = %path, target = %target.display(), "importing softlink");
                softlink_marker(&target.to_string_lossy())
            }
            Err(err) => {
                debug!(link = %path, error = %err, "cannot resolve link, aborting file");
                f.abort();
                String::new()
            }
        }
    });

    env.add_function("file", |name: String| file_marker(&name));
    env.add_function("softlink", |target: String| softlink_marker(&target));

    let f = Arc::clone(flags);
    env.add_function("abort", move || {
        debug!("abort called in template");
        f.abort();
        String::new()
    });

    let f = Arc::clone(flags);
    env.add_function("nobackup", move || {
        debug!("backup disabled by template");
        f.disable_backup();
        String::new()
    });

    env.add_function("inc", |n: i64| {
        n.checked_add(1)
            .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "inc() overflows"))
    });
    env.add_function("dec", |n: i64| {
        n.checked_sub(1)
            .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "dec() overflows"))
    });

    env.set_formatter(format_value);
}

/// Output formatter: booleans print as `true`/`false` so substituted flags
/// read the same as the flattened variables `#WWIFDEF` compares against.
pub fn format_value(out: &mut Output<'_>, state: &State<'_, '_>, value: &Value) -> Result<(), Error> {
    if value.kind() == ValueKind::Bool {
        write!(out, "{}", value.is_true())?;
        return Ok(());
    }
    escape_formatter(out, state, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn render(temp: &TempDir, source: &str) -> (String, Arc<RenderFlags>) {
        let flags = Arc::new(RenderFlags::default());
        let mut env = Environment::new();
        register(
            &mut env,
            temp.path(),
            &ImageStore::new(temp.path().join("images")),
            &flags,
        );
        let out = env.render_str(source, ()).unwrap();
        (out, flags)
    }

    #[test]
    fn include_relative_to_sysconf() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("hosts.tmpl"), "127.0.0.1 localhost\n").unwrap();
        let (out, _) = render(&temp, "[{{ Include('hosts.tmpl') }}][{{ Include('absent') }}]");
        assert_eq!(out, "[127.0.0.1 localhost][]");
    }

    #[test]
    fn include_block_stops_at_marker() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("fstab"), "a\nb\n# END\nc\n").unwrap();
        assert_eq!(include_block(temp.path(), "fstab", "# END"), "a\nb\n# END");
        assert_eq!(include_block(temp.path(), "missing", "# END"), "# END");
    }

    #[test]
    fn include_from_image() {
        let temp = TempDir::new().unwrap();
        let etc = temp.path().join("images/rocky9/rootfs/etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(etc.join("issue"), "Rocky\n").unwrap();
        let (out, _) = render(&temp, "{{ IncludeFrom('rocky9', '/etc/issue') }}");
        assert_eq!(out, "Rocky");
    }

    #[test]
    fn abort_and_nobackup_set_flags() {
        let temp = TempDir::new().unwrap();
        let (out, flags) = render(&temp, "x{{ nobackup() }}");
        assert_eq!(out, "x");
        assert!(!flags.backup());
        assert!(!flags.aborted());

        let (_, flags) = render(&temp, "{{ abort() }}");
        assert!(flags.aborted());
    }

    #[test]
    fn markers_and_arithmetic() {
        let temp = TempDir::new().unwrap();
        let (out, _) = render(&temp, "{{ file('a.conf') }}|{{ inc(1) }}|{{ dec(1) }}");
        assert_eq!(out, "{{ /* file \"a.conf\" */ }}|2|0");
    }

    #[test]
    fn arithmetic_at_the_bounds_is_an_error() {
        let temp = TempDir::new().unwrap();
        let flags = Arc::new(RenderFlags::default());
        let mut env = Environment::new();
        register(&mut env, temp.path(), &ImageStore::new(temp.path().join("images")), &flags);

        let max = i64::MAX;
        let min = i64::MIN;
        assert!(env.render_str("{{ inc(n) }}", minijinja::context! { n => max }).is_err());
        assert!(env.render_str("{{ dec(n) }}", minijinja::context! { n => min }).is_err());
    }

    #[test]
    fn booleans_print_lowercase() {
        let temp = TempDir::new().unwrap();
        let (out, _) = render(&temp, "{{ true }}|{{ false }}|{{ 1 == 2 }}|{{ 'x' }}|{{ 3 }}");
        assert_eq!(out, "true|false|false|x|3");
    }

    #[test]
    fn import_link_resolves_or_aborts() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("target");
        fs::write(&target, "").unwrap();
        let link = temp.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let source = format!("{{{{ ImportLink('{}') }}}}", link.display());
        let (out, flags) = render(&temp, &source);
        let resolved = fs::canonicalize(&target).unwrap();
        assert_eq!(out, softlink_marker(&resolved.to_string_lossy()));
        assert!(!flags.aborted());

        let (_, flags) = render(&temp, "{{ ImportLink('/nonexistent/link') }}");
        assert!(flags.aborted());
    }
}
