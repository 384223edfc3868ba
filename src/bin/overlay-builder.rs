use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use nix::unistd::{Group, User};
use overlay_builder::build::{BuildStatus, Builder};
use overlay_builder::config::Config;
use overlay_builder::node::{filter_by_name, NodeInfo, NodeStore, NodesFile};
use overlay_builder::overlay::OverlayStore;
use overlay_builder::template::EmittedKind;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage: overlay-builder [-v] [--config FILE] <command>\n\
     \n\
     Commands:\n  \
       build [--force] [-O a,b] [--output DIR] [node...]\n  \
       build-host\n  \
       create <overlay>\n  \
       delete [--force] [--parents] [--noupdate] <overlay> [file...]\n  \
       list [-a]\n  \
       show <overlay> <file> [--render NODE]\n  \
       import [--overwrite] [--parents] [--noupdate] <overlay> <source> [dest]\n  \
       mkdir [--mode MODE] [--noupdate] <overlay> <dir>\n  \
       chmod [--noupdate] <overlay> <file> <mode>\n  \
       chown [--noupdate] <overlay> <file> <user> [group]\n  \
       edit [--parents] [--noupdate] <overlay> <file>\n  \
       image path <node> <context>\n  \
       image rm <node> <context>"
}

/// Remove `flag` from `args`, reporting whether it was present.
fn take_flag(args: &mut Vec<String>, names: &[&str]) -> bool {
    let before = args.len();
    args.retain(|arg| !names.contains(&arg.as_str()));
    args.len() != before
}

/// Remove `flag VALUE` from `args` and return the value.
fn take_value(args: &mut Vec<String>, names: &[&str]) -> Result<Option<String>> {
    let Some(pos) = args.iter().position(|arg| names.contains(&arg.as_str())) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("{} needs a value", args[pos]);
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

fn parse_mode(text: &str) -> Result<u32> {
    u32::from_str_radix(text.trim_start_matches("0o"), 8)
        .with_context(|| format!("invalid octal mode '{}'", text))
}

fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let verbose = take_flag(&mut args, &["-v", "--verbose"]);
    let config_path = take_value(&mut args, &["-c", "--config"])?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .without_time()
        .init();

    let config = match config_path {
        Some(path) => Config::load(Path::new(&path))?,
        None => Config::load_default()?,
    };

    let Some(command) = args.first().cloned() else {
        bail!(usage());
    };
    let mut rest = args.split_off(1);
    let cli = Cli { config };

    match command.as_str() {
        "build" => {
            let force = take_flag(&mut rest, &["-f", "--force"]);
            let overlays = take_value(&mut rest, &["-O", "--overlays"])?;
            let output = take_value(&mut rest, &["-o", "--output"])?;
            cli.build(&rest, force, overlays.as_deref(), output.as_deref())
        }
        "build-host" => cli.builder_with(&NodesFile::from_nodes(Vec::new()), |b| b.build_host_overlay()),
        "create" => match rest.as_slice() {
            [name] => {
                let overlay = cli.store().create(name)?;
                println!("Created overlay {} at {}", name, overlay.path().display());
                Ok(())
            }
            _ => bail!(usage()),
        },
        "delete" => {
            let force = take_flag(&mut rest, &["-f", "--force"]);
            let parents = take_flag(&mut rest, &["-p", "--parents"]);
            let noupdate = take_flag(&mut rest, &["--noupdate"]);
            match rest.as_slice() {
                [name] => cli.store().delete(name, force),
                [name, files @ ..] => {
                    for file in files {
                        cli.store().delete_member(name, file, force, parents)?;
                    }
                    cli.rebuild_users(name, noupdate)
                }
                _ => bail!(usage()),
            }
        }
        "list" => {
            let all = take_flag(&mut rest, &["-a", "--all"]);
            if !rest.is_empty() {
                bail!(usage());
            }
            cli.list(all)
        }
        "show" => {
            let render = take_value(&mut rest, &["-r", "--render"])?;
            match rest.as_slice() {
                [name, file] => cli.show(name, file, render.as_deref()),
                _ => bail!(usage()),
            }
        }
        "import" => {
            let overwrite = take_flag(&mut rest, &["-o", "--overwrite"]);
            let parents = take_flag(&mut rest, &["-p", "--parents"]);
            let noupdate = take_flag(&mut rest, &["--noupdate"]);
            let (name, source, dest) = match rest.as_slice() {
                [name, source] => (name, source, None),
                [name, source, dest] => (name, source, Some(dest.as_str())),
                _ => bail!(usage()),
            };
            let path = cli
                .store()
                .import_file(name, Path::new(source), dest, overwrite, parents)?;
            info!(overlay = %name, file = %path.display(), "imported file");
            cli.rebuild_users(name, noupdate)
        }
        "mkdir" => {
            let mode = take_value(&mut rest, &["-m", "--mode"])?;
            let noupdate = take_flag(&mut rest, &["--noupdate"]);
            let mode = mode.as_deref().map(parse_mode).transpose()?.unwrap_or(0o755);
            match rest.as_slice() {
                [name, dir] => {
                    cli.store().mkdir(name, dir, mode)?;
                    cli.rebuild_users(name, noupdate)
                }
                _ => bail!(usage()),
            }
        }
        "chmod" => {
            let noupdate = take_flag(&mut rest, &["--noupdate"]);
            match rest.as_slice() {
                [name, file, mode] => {
                    cli.store().chmod(name, file, parse_mode(mode)?)?;
                    cli.rebuild_users(name, noupdate)
                }
                _ => bail!(usage()),
            }
        }
        "chown" => {
            let noupdate = take_flag(&mut rest, &["--noupdate"]);
            let (name, file, uid, gid) = match rest.as_slice() {
                [name, file, user] => (name, file, lookup_uid(user)?, None),
                [name, file, user, group] => (name, file, lookup_uid(user)?, Some(lookup_gid(group)?)),
                _ => bail!(usage()),
            };
            cli.store().chown(name, file, uid, gid)?;
            cli.rebuild_users(name, noupdate)
        }
        "edit" => {
            let parents = take_flag(&mut rest, &["-p", "--parents"]);
            let noupdate = take_flag(&mut rest, &["--noupdate"]);
            match rest.as_slice() {
                [name, file] => {
                    let path = cli.store().prepare_edit(name, file, parents)?;
                    run_editor(&path)?;
                    cli.rebuild_users(name, noupdate)
                }
                _ => bail!(usage()),
            }
        }
        "image" => match rest.as_slice() {
            [sub, node, context] if sub == "path" => cli.with_builder(|b| {
                let path = b.archive_path(node, Some(context.as_str()), &[])?;
                let state = if path.is_file() { "present" } else { "missing" };
                println!("{} ({})", path.display(), state);
                Ok(())
            }),
            [sub, node, context] if sub == "rm" => {
                cli.with_builder(|b| b.remove_image(node, Some(context.as_str()), &[]))
            }
            _ => bail!(usage()),
        },
        _ => bail!(usage()),
    }
}

struct Cli {
    config: Config,
}

impl Cli {
    fn store(&self) -> OverlayStore {
        OverlayStore::from_config(&self.config)
    }

    fn nodes(&self) -> Result<NodesFile> {
        NodesFile::load(&self.config.paths.nodes_file)
    }

    fn builder_with<T>(&self, nodes: &dyn NodeStore, f: impl FnOnce(&Builder<'_>) -> Result<T>) -> Result<T> {
        self.config.ensure_layout()?;
        let builder = Builder::new(&self.config, nodes);
        f(&builder)
    }

    fn with_builder<T>(&self, f: impl FnOnce(&Builder<'_>) -> Result<T>) -> Result<T> {
        let nodes = self.nodes()?;
        self.builder_with(&nodes, f)
    }

    fn build(&self, names: &[String], force: bool, overlays: Option<&str>, output: Option<&str>) -> Result<()> {
        let store = self.nodes()?;
        let nodes = filter_by_name(store.list_nodes()?, names);
        if nodes.is_empty() {
            bail!("no matching nodes to build overlays for");
        }
        let overlays: Vec<String> = overlays
            .map(|list| {
                list.split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        self.builder_with(&store, |builder| {
            if let Some(dir) = output {
                let [node] = nodes.as_slice() else {
                    bail!("--output needs exactly one node");
                };
                let overlays = if overlays.is_empty() {
                    node.system_overlay.clone()
                } else {
                    overlays.clone()
                };
                let written = builder.build_overlay_in_dir(node, &overlays, Path::new(dir))?;
                println!("Rendered {} file(s) for {} into {}", written, node.id, dir);
                return Ok(());
            }

            let report = if overlays.is_empty() {
                builder.build_all_overlays(&nodes, force)?
            } else {
                builder.build_specific_overlays(&nodes, &overlays, force)?
            };
            for outcome in &report.outcomes {
                if let Ok(status) = &outcome.result {
                    let verb = match status {
                        BuildStatus::Built(_) => "built",
                        BuildStatus::Skipped(_) => "up to date",
                    };
                    println!(
                        "{:<24} {:<12} {}",
                        outcome.target.to_string(),
                        verb,
                        status.archive().display()
                    );
                }
            }
            Ok(())
        })
    }

    /// Rebuild archives of every node using `overlay`, unless `noupdate`.
    fn rebuild_users(&self, overlay: &str, noupdate: bool) -> Result<()> {
        if noupdate {
            return Ok(());
        }
        let store = match self.nodes() {
            Ok(store) => store,
            Err(err) => {
                warn!(error = %format!("{:#}", err), "not rebuilding overlays");
                return Ok(());
            }
        };
        let users: Vec<NodeInfo> = store
            .list_nodes()?
            .into_iter()
            .filter(|node| node.uses_overlay(overlay))
            .collect();
        if users.is_empty() {
            return Ok(());
        }
        info!(overlay, nodes = users.len(), "rebuilding overlays for affected nodes");
        self.builder_with(&store, |builder| builder.build_all_overlays(&users, false).map(|_| ()))
    }

    fn list(&self, all: bool) -> Result<()> {
        let store = self.store();
        println!("{:<24} {:>6}  {}", "OVERLAY NAME", "FILES", "TIER");
        for info in store.list_overlays()? {
            let tier = match (info.site, info.distribution) {
                (true, true) => "site (shadows distribution)",
                (true, false) => "site",
                _ => "distribution",
            };
            println!("{:<24} {:>6}  {}", info.name, info.files, tier);
            if all {
                for member in store.list_members(&info.name)? {
                    let suffix = if member.is_dir { "/" } else { "" };
                    println!(
                        "    {:04o} {:>5} {:>5}  {}{}",
                        member.mode, member.uid, member.gid, member.path.display(), suffix
                    );
                }
            }
        }
        Ok(())
    }

    fn show(&self, name: &str, file: &str, render: Option<&str>) -> Result<()> {
        let Some(node) = render else {
            print!("{}", self.store().read_member(name, file)?);
            return Ok(());
        };
        let output = self.with_builder(|b| b.render_member(name, file, node))?;
        if output.aborted() {
            println!("# template aborted, no files written");
        }
        let many = output.files.len() > 1;
        for emitted in &output.files {
            if many {
                println!("# file: {}", emitted.path.display());
            }
            match &emitted.kind {
                EmittedKind::Content(text) => print!("{}", text),
                EmittedKind::Symlink(target) => println!("# symlink -> {}", target),
            }
        }
        if !output.backup {
            println!("# no backup");
        }
        Ok(())
    }
}

fn lookup_uid(user: &str) -> Result<u32> {
    if let Ok(uid) = user.parse() {
        return Ok(uid);
    }
    match User::from_name(user).with_context(|| format!("looking up user '{}'", user))? {
        Some(found) => Ok(found.uid.as_raw()),
        None => bail!("no such user: {}", user),
    }
}

fn lookup_gid(group: &str) -> Result<u32> {
    if let Ok(gid) = group.parse() {
        return Ok(gid);
    }
    match Group::from_name(group).with_context(|| format!("looking up group '{}'", group))? {
        Some(found) => Ok(found.gid.as_raw()),
        None => bail!("no such group: {}", group),
    }
}

/// Open `path` in `$EDITOR` (default `vi`).
fn run_editor(path: &Path) -> Result<()> {
    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let mut words = editor.split_whitespace();
    let program = words.next().unwrap_or("vi");
    let resolved = which::which(program)
        .with_context(|| format!("editor '{}' not found in PATH", program))?;
    let status = Command::new(&resolved)
        .args(words)
        .arg(path)
        .status()
        .with_context(|| format!("running {}", resolved.display()))?;
    if !status.success() {
        bail!("editor exited with {}", status);
    }
    Ok(())
}
