//! The binary entry point: selects the verb, binds stdin/stdout, and maps
//! the result onto the exit-code table in SPEC_FULL.md §7/§12.
//!
//! The node-agent wire verbs (`launch`, `wait`, `usage`, `destroy`,
//! `update`, `containers`, `recover`, `observe`) each get their own thin
//! `clap`-derived args struct flattening the global [`Config`] alongside
//! whatever the verb itself takes (SPEC_FULL.md §6). `locks` and `config`
//! are operator diagnostics, not part of the agent's wire protocol, and
//! never touch RecordIO.

mod config;

use std::{
    env,
    io::{self, Read, Write},
    iter, process,
};

use clap::{AppSettings, Clap};
use cleanup::Cleanup;
use common::{error::chain, Timestamp};
use containerizer::{ContainerSettings, Containerizer, Hooks, IndexSettings};
use log::error;
use runtime::RuntimeDriverBuilder;
use uristage::Stager;

use config::{Config, LogScope};

const BIN_NAME: &str = "mesos-docker-containerizer";

/// Crates whose own `log` output is shown when `log-scope` is `lib`
/// (SPEC_FULL.md §10).
const OWN_CRATES: [&str; 12] = [
    "common",
    "filelock",
    "state",
    "runtime",
    "cgroup",
    "launchspec",
    "uristage",
    "recordio",
    "signal",
    "cleanup",
    "containerizer",
    "cli",
];

#[derive(Clap, Debug)]
#[clap(name = "launch", global_setting(AppSettings::ColoredHelp))]
struct LaunchArgs {
    #[clap(flatten)]
    config: Config,

    /// Run the whole verb in this process instead of forking to a
    /// background supervisor. Mainly useful for debugging under a
    /// foreground supervisor (SPEC_FULL.md §4.7.1 step 12).
    #[clap(long)]
    no_fork: bool,
}

#[derive(Clap, Debug)]
#[clap(name = "verb", global_setting(AppSettings::ColoredHelp))]
struct PlainArgs {
    #[clap(flatten)]
    config: Config,
}

#[derive(Clap, Debug)]
#[clap(name = "observe", global_setting(AppSettings::ColoredHelp))]
struct ObserveArgs {
    #[clap(flatten)]
    config: Config,

    #[clap(value_name("CONTAINER_ID"))]
    container_id: String,
}

#[derive(Clap, Debug)]
#[clap(name = "locks", global_setting(AppSettings::ColoredHelp))]
struct LocksArgs {
    #[clap(flatten)]
    config: Config,

    /// Restrict the dump to one container; every known container otherwise.
    #[clap(value_name("CONTAINER_ID"))]
    container_id: Option<String>,
}

#[derive(Clap, Debug)]
#[clap(name = "state", global_setting(AppSettings::ColoredHelp))]
struct StateArgs {
    #[clap(flatten)]
    config: Config,

    /// Remove matching state directories instead of only listing them.
    #[clap(long)]
    rm: bool,

    /// ISO-8601 cutoff; entries older than this are candidates. Defaults to
    /// now.
    #[clap(value_name("CUTOFF"))]
    cutoff: Option<String>,
}

fn main() {
    let mut argv = env::args();
    let prog = argv.next().unwrap_or_else(|| BIN_NAME.to_string());
    let verb = argv.next();
    let rest: Vec<String> = argv.collect();

    let code = match verb.as_deref() {
        Some("launch") => dispatch::<LaunchArgs, _>(&prog, rest, run_launch),
        Some("wait") => dispatch::<PlainArgs, _>(&prog, rest, run_wait),
        Some("usage") => dispatch::<PlainArgs, _>(&prog, rest, run_usage),
        Some("destroy") => dispatch::<PlainArgs, _>(&prog, rest, run_destroy),
        Some("update") => dispatch::<PlainArgs, _>(&prog, rest, run_update),
        Some("containers") => dispatch::<PlainArgs, _>(&prog, rest, run_containers),
        Some("recover") => dispatch::<PlainArgs, _>(&prog, rest, run_recover),
        Some("observe") => dispatch::<ObserveArgs, _>(&prog, rest, run_observe),
        Some("locks") => dispatch::<LocksArgs, _>(&prog, rest, run_locks),
        Some("state") => dispatch::<StateArgs, _>(&prog, rest, run_state),
        Some("config") => dispatch::<PlainArgs, _>(&prog, rest, run_config),
        Some("-h") | Some("--help") => {
            print_usage();
            0
        }
        Some(other) => {
            eprintln!("unrecognized subcommand: {}\n", other);
            print_usage();
            1
        }
        None => {
            print_usage();
            1
        }
    };
    process::exit(code);
}

fn print_usage() {
    eprintln!(
        "usage: {} <launch|wait|usage|destroy|update|containers|recover|observe|locks|state|config> [args]",
        BIN_NAME
    );
}

/// Parse `Args` from `prog` + `rest`, initialize logging from its embedded
/// [`Config`], and hand off to `run`. `clap` itself handles `--help`/bad-flag
/// exits for the verb's own args.
fn dispatch<Args, F>(prog: &str, rest: Vec<String>, run: F) -> i32
where
    Args: Clap,
    F: FnOnce(Args) -> i32,
{
    let args = Args::parse_from(iter::once(prog.to_string()).chain(rest));
    run(args)
}

fn init_logging(config: &Config) {
    let level = config.log_level();
    let rust_log = match config.log_scope() {
        LogScope::Global => level.to_string(),
        LogScope::Lib => OWN_CRATES.iter().map(|c| format!("{}={}", c, level)).collect::<Vec<_>>().join(","),
    };
    env::set_var("RUST_LOG", rust_log);
    let _ = env_logger::try_init();
}

fn build_containerizer(config: &Config) -> Containerizer {
    let driver = RuntimeDriverBuilder::default()
        .binary(config.runtime_binary().clone())
        .build()
        .expect("RuntimeDriver has no required fields left unset");
    let stager = Stager::new(config.optimistic_unpack());

    Containerizer::new(config.state_root().clone(), driver, stager, config.libexec_directory().clone())
        .with_workdir(config.workdir().clone())
        .with_shared_dir_name(config.shared_dir().clone())
        .with_hooks(Hooks {
            onlaunch: Config::hook_argv(config.hook_onlaunch().as_deref()),
            ondestroy: Config::hook_argv(config.hook_ondestroy().as_deref()),
        })
        .with_container_settings(ContainerSettings {
            image_default: config.image_default().clone(),
            dockercfg: config.dockercfg().clone(),
        })
        .with_index_settings(IndexSettings {
            index: config.image_index().clone(),
            account: config.image_account().clone(),
            account_libmesos: config.image_account_libmesos().clone(),
        })
}

/// Log the error's full source chain and classify it per SPEC_FULL.md
/// §7/§12.
fn report(err: &containerizer::Error) -> i32 {
    error!("{}", chain(err));
    err.exit_code()
}

fn run_launch(args: LaunchArgs) -> i32 {
    init_logging(&args.config);
    let mut cz = build_containerizer(&args.config);
    let stdin = io::stdin();
    let stdout = io::stdout();
    match cz.launch(&mut stdin.lock(), &mut stdout.lock(), args.no_fork) {
        Ok(()) => 0,
        Err(e) => report(&e),
    }
}

fn run_wait(args: PlainArgs) -> i32 {
    init_logging(&args.config);
    let mut cz = build_containerizer(&args.config);
    let stdin = io::stdin();
    let stdout = io::stdout();
    match cz.wait(&mut stdin.lock(), &mut stdout.lock()) {
        Ok(()) => 0,
        Err(e) => report(&e),
    }
}

fn run_usage(args: PlainArgs) -> i32 {
    init_logging(&args.config);
    let mut cz = build_containerizer(&args.config);
    let stdin = io::stdin();
    let stdout = io::stdout();
    match cz.usage(&mut stdin.lock(), &mut stdout.lock()) {
        Ok(()) => 0,
        Err(e) => report(&e),
    }
}

fn run_destroy(args: PlainArgs) -> i32 {
    init_logging(&args.config);
    let mut cz = build_containerizer(&args.config);
    let stdin = io::stdin();
    match cz.destroy(&mut stdin.lock()) {
        Ok(()) => 0,
        Err(e) => report(&e),
    }
}

fn run_update(args: PlainArgs) -> i32 {
    init_logging(&args.config);
    let mut cz = build_containerizer(&args.config);
    let stdin = io::stdin();
    match cz.update(&mut stdin.lock()) {
        Ok(()) => 0,
        Err(e) => report(&e),
    }
}

fn run_containers(args: PlainArgs) -> i32 {
    init_logging(&args.config);
    let mut cz = build_containerizer(&args.config);
    let stdout = io::stdout();
    match cz.containers(&mut stdout.lock()) {
        Ok(true) => 0,
        // Empty-containers-list sentinel (SPEC_FULL.md §6/§12): the record
        // is still written, but the exit code tells the agent there was
        // nothing to report.
        Ok(false) => 1,
        Err(e) => report(&e),
    }
}

fn run_recover(args: PlainArgs) -> i32 {
    init_logging(&args.config);
    let cz = build_containerizer(&args.config);
    match cz.recover() {
        Ok(()) => 0,
        Err(e) => report(&e),
    }
}

fn run_observe(args: ObserveArgs) -> i32 {
    init_logging(&args.config);
    let mut cz = build_containerizer(&args.config);
    match cz.observe(&args.container_id) {
        // The observer's own exit status *is* the task's reported exit
        // code (SPEC_FULL.md §4.7.5) -- it is not run through
        // `Error::exit_code`'s classification table.
        Ok(code) => code,
        Err(e) => report(&e),
    }
}

/// `locks` (SPEC_FULL.md §11's "lock_browser"-style diagnostic): for each
/// named lock under a container (or every container known to the state
/// root), report whether it is free, held shared, or held exclusive,
/// without disturbing whichever process actually holds it.
fn run_locks(args: LocksArgs) -> i32 {
    init_logging(&args.config);
    let root = args.config.state_root().clone();

    let ids: Vec<String> = match &args.container_id {
        Some(id) => vec![id.clone()],
        None => match list_container_ids(&root) {
            Ok(ids) => ids,
            Err(e) => {
                error!("{}", chain(&e));
                return 4;
            }
        },
    };

    for id in ids {
        println!("{}:", id);
        for name in ["launch", "wait", "observe", "destroy"] {
            let path = root.join("mesos").join(&id).join("lock").join(name);
            println!("  {:<8} {}", name, describe_lock(&path));
        }
    }
    0
}

fn describe_lock(path: &std::path::Path) -> &'static str {
    use filelock::{FileLock, LockError, LockMode, Timeout};

    let lock = match FileLock::open_detached(path) {
        Ok(lock) => lock,
        Err(_) => return "unreadable",
    };
    match lock.lock(LockMode::Exclusive, Timeout::NonBlocking) {
        Ok(_guard) => "free",
        Err(LockError::Locked(_)) => match lock.lock(LockMode::Shared, Timeout::NonBlocking) {
            Ok(_guard) => "held (shared)",
            Err(_) => "held (exclusive)",
        },
        Err(_) => "unreadable",
    }
}

fn list_container_ids(root: &std::path::Path) -> io::Result<Vec<String>> {
    let mesos_dir = root.join("mesos");
    if !mesos_dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids: Vec<String> = std::fs::read_dir(&mesos_dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    ids.sort();
    Ok(ids)
}

/// `state [--rm] [<cutoff>]` (SPEC_FULL.md §4.9/§6): lists, or removes, the
/// state directories whose `start-time/` entry sorts before `cutoff`.
/// Without `--rm` this is a preview: it never touches the filesystem.
fn run_state(args: StateArgs) -> i32 {
    init_logging(&args.config);
    let cutoff = match args.cutoff.as_deref().map(str::parse::<Timestamp>) {
        Some(Ok(ts)) => ts,
        Some(Err(e)) => {
            error!("invalid cutoff: {}", e);
            return 4;
        }
        None => Timestamp::now(),
    };

    let cleanup = Cleanup::new(args.config.state_root().clone());
    if args.rm {
        match cleanup.remove(cutoff, Some(true)) {
            Ok(0) => 0,
            Ok(failures) => {
                error!("{} state director{} failed to remove", failures, if failures == 1 { "y" } else { "ies" });
                4
            }
            Err(e) => {
                error!("{}", chain(&e));
                4
            }
        }
    } else {
        match cleanup.dirs(cutoff, Some(true)) {
            Ok(dirs) => {
                for dir in dirs {
                    println!("{}", dir.display());
                }
                0
            }
            Err(e) => {
                error!("{}", chain(&e));
                4
            }
        }
    }
}

/// `config`: dumps the resolved configuration as JSON for operator
/// debugging (SPEC_FULL.md §11), the way `crates/services`' CLI exposes its
/// own diagnostics.
fn run_config(args: PlainArgs) -> i32 {
    init_logging(&args.config);
    match serde_json::to_string_pretty(&args.config) {
        Ok(json) => {
            println!("{}", json);
            0
        }
        Err(e) => {
            error!("failed to serialize config: {}", e);
            16
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_lock_reports_free_then_exclusive() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("launch");
        assert_eq!(describe_lock(&path), "free");

        let held = filelock::FileLock::open_detached(&path)?.lock_owned(filelock::LockMode::Exclusive, filelock::Timeout::NonBlocking)?;
        assert_eq!(describe_lock(&path), "held (exclusive)");
        drop(held);
        assert_eq!(describe_lock(&path), "free");
        Ok(())
    }

    #[test]
    fn describe_lock_distinguishes_shared_holders() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("wait");
        let held = filelock::FileLock::open_detached(&path)?.lock_owned(filelock::LockMode::Shared, filelock::Timeout::NonBlocking)?;
        assert_eq!(describe_lock(&path), "held (shared)");
        drop(held);
        Ok(())
    }

    #[test]
    fn list_container_ids_is_empty_for_a_fresh_root() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        assert!(list_container_ids(dir.path())?.is_empty());
        Ok(())
    }
}
