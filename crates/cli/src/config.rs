//! Flags, env-var fallbacks, and defaults for the adapter binary.
//!
//! Grounded on `examples/containers-containrs/src/kubernetes/server/config.rs`
//! (`Clap`-derived `Config`, paired with `derive_builder` and `getset`, one
//! `#[clap(...)]` per field with a `long`, an `env(...)`, and a default) --
//! kept at the same granularity rather than the flatter `src/config.rs`,
//! since this adapter has the same "every field is independently
//! operator-tunable" shape the CRI server does. The on-disk INI loader the
//! original has (`examples/original_source/deimos/config.py`,
//! `ConfigParser`-based) is out of scope per SPEC_FULL.md §1/§11: this
//! `Config` is populated from flags and environment variables only.

use std::path::PathBuf;

use clap::Clap;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

#[derive(Builder, Clap, CopyGetters, Getters, Serialize, Debug, Clone)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[get_copy = "pub"]
    #[clap(
        default_value("info"),
        env("CONTAINERIZER_LOG_LEVEL"),
        long("log-level"),
        possible_values(&["trace", "debug", "info", "warn", "error", "off"]),
        short('l'),
        value_name("LEVEL")
    )]
    /// The logging level of the adapter.
    log_level: log::LevelFilter,

    #[get_copy = "pub"]
    #[clap(
        default_value("lib"),
        env("CONTAINERIZER_LOG_SCOPE"),
        long("log-scope"),
        possible_values(&[LogScope::Lib.as_ref(), LogScope::Global.as_ref()]),
        value_name("SCOPE")
    )]
    /// If `global`, every dependent crate logs at `log_level` too; if `lib`,
    /// logging is scoped to this adapter's own crates.
    log_scope: LogScope,

    #[get = "pub"]
    #[clap(
        default_value("/tmp/mesos-docker"),
        env("MESOS_DOCKER_STATE_ROOT"),
        long("state-root"),
        value_name("PATH")
    )]
    /// Root of the on-disk state directory (SPEC_FULL.md §3).
    state_root: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value("docker"),
        env("MESOS_DOCKER_RUNTIME_BINARY"),
        long("runtime-binary"),
        value_name("PATH")
    )]
    /// The runtime CLI binary to invoke (SPEC_FULL.md §4.3).
    runtime_binary: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value("/tmp/mesos-sandbox"),
        env("MESOS_DIRECTORY"),
        long("workdir"),
        value_name("PATH")
    )]
    /// In-container path the sandbox is bind-mounted at.
    workdir: PathBuf,

    #[get = "pub"]
    #[clap(default_value("fs"), env("MESOS_DOCKER_SHARED_DIR"), long("shared-dir"), value_name("NAME"))]
    /// Name of the state-directory symlink pointing at the sandbox.
    shared_dir: String,

    #[get_copy = "pub"]
    #[clap(default_value("true"), env("MESOS_DOCKER_OPTIMISTIC_UNPACK"), long("optimistic-unpack"), value_name("BOOL"))]
    /// Keep launching even when a task URI fails to fetch, rather than
    /// aborting the launch.
    optimistic_unpack: bool,

    #[get = "pub"]
    #[clap(env("MESOS_DEFAULT_CONTAINER_IMAGE"), long("image-default"), value_name("URL"))]
    /// A `docker:///...` URL used whenever a launch names no image.
    image_default: Option<String>,

    #[get = "pub"]
    #[clap(env("MESOS_DOCKER_IMAGE_ACCOUNT"), long("image-account"), value_name("ACCOUNT"))]
    /// `account` prefix for the host-derived default image.
    image_account: Option<String>,

    #[get = "pub"]
    #[clap(env("MESOS_DOCKER_IMAGE_ACCOUNT_LIBMESOS"), long("image-account-libmesos"), value_name("ACCOUNT"))]
    /// `account` prefix override used when the adapter itself needs the
    /// image (no framework executor present).
    image_account_libmesos: Option<String>,

    #[get = "pub"]
    #[clap(env("MESOS_DOCKER_IMAGE_INDEX"), long("image-index"), value_name("REGISTRY"))]
    /// `index` prefix for the host-derived default image.
    image_index: Option<String>,

    #[get = "pub"]
    #[clap(env("MESOS_DOCKER_DOCKERCFG"), long("dockercfg"), value_name("PATH"))]
    /// Path to a `.dockercfg` staged into the sandbox before `run`.
    dockercfg: Option<PathBuf>,

    #[get = "pub"]
    #[clap(env("MESOS_DOCKER_HOOK_ONLAUNCH"), long("hook-onlaunch"), value_name("COMMAND"))]
    /// Command (with arguments, whitespace-separated) fired as a detached
    /// child once a container has launched.
    hook_onlaunch: Option<String>,

    #[get = "pub"]
    #[clap(env("MESOS_DOCKER_HOOK_ONDESTROY"), long("hook-ondestroy"), value_name("COMMAND"))]
    /// Command (with arguments, whitespace-separated) fired as a detached
    /// child once a container's exit has been recorded.
    hook_ondestroy: Option<String>,

    #[get = "pub"]
    #[clap(
        default_value("/usr/libexec/mesos"),
        env("MESOS_LIBEXEC_DIRECTORY"),
        long("libexec-directory"),
        value_name("PATH")
    )]
    /// Directory containing `mesos-executor`, spawned as the observer.
    libexec_directory: PathBuf,
}

impl Config {
    /// Split a `hook_onlaunch`/`hook_ondestroy` command string on whitespace
    /// into an argv, the same shape the original INI loader produced from
    /// a single config value.
    pub fn hook_argv(command: Option<&str>) -> Vec<String> {
        command.map(|c| c.split_whitespace().map(str::to_owned).collect()).unwrap_or_default()
    }
}

#[derive(AsRefStr, Clone, Copy, Debug, Deserialize, EnumString, PartialEq, Serialize)]
#[strum(serialize_all = "snake_case")]
pub enum LogScope {
    /// Logging is scoped to this adapter's own crates.
    Lib,
    /// Every dependent crate logs at the configured level too.
    Global,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_argv_splits_on_whitespace() {
        assert_eq!(Config::hook_argv(Some("/bin/notify --once")), vec!["/bin/notify", "--once"]);
        assert_eq!(Config::hook_argv(None), Vec::<String>::new());
    }

    #[test]
    fn builder_fills_in_defaults() -> Result<(), ConfigBuilderError> {
        let config = ConfigBuilder::default().build()?;
        assert_eq!(config.shared_dir, "fs");
        assert!(config.optimistic_unpack);
        Ok(())
    }
}
