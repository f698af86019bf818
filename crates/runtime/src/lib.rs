//! Builds and invokes the runtime's (Docker-compatible) CLI.
//!
//! The launch state machine runs as a raw `fork(2)`'d supervisor (see
//! SPEC_FULL.md §5), which is unsound to do from inside a multithreaded
//! async runtime -- so unlike this crate's model in
//! `examples/containers-containrs/src/oci/conmon.rs`, every call here is
//! synchronous, over `std::process::Command` rather than
//! `tokio::process::Command`.
//!
//! Semantics grounded on `examples/original_source/deimos/docker.py`.

mod error;

pub use error::Error;

use std::{
    collections::HashMap,
    fmt::Debug,
    path::{Path, PathBuf},
    process::{Command, Output},
    sync::Mutex,
    thread,
    time::Duration,
};

use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use getset::{Getters, Setters};
use log::warn;
use serde_json::Value;

pub trait ExecCommand: Debug + DynClone + Send + Sync {
    fn run(&self, binary: &Path, args: &[String]) -> std::io::Result<Output> {
        Command::new(binary).args(args).output()
    }
}

clone_trait_object!(ExecCommand);

#[derive(Clone, Debug, Default)]
struct DefaultExecCommand;

impl ExecCommand for DefaultExecCommand {}

/// The result of `docker inspect`, as much of it as this adapter cares
/// about: the container's own (runtime) id, its top-level pid, and its
/// exit code once it has one.
#[derive(Debug, Clone)]
pub struct Inspected {
    pub runtime_id: String,
    pub pid: i64,
    pub exit: Option<i32>,
}

#[derive(Builder, Debug, Getters, Setters)]
#[builder(pattern = "owned", setter(into))]
pub struct RuntimeDriver {
    #[getset(get, set)]
    #[builder(private, default = "Box::new(DefaultExecCommand)")]
    exec: Box<dyn ExecCommand>,

    #[get = "pub"]
    #[builder(default = "PathBuf::from(\"docker\")")]
    binary: PathBuf,

    #[get = "pub"]
    #[builder(default)]
    global_options: Vec<String>,

    #[builder(private, default = "Mutex::new(HashMap::new())")]
    image_cache: Mutex<HashMap<String, Value>>,
}

impl Default for RuntimeDriver {
    fn default() -> Self {
        Self {
            exec: Box::new(DefaultExecCommand),
            binary: PathBuf::from("docker"),
            global_options: Vec::new(),
            image_cache: Mutex::new(HashMap::new()),
        }
    }
}

impl RuntimeDriver {
    fn build_argv(&self, parts: Vec<String>) -> Vec<String> {
        let mut argv = self.global_options.clone();
        argv.extend(parts);
        argv
    }

    fn exec_capture(&self, parts: Vec<String>) -> Result<Output, Error> {
        let argv = self.build_argv(parts);
        let output = self.exec().run(self.binary(), &argv).map_err(Error::Spawn)?;
        if !output.status.success() {
            return Err(Error::CliFailure {
                argv,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output)
    }

    /// Build (but don't run) the argv for `docker run`, pairing allocated
    /// ports against the image's own exposed ports positionally. If fewer
    /// ports were allocated than the image exposes, the surplus inner ports
    /// are dropped with a warning; if more were allocated than the image
    /// exposes, the extras are bound to themselves.
    pub fn run_argv(
        &self,
        options: &[String],
        image: &str,
        command: &[String],
        env: &[(String, String)],
        cpu_shares: Option<i64>,
        mem: Option<&str>,
        ports: &[u32],
    ) -> Result<Vec<String>, Error> {
        let mut run_opts = options.to_vec();
        if !ports.is_empty() {
            let inner = self.inner_ports(image)?;
            let max_len = ports.len().max(inner.len());
            for i in 0..max_len {
                match ports.get(i) {
                    None => {
                        warn!("image {} exposes more ports than were allocated, dropping the rest", image);
                        break;
                    }
                    Some(allocated) => {
                        let target = inner.get(i).copied().unwrap_or(*allocated);
                        run_opts.push("-p".into());
                        run_opts.push(format!("{}:{}", allocated, target));
                    }
                }
            }
        }

        let mut argv = vec!["run".to_string()];
        argv.extend(run_opts);
        if let Some(shares) = cpu_shares {
            argv.push("-c".into());
            argv.push(shares.to_string());
        }
        if let Some(mem) = mem {
            argv.push("-m".into());
            argv.push(mem.to_string());
        }
        for (k, v) in env {
            argv.push("-e".into());
            argv.push(format!("{}={}", k, v));
        }
        argv.push(image.to_string());
        argv.extend(command.iter().cloned());
        Ok(self.build_argv(argv))
    }

    pub fn stop(&self, id: &str) -> Result<(), Error> {
        self.exec_capture(vec!["stop".into(), "-t=2".into(), id.into()])?;
        Ok(())
    }

    pub fn rm(&self, id: &str) -> Result<(), Error> {
        self.exec_capture(vec!["rm".into(), id.into()])?;
        Ok(())
    }

    /// Block on `docker wait` and return the normalized (0..=255) exit code.
    pub fn wait(&self, id: &str) -> Result<u8, Error> {
        let output = self.exec_capture(vec!["wait".into(), id.into()])?;
        Ok(read_wait_code(&String::from_utf8_lossy(&output.stdout)))
    }

    pub fn inspect(&self, id: &str) -> Result<Inspected, Error> {
        let format = "--format={{.ID}} {{.State.Pid}} {{.State.ExitCode}}".to_string();
        let output = self.exec_capture(vec!["inspect".into(), format, id.into()])?;
        parse_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    pub fn ps_quiet(&self) -> Result<Vec<String>, Error> {
        let output = self.exec_capture(vec!["ps".into(), "--no-trunc".into(), "-q".into()])?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub fn pull(&self, image: &str) -> Result<(), Error> {
        self.exec_capture(vec!["pull".into(), image.into()])?;
        Ok(())
    }

    /// `docker inspect` on an image, pulling it first on a cache miss,
    /// cached by image reference for the lifetime of this driver.
    pub fn image_info(&self, image: &str) -> Result<Value, Error> {
        if let Some(cached) = self.image_cache.lock().expect("image cache poisoned").get(image) {
            return Ok(cached.clone());
        }
        if self.exec_capture(vec!["inspect".into(), image.into()]).is_err() {
            self.pull(image)?;
        }
        let output = self.exec_capture(vec!["inspect".into(), image.into()])?;
        let parsed: Value = serde_json::from_slice(&output.stdout)?;
        let info = parsed.get(0).cloned().unwrap_or(Value::Null);
        self.image_cache
            .lock()
            .expect("image cache poisoned")
            .insert(image.to_string(), info.clone());
        Ok(info)
    }

    /// The image's own exposed ports, sorted and deduplicated. Handles both
    /// the map-shaped `Config.ExposedPorts` (`{"80/tcp": {}}`) and the
    /// older list-shaped `Config.PortSpecs` (`["ip:hostPort:80"]`).
    pub fn inner_ports(&self, image: &str) -> Result<Vec<u32>, Error> {
        let info = self.image_info(image)?;
        let mut ports = Vec::new();
        if let Some(exposed) = info.pointer("/Config/ExposedPorts").and_then(Value::as_object) {
            for key in exposed.keys() {
                if let Some(port) = key.split('/').next().and_then(|p| p.parse().ok()) {
                    ports.push(port);
                }
            }
        } else if let Some(specs) = info.pointer("/Config/PortSpecs").and_then(Value::as_array) {
            for spec in specs {
                if let Some(port) = spec.as_str().and_then(|s| s.rsplit(':').next()).and_then(|p| p.parse().ok()) {
                    ports.push(port);
                }
            }
        }
        ports.sort_unstable();
        ports.dedup();
        Ok(ports)
    }

    /// Poll `inspect` every `step` up to `retries` times before giving up.
    pub fn await_exists(&self, id: &str, step: Duration, retries: u32) -> Result<Inspected, Error> {
        for _ in 0..retries {
            if let Ok(inspected) = self.inspect(id) {
                return Ok(inspected);
            }
            thread::sleep(step);
        }
        self.inspect(id).map_err(|_| Error::AwaitTimeout)
    }

    #[doc(hidden)]
    pub fn seed_image_cache_for_test(&self, image: impl Into<String>, info: Value) {
        self.image_cache.lock().expect("image cache poisoned").insert(image.into(), info);
    }
}

fn parse_inspect(text: &str) -> Result<Inspected, Error> {
    let text = text.trim();
    let bad = || Error::MalformedInspect(text.to_string());
    let mut parts = text.split_whitespace();
    let runtime_id = parts.next().ok_or_else(bad)?.to_string();
    let pid: i64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let exit_code: i32 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    // Docker reports a pid of 0 once the container has stopped; the exit
    // code field is only meaningful at that point.
    let exit = if pid == 0 { Some(exit_code) } else { None };
    Ok(Inspected { runtime_id, pid, exit })
}

/// Normalize `docker wait`'s raw exit text into a byte-sized POSIX-style
/// code: negative (signal-terminated) codes become `128 + |code|`, modulo
/// 256; unparsable output maps to 111 rather than aborting the wait verb.
pub fn read_wait_code(text: &str) -> u8 {
    match text.trim().parse::<i64>() {
        Ok(code) => {
            let normalized = if code < 0 { 128 + code.abs() } else { code };
            normalized.rem_euclid(256) as u8
        }
        Err(_) => 111,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;
    use std::process::ExitStatus;

    #[test]
    fn read_wait_code_normalizes_negative_codes() {
        assert_eq!(read_wait_code("0"), 0);
        assert_eq!(read_wait_code("137"), 137);
        assert_eq!(read_wait_code("-9"), 137);
        assert_eq!(read_wait_code("-1"), 129);
    }

    #[test]
    fn read_wait_code_falls_back_on_garbage() {
        assert_eq!(read_wait_code("not-a-number"), 111);
        assert_eq!(read_wait_code(""), 111);
    }

    #[test]
    fn parse_inspect_reports_exit_only_once_stopped() -> Result<()> {
        let running = parse_inspect("abc123 4567 0")?;
        assert_eq!(running.exit, None);

        let stopped = parse_inspect("abc123 0 137")?;
        assert_eq!(stopped.exit, Some(137));
        Ok(())
    }

    #[test]
    fn parse_inspect_rejects_short_output() {
        assert!(parse_inspect("only-one-field").is_err());
    }

    #[test]
    fn run_argv_pairs_ports_positionally_and_drops_surplus() -> Result<()> {
        let driver = RuntimeDriver::default();
        driver.seed_image_cache_for_test(
            "alpine",
            json!({"Config": {"ExposedPorts": {"80/tcp": {}, "443/tcp": {}}}}),
        );
        let argv = driver.run_argv(&[], "alpine", &[], &[], None, None, &[32000])?;
        assert!(argv.windows(2).any(|w| w == ["-p", "32000:80"]));
        assert!(!argv.iter().any(|a| a.contains("443")));
        Ok(())
    }

    #[test]
    fn run_argv_binds_surplus_allocated_ports_to_themselves() -> Result<()> {
        let driver = RuntimeDriver::default();
        driver.seed_image_cache_for_test("alpine", json!({"Config": {"ExposedPorts": {"80/tcp": {}}}}));
        let argv = driver.run_argv(&[], "alpine", &[], &[], None, None, &[32000, 32001])?;
        assert!(argv.windows(2).any(|w| w == ["-p", "32000:80"]));
        assert!(argv.windows(2).any(|w| w == ["-p", "32001:32001"]));
        Ok(())
    }

    #[test]
    fn run_argv_places_cpu_mem_and_env() -> Result<()> {
        let driver = RuntimeDriver::default();
        let argv = driver.run_argv(
            &["--rm".to_string()],
            "alpine",
            &["sleep".to_string(), "5".to_string()],
            &[("FOO".to_string(), "bar".to_string())],
            Some(512),
            Some("256m"),
            &[],
        )?;
        assert_eq!(
            argv,
            vec!["run", "--rm", "-c", "512", "-m", "256m", "-e", "FOO=bar", "alpine", "sleep", "5"]
        );
        Ok(())
    }

    #[derive(Clone, Debug)]
    struct ScriptedExec {
        binary_for: &'static str,
    }

    impl ExecCommand for ScriptedExec {
        fn run(&self, _binary: &Path, _args: &[String]) -> std::io::Result<Output> {
            let status = Command::new(which::which(self.binary_for).unwrap()).status()?;
            Ok(Output {
                status,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    #[test]
    fn stop_propagates_cli_failure() {
        let mut driver = RuntimeDriverBuilder::default().build().unwrap();
        driver.set_exec(Box::new(ScriptedExec { binary_for: "false" }));
        let err = driver.stop("ct-1").unwrap_err();
        assert!(matches!(err, Error::CliFailure { .. }));
    }

    #[test]
    fn stop_succeeds_when_cli_exits_zero() -> Result<()> {
        let mut driver = RuntimeDriverBuilder::default().build().unwrap();
        driver.set_exec(Box::new(ScriptedExec { binary_for: "true" }));
        driver.stop("ct-1")?;
        Ok(())
    }

    fn _silence_unused(_: ExitStatus) {}
}
