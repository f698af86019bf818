//! The verb implementations: `launch`, `wait`, `destroy`, `usage`,
//! `observe`, `containers`, `recover`, `update`. Owns the fork-to-background
//! handoff, the observer coordination, hook invocation, and the lock
//! protocol that lets concurrent invocations against the same container race
//! safely.
//!
//! Every verb here reads its own RecordIO frame from `stdin` and writes its
//! reply to `stdout` directly -- mirroring `deimos.containerizer.Containerizer.
//! __call__` dispatching straight onto methods that do their own
//! `proto.read`/`proto.write`, rather than having a separate dispatcher own
//! the wire protocol. The `cli` crate only selects which method to call and
//! binds stdin/stdout.
//!
//! Grounded on `examples/original_source/deimos/containerizer/docker.py` and
//! `examples/original_source/deimos/containerizer/__init__.py`, which are
//! the authoritative source for this whole crate.

mod config;
mod error;
mod image;
mod reap;

pub use config::{ContainerSettings, Hooks, IndexSettings};
pub use error::Error;

use std::{
    fs::{self, File},
    io::{Read, Write},
    path::PathBuf,
    process::{Command, Stdio},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{info, warn};
use nix::unistd::{fork, ForkResult, Pid};
use recordio::{
    ContainersRecord, DestroyRecord, LaunchRecord, ResourceStatisticsRecord, StatusRecord, TerminationRecord, UpdateRecord, UsageRecord,
    WaitRecord,
};
use runtime::RuntimeDriver;
use state::{LockMode, OwnedLockGuard, State, Timeout};
use uristage::Stager;

/// The subset of the agent's own environment forwarded into the container
/// when no framework executor is present (SPEC_FULL.md §4.7.1 step 7, §6).
const MESOS_ESSENTIAL_ENV: [&str; 6] = [
    "MESOS_SLAVE_ID",
    "MESOS_SLAVE_PID",
    "MESOS_FRAMEWORK_ID",
    "MESOS_EXECUTOR_ID",
    "MESOS_CHECKPOINT",
    "MESOS_RECOVERY_TIMEOUT",
];

pub struct Containerizer {
    state_root: PathBuf,
    runtime: RuntimeDriver,
    stager: Stager,
    /// In-container path the sandbox is bind-mounted at (`docker run -w`).
    workdir: PathBuf,
    /// Name of the state-directory symlink pointing at the sandbox (`fs` by
    /// default; see SPEC_FULL.md §3, §11's `shared_dir`).
    shared_dir_name: String,
    libexec_directory: PathBuf,
    hooks: Hooks,
    container_settings: ContainerSettings,
    index_settings: IndexSettings,
    cid_timeout: Duration,
}

impl Containerizer {
    pub fn new(state_root: impl Into<PathBuf>, runtime: RuntimeDriver, stager: Stager, libexec_directory: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            runtime,
            stager,
            workdir: PathBuf::from("/tmp/mesos-sandbox"),
            shared_dir_name: "fs".to_string(),
            libexec_directory: libexec_directory.into(),
            hooks: Hooks::default(),
            container_settings: ContainerSettings::default(),
            index_settings: IndexSettings::default(),
            cid_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_shared_dir_name(mut self, name: impl Into<String>) -> Self {
        self.shared_dir_name = name.into();
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_container_settings(mut self, settings: ContainerSettings) -> Self {
        self.container_settings = settings;
        self
    }

    pub fn with_index_settings(mut self, settings: IndexSettings) -> Self {
        self.index_settings = settings;
        self
    }

    pub fn with_cid_timeout(mut self, timeout: Duration) -> Self {
        self.cid_timeout = timeout;
        self
    }

    /// SPEC_FULL.md §4.7.1. Reads a `LaunchRecord`, normalizes it, runs the
    /// container, and (unless `no_fork`) forks so the agent-facing process
    /// returns immediately while a child supervises to completion.
    pub fn launch<R: Read, W: Write>(&mut self, stdin: &mut R, stdout: &mut W, no_fork: bool) -> Result<(), Error> {
        signal::install(|signum| {
            warn!("received {} during launch, continuing (supervisor runs until the container exits)", signal::name(signum));
            Some(signal::SignalAction::Resume)
        });

        let record: LaunchRecord = recordio::read(stdin)?;
        let spec = launchspec::normalize(&record)?;

        let mut state = State::open_by_container_id(&self.state_root, spec.container_id().clone());
        state.set_executor_id(spec.executor_id().clone());
        state.push()?;
        let launch_guard = state.lock("launch", LockMode::Exclusive, Timeout::Infinite)?;

        let sandbox: PathBuf = spec.directory().clone().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&sandbox).map_err(|e| Error::io(&sandbox, e))?;
        std::env::set_current_dir(&sandbox).map_err(|e| Error::io(&sandbox, e))?;

        let image = image::determine_image(
            spec.image_url(),
            spec.needs_observer(),
            self.container_settings.image_default.as_deref(),
            &self.index_settings,
        )?;

        self.stager.stage(spec.uris(), &sandbox)?;
        self.stage_dockercfg(&sandbox);

        let symlink_path = state.set_sandbox_symlink_named(&self.shared_dir_name, &sandbox)?;

        let mut env = spec.env().clone();
        if spec.needs_observer() {
            env.extend(self.mesos_env());
            env.push(("MESOS_DIRECTORY".to_string(), self.workdir.to_string_lossy().into_owned()));
        }

        let cid_path = state.dir()?.join("cid");
        let workdir_str = self.workdir.to_string_lossy().into_owned();
        let mut run_options = vec![
            "--sig-proxy".to_string(),
            "--rm".to_string(),
            "--cidfile".to_string(),
            cid_path.to_string_lossy().into_owned(),
        ];
        run_options.extend(spec.image_options().clone());
        if let Some(user) = spec.user() {
            run_options.push("-u".to_string());
            run_options.push(user.clone());
        }
        run_options.push("-w".to_string());
        run_options.push(workdir_str.clone());
        run_options.push("-v".to_string());
        run_options.push(format!("{}:{}", symlink_path.display(), workdir_str));

        let run_argv = self
            .runtime
            .run_argv(&run_options, &image, spec.argv(), &env, spec.cpu_shares(), spec.mem().as_deref(), spec.ports())?;

        let stdout_file = File::create(sandbox.join("stdout")).map_err(|e| Error::io(sandbox.join("stdout"), e))?;
        let stderr_file = File::create(sandbox.join("stderr")).map_err(|e| Error::io(sandbox.join("stderr"), e))?;
        let mut runner = Command::new(self.runtime.binary())
            .args(&run_argv)
            .current_dir(&sandbox)
            .stdin(Stdio::null())
            .stdout(stdout_file)
            .stderr(stderr_file)
            .spawn()
            .map_err(|e| Error::io(self.runtime.binary(), e))?;
        let runner_pid = runner.id();
        state.set_pid(runner_pid)?;

        self.fire_hook(&self.hooks.onlaunch, &env);

        let cid = state.await_cid(self.cid_timeout)?;
        state.push()?;

        let wait_guard = state.lock("wait", LockMode::Exclusive, Timeout::Infinite)?;
        drop(launch_guard);

        recordio::write(
            stdout,
            &StatusRecord {
                ok: true,
                message: format!("launch/docker: {}", spec.container_id()),
            },
        )?;

        if !no_fork {
            match unsafe { fork() }.map_err(Error::Fork)? {
                ForkResult::Parent { .. } => return Ok(()),
                ForkResult::Child => {}
            }
        }

        let mut observer: Option<std::process::Child> = None;
        let mut observe_guard: Option<OwnedLockGuard> = None;
        if spec.needs_observer() {
            observe_guard = Some(state.lock("observe", LockMode::Exclusive, Timeout::NonBlocking)?);
            observer = Some(self.spawn_observer(&spec, &sandbox)?);
        }

        let code = self.runtime.wait(&cid)?;
        state.set_exit(code as i32)?;
        drop(wait_guard);

        reap::reap_with_escalation(Pid::from_raw(runner_pid as i32), "runtime run");
        if let Some(child) = &observer {
            reap::reap_with_escalation(Pid::from_raw(child.id() as i32), "observer");
        }
        drop(observe_guard);

        self.fire_hook(&self.hooks.ondestroy, &env);
        Ok(())
    }

    /// SPEC_FULL.md §4.7.2.
    pub fn wait<R: Read, W: Write>(&mut self, stdin: &mut R, stdout: &mut W) -> Result<(), Error> {
        let record: WaitRecord = recordio::read(stdin)?;
        let mut state = State::open_by_container_id(&self.state_root, record.container_id.clone());
        let _launch_guard = state.await_launch(self.cid_timeout)?;

        let observe_guard = acquire_shared_retrying(&mut state, "observe")?;
        let wait_guard = acquire_shared_retrying(&mut state, "wait")?;
        drop(observe_guard);

        let cid = state.runtime_id()?.ok_or_else(|| Error::UnknownContainer(record.container_id.clone()))?;
        let binary = self.runtime.binary().clone();
        let global_options = self.runtime.global_options().clone();
        signal::install(move |signum| {
            warn!("received {} during wait, stopping container {}", signal::name(signum), cid);
            if let Ok(driver) = runtime::RuntimeDriverBuilder::default().binary(binary.clone()).global_options(global_options.clone()).build() {
                let _ = driver.stop(&cid);
            }
            Some(signal::SignalAction::Resume)
        });

        let termination = match state.exit()? {
            Some(code) => TerminationRecord {
                killed: false,
                status: (code as i32) << 8,
                message: String::new(),
            },
            None => TerminationRecord {
                killed: false,
                status: 64 << 8,
                message: String::new(),
            },
        };
        recordio::write(stdout, &termination)?;
        drop(wait_guard);
        Ok(())
    }

    /// SPEC_FULL.md §4.7.3. Idempotent: a second `destroy` on an already
    /// stopped container is a no-op.
    pub fn destroy<R: Read>(&mut self, stdin: &mut R) -> Result<(), Error> {
        let record: DestroyRecord = recordio::read(stdin)?;
        let mut state = State::open_by_container_id(&self.state_root, record.container_id.clone());
        let _launch_guard = state.await_launch(self.cid_timeout)?;
        let _destroy_guard = state.lock("destroy", LockMode::Exclusive, Timeout::Infinite)?;

        if state.exit()?.is_some() {
            info!("container {} already stopped", record.container_id);
            return Ok(());
        }
        if let Some(cid) = state.runtime_id()? {
            if let Err(e) = self.runtime.stop(&cid) {
                warn!("failed to stop container {}: {}", record.container_id, e);
            }
        }
        Ok(())
    }

    /// SPEC_FULL.md §4.7.4. Writes nothing if the container hasn't started
    /// or has no cgroup left to read (already exited and reaped).
    pub fn usage<R: Read, W: Write>(&mut self, stdin: &mut R, stdout: &mut W) -> Result<(), Error> {
        let record: UsageRecord = recordio::read(stdin)?;
        let mut state = State::open_by_container_id(&self.state_root, record.container_id.clone());
        let _launch_guard = state.await_launch(self.cid_timeout)?;

        let cid = match state.runtime_id()? {
            Some(cid) => cid,
            None => return Ok(()),
        };
        if state.exit()?.is_some() {
            return Ok(());
        }

        let reader = cgroup::CGroupReader::for_container(&cid);
        if reader.is_empty() {
            return Ok(());
        }

        let stats = ResourceStatisticsRecord {
            timestamp: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0),
            mem_limit_bytes: reader.memory_limit_bytes(),
            mem_rss_bytes: reader.memory_rss(),
            cpus_limit: reader.cpu_limit(),
            cpus_user_time_secs: reader.cpu_user_seconds(),
            cpus_system_time_secs: reader.cpu_system_seconds(),
        };
        recordio::write(stdout, &stats)?;
        Ok(())
    }

    /// SPEC_FULL.md §4.7.5. Internal verb; returns the container's stored
    /// exit code (or the "never recorded" sentinel) as the process's own
    /// exit status, since this is what stands in for the framework executor.
    pub fn observe(&mut self, container_id: &str) -> Result<i32, Error> {
        let mut state = State::open_by_container_id(&self.state_root, container_id);
        let _guard = state.lock("wait", LockMode::Shared, Timeout::Infinite)?;
        Ok(state.exit()?.unwrap_or(64))
    }

    /// SPEC_FULL.md §4.7.6. Returns whether any container was reported, so
    /// the `cli` crate can apply the "containers-list-empty" exit sentinel
    /// (SPEC_FULL.md §6/§12) without re-deriving it from the wire record.
    pub fn containers<W: Write>(&mut self, stdout: &mut W) -> Result<bool, Error> {
        let mut running = Vec::new();
        for runtime_id in self.runtime.ps_quiet()? {
            let mut state = State::open_by_runtime_id(&self.state_root, runtime_id.clone());
            if !state.exists() {
                continue;
            }
            match state.lock("wait", LockMode::Shared, Timeout::NonBlocking) {
                Ok(_guard) => {}
                Err(state::Error::Lock(filelock::LockError::Locked(_))) => {
                    if let Ok(id) = state.container_id() {
                        running.push(id.to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        let any = !running.is_empty();
        recordio::write(stdout, &ContainersRecord { containers: running })?;
        Ok(any)
    }

    /// SPEC_FULL.md §4.7.7.
    pub fn recover(&self) -> Result<(), Error> {
        Ok(())
    }

    /// SPEC_FULL.md §4.7.7.
    pub fn update<R: Read>(&mut self, stdin: &mut R) -> Result<(), Error> {
        let _record: UpdateRecord = recordio::read(stdin)?;
        Ok(())
    }

    fn spawn_observer(&self, spec: &launchspec::LaunchSpec, sandbox: &std::path::Path) -> Result<std::process::Child, Error> {
        let executor = self.libexec_directory.join("mesos-executor");
        let self_exe = std::env::current_exe().map_err(|e| Error::io(PathBuf::from("/proc/self/exe"), e))?;
        let out = File::create(sandbox.join("observer.out")).map_err(|e| Error::io(sandbox.join("observer.out"), e))?;
        let err = File::create(sandbox.join("observer.err")).map_err(|e| Error::io(sandbox.join("observer.err"), e))?;
        Command::new(&executor)
            .arg("--override")
            .arg(&self_exe)
            .arg("observe")
            .arg(spec.container_id())
            .current_dir(sandbox)
            .env_remove("LIBPROCESS_PORT")
            .env_remove("LIBPROCESS_IP")
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .spawn()
            .map_err(|e| Error::io(&executor, e))
    }

    fn mesos_env(&self) -> Vec<(String, String)> {
        MESOS_ESSENTIAL_ENV
            .iter()
            .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
            .collect()
    }

    fn fire_hook(&self, argv: &[String], env: &[(String, String)]) {
        let Some(program) = argv.first() else { return };
        let mut cmd = Command::new(program);
        cmd.args(&argv[1..]).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        for (k, v) in env {
            cmd.env(k, v);
        }
        if let Err(e) = cmd.spawn() {
            warn!("hook {:?} failed to start: {}", argv, e);
        }
    }

    fn stage_dockercfg(&self, sandbox: &std::path::Path) {
        if let Some(src) = &self.container_settings.dockercfg {
            if let Err(e) = fs::copy(src, sandbox.join(".dockercfg")) {
                warn!("failed to stage dockercfg from {}: {}", src.display(), e);
            }
        }
    }
}

/// Acquire a shared lock, retrying with a 1-second timeout if the blocking
/// attempt is interrupted by a signal (SPEC_FULL.md §4.7.2 step 3).
fn acquire_shared_retrying(state: &mut State, name: &str) -> Result<OwnedLockGuard, Error> {
    match state.lock(name, LockMode::Shared, Timeout::Infinite) {
        Ok(guard) => return Ok(guard),
        Err(state::Error::Lock(filelock::LockError::Interrupted(_))) => {}
        Err(e) => return Err(e.into()),
    }
    loop {
        match state.lock(name, LockMode::Shared, Timeout::After(Duration::from_secs(1))) {
            Ok(guard) => return Ok(guard),
            Err(state::Error::Lock(filelock::LockError::Interrupted(_))) => continue,
            Err(state::Error::Lock(filelock::LockError::Timeout(_))) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use runtime::{ExecCommand as RuntimeExecCommand, RuntimeDriverBuilder};
    use std::{
        path::Path,
        process::{Command as StdCommand, Output},
        sync::{Arc, Mutex},
    };
    use tempfile::TempDir;

    #[derive(Clone, Debug)]
    struct RecordingExec {
        calls: Arc<Mutex<Vec<Vec<String>>>>,
        scripted: &'static str,
    }

    impl RuntimeExecCommand for RecordingExec {
        fn run(&self, _binary: &Path, args: &[String]) -> std::io::Result<Output> {
            self.calls.lock().unwrap().push(args.to_vec());
            let status = StdCommand::new(which::which(self.scripted).unwrap()).status()?;
            Ok(Output {
                status,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    #[derive(Clone, Debug)]
    struct FixedOutputExec {
        stdout: Vec<u8>,
    }

    impl RuntimeExecCommand for FixedOutputExec {
        fn run(&self, _binary: &Path, _args: &[String]) -> std::io::Result<Output> {
            let status = StdCommand::new(which::which("true").unwrap()).status()?;
            Ok(Output {
                status,
                stdout: self.stdout.clone(),
                stderr: Vec::new(),
            })
        }
    }

    fn containerizer_with(dir: &TempDir, exec: Box<dyn RuntimeExecCommand>) -> Containerizer {
        let mut driver = RuntimeDriverBuilder::default().build().unwrap();
        driver.set_exec(exec);
        Containerizer::new(dir.path(), driver, Stager::new(false), "/usr/libexec")
    }

    fn write_record<T: serde::Serialize>(record: &T) -> Result<std::io::Cursor<Vec<u8>>> {
        let mut buf = Vec::new();
        recordio::write(&mut buf, record)?;
        Ok(std::io::Cursor::new(buf))
    }

    #[test]
    fn destroy_is_a_noop_once_exited() -> Result<()> {
        let dir = TempDir::new()?;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut cz = containerizer_with(&dir, Box::new(RecordingExec { calls: calls.clone(), scripted: "true" }));

        let mut state = State::open_by_container_id(dir.path(), "ct-1");
        state.set_runtime_id("rt-1");
        state.push()?;
        state.set_exit(0)?;

        let mut input = write_record(&DestroyRecord { container_id: "ct-1".into() })?;
        cz.destroy(&mut input)?;
        assert!(calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn destroy_stops_a_running_container() -> Result<()> {
        let dir = TempDir::new()?;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut cz = containerizer_with(&dir, Box::new(RecordingExec { calls: calls.clone(), scripted: "true" }));

        let mut state = State::open_by_container_id(dir.path(), "ct-2");
        state.set_runtime_id("rt-2");
        state.push()?;

        let mut input = write_record(&DestroyRecord { container_id: "ct-2".into() })?;
        cz.destroy(&mut input)?;
        let recorded = calls.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0][0], "stop");
        Ok(())
    }

    #[test]
    fn usage_is_empty_before_the_cid_is_known() -> Result<()> {
        let dir = TempDir::new()?;
        let mut cz = containerizer_with(&dir, Box::new(FixedOutputExec { stdout: Vec::new() }));

        let mut state = State::open_by_container_id(dir.path(), "ct-3");
        state.push()?;

        let mut input = write_record(&UsageRecord { container_id: "ct-3".into() })?;
        let mut output = Vec::new();
        let result = cz.with_cid_timeout(Duration::from_millis(50)).usage(&mut input, &mut output);
        assert!(matches!(result, Err(Error::State(state::Error::CidTimeout))));
        Ok(())
    }

    #[test]
    fn usage_is_empty_once_exited() -> Result<()> {
        let dir = TempDir::new()?;
        let mut cz = containerizer_with(&dir, Box::new(FixedOutputExec { stdout: Vec::new() }));

        let mut state = State::open_by_container_id(dir.path(), "ct-4");
        state.set_runtime_id("rt-4");
        state.push()?;
        state.set_exit(0)?;

        let mut input = write_record(&UsageRecord { container_id: "ct-4".into() })?;
        let mut output = Vec::new();
        cz.usage(&mut input, &mut output)?;
        assert!(output.is_empty());
        Ok(())
    }

    #[test]
    fn containers_reports_only_the_ones_still_holding_their_wait_lock() -> Result<()> {
        let dir = TempDir::new()?;
        let mut running = State::open_by_container_id(dir.path(), "running");
        running.set_runtime_id("rt-running");
        running.push()?;
        // `State::lock` dedups through the per-process registry, so locking
        // the same path again from this same test process would just
        // re-flock the same fd rather than genuinely contend. Use a detached
        // handle on the same lock file to stand in for another process.
        let wait_lock_path = dir.path().join("mesos").join("running").join("lock").join("wait");
        let detached = filelock::FileLock::open_detached(&wait_lock_path)?;
        let _held = detached.lock(LockMode::Exclusive, Timeout::NonBlocking)?;

        let mut exited = State::open_by_container_id(dir.path(), "exited");
        exited.set_runtime_id("rt-exited");
        exited.push()?;

        let mut cz = containerizer_with(
            &dir,
            Box::new(FixedOutputExec {
                stdout: b"rt-running\nrt-exited\n".to_vec(),
            }),
        );

        let mut output = Vec::new();
        cz.containers(&mut output)?;
        let mut cursor = std::io::Cursor::new(output);
        let decoded: ContainersRecord = recordio::read(&mut cursor)?;
        assert_eq!(decoded.containers, vec!["running".to_string()]);
        Ok(())
    }

    #[test]
    fn observe_returns_the_sentinel_when_no_exit_was_recorded() -> Result<()> {
        let dir = TempDir::new()?;
        let mut cz = containerizer_with(&dir, Box::new(FixedOutputExec { stdout: Vec::new() }));
        let mut state = State::open_by_container_id(dir.path(), "ct-5");
        state.push()?;
        assert_eq!(cz.observe("ct-5")?, 64);
        Ok(())
    }

    #[test]
    fn recover_and_update_are_no_ops() -> Result<()> {
        let dir = TempDir::new()?;
        let mut cz = containerizer_with(&dir, Box::new(FixedOutputExec { stdout: Vec::new() }));
        cz.recover()?;
        let mut input = write_record(&UpdateRecord {
            container_id: "ct-6".into(),
            resources: recordio::Resources::default(),
        })?;
        cz.update(&mut input)?;
        Ok(())
    }
}
