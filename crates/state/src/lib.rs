//! The on-disk state directory.
//!
//! One container's worth of bookkeeping lives under
//! `<root>/mesos/<container-id>/`: write-once fields (`cid`, `eid`, `t`,
//! `mesos-container-id`, `exit`) recording facts as they become known, a
//! `fs` symlink into the sandbox, and a `lock/` directory holding the four
//! named advisory locks (`launch`, `wait`, `observe`, `destroy`) that
//! serialize concurrent verb invocations against the same container.
//! `<root>/docker/<runtime-id>` and `<root>/start-time/<timestamp>` are
//! reverse indices: relative symlinks back into `mesos/<container-id>`, so
//! that `containers`/`cleanup` can enumerate or resolve containers without
//! knowing the agent-chosen id up front.
//!
//! Grounded on `examples/original_source/deimos/state.py`.

mod error;

pub use error::Error;
pub use filelock::{LockMode, OwnedLockGuard, Timeout};

use std::{
    fs,
    io,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use common::{ContainerId, Timestamp};
use filelock::FileLock;
use log::debug;
use rand::Rng;

/// Per-step multipliers for `await_cid`'s backoff, cycling through at
/// increasing scale (`50ms * STEPS[i] * 10^cycle`). Mirrors the geometric
/// backoff table in `deimos.state.State.await_cid`.
const STEP_BASE_MS: f64 = 50.0;
const STEPS: [f64; 10] = [1.0, 1.25, 1.6, 2.0, 2.5, 3.2, 4.0, 5.0, 6.4, 8.0];

/// A handle onto one container's directory within the state tree, opened
/// either by the agent-chosen `ContainerId` or by resolving a runtime id
/// through the `docker/` reverse index.
pub struct State {
    root: PathBuf,
    container_id: Option<ContainerId>,
    runtime_id: Option<String>,
    executor_id: Option<String>,
}

impl State {
    pub fn open_by_container_id(root: impl Into<PathBuf>, container_id: impl Into<ContainerId>) -> Self {
        Self {
            root: root.into(),
            container_id: Some(container_id.into()),
            runtime_id: None,
            executor_id: None,
        }
    }

    pub fn open_by_runtime_id(root: impl Into<PathBuf>, runtime_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            container_id: None,
            runtime_id: Some(runtime_id.into()),
            executor_id: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The container's directory under `<root>/mesos/<container-id>/`, for
    /// callers that need a raw filesystem path (e.g. the `--cidfile` argument
    /// to `docker run`).
    pub fn dir(&mut self) -> Result<PathBuf, Error> {
        self.resolve_dir()
    }

    /// Resolve (and cache) the container id this handle refers to,
    /// following the `docker/` reverse index if it was opened by runtime id.
    pub fn container_id(&mut self) -> Result<ContainerId, Error> {
        self.resolve_dir()?;
        Ok(self.container_id.clone().expect("resolve_dir populates container_id"))
    }

    pub fn set_runtime_id(&mut self, id: impl Into<String>) {
        self.runtime_id = Some(id.into());
    }

    pub fn set_executor_id(&mut self, id: impl Into<String>) {
        self.executor_id = Some(id.into());
    }

    /// Whether this container's directory already exists.
    pub fn exists(&mut self) -> bool {
        self.resolve_dir().is_ok()
    }

    /// The runtime (docker) id, read fresh from the `cid` field. `None` if
    /// the container hasn't published one yet.
    pub fn runtime_id(&mut self) -> Result<Option<String>, Error> {
        let dir = self.resolve_dir()?;
        let value = read_field(&dir.join("cid"))?;
        if value.is_some() {
            self.runtime_id = value.clone();
        }
        Ok(value)
    }

    /// The executor id, write-once; cached once read or set.
    pub fn executor_id(&mut self) -> Result<Option<String>, Error> {
        if self.executor_id.is_some() {
            return Ok(self.executor_id.clone());
        }
        let dir = self.resolve_dir()?;
        self.executor_id = read_field(&dir.join("eid"))?;
        Ok(self.executor_id.clone())
    }

    pub fn start_time(&mut self) -> Result<Option<Timestamp>, Error> {
        let dir = self.resolve_dir()?;
        match read_field(&dir.join("t"))? {
            Some(s) => Ok(s.parse().ok()),
            None => Ok(None),
        }
    }

    /// Publish this handle's in-memory fields (container id, executor id,
    /// runtime id, start time) to disk. Write-once fields that already
    /// exist on disk are left untouched; this is safe to call more than
    /// once for the same container (e.g. once before the runner is spawned,
    /// again once its id is known).
    pub fn push(&mut self) -> Result<(), Error> {
        let container_id = self
            .container_id
            .clone()
            .ok_or_else(|| Error::BadStateInvariant("push requires a known container id".into()))?;
        let dir = self.root.join("mesos").join(container_id.as_str());
        fs::create_dir_all(dir.join("lock")).map_err(|e| Error::io(dir.join("lock"), e))?;

        write_once(&dir.join("mesos-container-id"), container_id.as_str())?;
        if let Some(eid) = self.executor_id.clone() {
            write_once(&dir.join("eid"), &eid)?;
        }
        self.ensure_start_time(&dir, &container_id)?;
        if let Some(runtime_id) = self.runtime_id.clone() {
            write_once(&dir.join("cid"), &runtime_id)?;
            let link = self.root.join("docker").join(&runtime_id);
            if !link.exists() {
                if let Some(parent) = link.parent() {
                    fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
                }
                let target = format!("../mesos/{}", container_id);
                symlink(&target, &link).or_else(ignore_already_exists).map_err(|e| Error::io(&link, e))?;
            }
        }
        Ok(())
    }

    /// Poll for a published runtime id, backing off geometrically, until
    /// `timeout` elapses.
    pub fn await_cid(&mut self, timeout: Duration) -> Result<String, Error> {
        let start = Instant::now();
        let mut step_idx = 0usize;
        let mut scale = 1.0_f64;
        loop {
            if let Some(id) = self.runtime_id()? {
                if !id.is_empty() {
                    return Ok(id);
                }
            }
            if start.elapsed() >= timeout {
                return Err(Error::CidTimeout);
            }
            let sleep_ms = (STEP_BASE_MS * STEPS[step_idx] * scale) as u64;
            thread::sleep(Duration::from_millis(sleep_ms));
            step_idx += 1;
            if step_idx == STEPS.len() {
                step_idx = 0;
                scale *= 10.0;
            }
            if start.elapsed() >= timeout {
                return Err(Error::CidTimeout);
            }
        }
    }

    /// Acquire the `launch` lock shared, waiting for a runtime id to appear
    /// first if the container hasn't launched yet. Used by `wait`/`observe`
    /// to block until a container genuinely exists before probing it.
    pub fn await_launch(&mut self, cid_timeout: Duration) -> Result<OwnedLockGuard, Error> {
        let guard = self.lock("launch", LockMode::Shared, Timeout::Infinite)?;
        if self.runtime_id()?.is_none() {
            drop(guard);
            self.await_cid(cid_timeout)?;
            return self.lock("launch", LockMode::Shared, Timeout::Infinite);
        }
        Ok(guard)
    }

    pub fn set_pid(&mut self, pid: u32) -> Result<(), Error> {
        let dir = self.resolve_dir()?;
        fs::write(dir.join("pid"), pid.to_string()).map_err(|e| Error::io(dir.join("pid"), e))
    }

    pub fn pid(&mut self) -> Result<Option<u32>, Error> {
        let dir = self.resolve_dir()?;
        Ok(read_field(&dir.join("pid"))?.and_then(|s| s.parse().ok()))
    }

    pub fn set_exit(&mut self, code: i32) -> Result<(), Error> {
        let dir = self.resolve_dir()?;
        write_once(&dir.join("exit"), &code.to_string())
    }

    pub fn exit(&mut self) -> Result<Option<i32>, Error> {
        let dir = self.resolve_dir()?;
        Ok(read_field(&dir.join("exit"))?.and_then(|s| s.parse().ok()))
    }

    /// Create (if missing) the `fs` symlink pointing at the sandbox
    /// directory, and return its path.
    pub fn set_sandbox_symlink(&mut self, target: &Path) -> Result<PathBuf, Error> {
        self.set_sandbox_symlink_named("fs", target)
    }

    /// Like [`State::set_sandbox_symlink`], but under a caller-chosen link
    /// name rather than the default `fs` (SPEC_FULL.md §11's `shared_dir`).
    pub fn set_sandbox_symlink_named(&mut self, name: &str, target: &Path) -> Result<PathBuf, Error> {
        let dir = self.resolve_dir()?;
        let link = dir.join(name);
        if !link.exists() {
            symlink(target, &link).or_else(ignore_already_exists).map_err(|e| Error::io(&link, e))?;
        }
        Ok(link)
    }

    /// Acquire a named lock (`launch`, `wait`, `observe`, `destroy`, or any
    /// other name a caller chooses) under this container's `lock/`
    /// directory.
    pub fn lock(&mut self, name: &str, mode: LockMode, timeout: Timeout) -> Result<OwnedLockGuard, Error> {
        let dir = self.resolve_dir()?;
        let path = dir.join("lock").join(name);
        let file_lock = FileLock::open(path).map_err(|e| Error::io(dir.join("lock").join(name), e))?;
        Ok(file_lock.lock_owned(mode, timeout)?)
    }

    fn resolve_dir(&mut self) -> Result<PathBuf, Error> {
        if let Some(id) = &self.container_id {
            return Ok(self.root.join("mesos").join(id.as_str()));
        }
        let runtime_id = self
            .runtime_id
            .clone()
            .ok_or_else(|| Error::BadStateInvariant("state opened with neither a container id nor a runtime id".into()))?;
        let link = self.root.join("docker").join(&runtime_id);
        let target = fs::read_link(&link).map_err(|e| Error::io(&link, e))?;
        let resolved = link.parent().expect("docker/<id> has a parent").join(&target);
        let container_id = resolved
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::BadStateInvariant(format!("malformed reverse index target for runtime id {}", runtime_id)))?
            .to_string();
        self.container_id = Some(ContainerId::new(container_id));
        Ok(self.root.join("mesos").join(self.container_id.as_ref().unwrap().as_str()))
    }

    /// Publish a `start-time/<timestamp>` index entry the first time this
    /// container is pushed, retrying on a colliding timestamp (two launches
    /// within the same second) with jittered backoff up to one second.
    fn ensure_start_time(&self, dir: &Path, container_id: &ContainerId) -> Result<(), Error> {
        if read_field(&dir.join("t"))?.is_some() {
            return Ok(());
        }
        let index_dir = self.root.join("start-time");
        fs::create_dir_all(&index_dir).map_err(|e| Error::io(&index_dir, e))?;
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            let ts = Timestamp::now();
            let link = index_dir.join(ts.to_string());
            let target = format!("../mesos/{}", container_id);
            match symlink(&target, &link) {
                Ok(()) => {
                    write_once(&dir.join("t"), &ts.to_string())?;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(Error::TimestampRetryExhausted(link));
                    }
                    let jitter_ms = rand::thread_rng().gen_range(5..=25);
                    debug!("start-time collision on {}, retrying in {}ms", ts, jitter_ms);
                    thread::sleep(Duration::from_millis(jitter_ms));
                }
                Err(e) => return Err(Error::io(link, e)),
            }
        }
    }
}

fn read_field(path: &Path) -> Result<Option<String>, Error> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Write `value` to `path` only if it doesn't already exist. Fields written
/// this way (`cid`, `eid`, `t`, `mesos-container-id`, `exit`) are facts
/// recorded once and never revised.
fn write_once(path: &Path, value: &str) -> Result<(), Error> {
    if path.exists() {
        return Ok(());
    }
    fs::write(path, value).map_err(|e| Error::io(path, e))
}

fn ignore_already_exists(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::AlreadyExists {
        Ok(())
    } else {
        Err(e)
    }
}
