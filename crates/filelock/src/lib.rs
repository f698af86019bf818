//! Advisory whole-file POSIX locks keyed by absolute path.
//!
//! Mirrors the role of [`deimos.flock`]'s `LK` class: the container state
//! machine has no coordinating daemon, so concurrent `launch`/`wait`/
//! `destroy`/`cleanup` invocations on the same host serialize through
//! `flock(2)` on files inside the state directory instead.
//!
//! [`deimos.flock`]: https://github.com/mesosphere/deimos

use lazy_static::lazy_static;
use log::{error, info};
use std::{
    collections::HashMap,
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;

/// Whether an exclusive or shared lock is requested. See `flock(2)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn raw(self) -> libc::c_int {
        match self {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "SH"),
            LockMode::Exclusive => write!(f, "EX"),
        }
    }
}

/// How long to wait for the lock before giving up.
#[derive(Clone, Copy, Debug)]
pub enum Timeout {
    /// Fail immediately (`LOCK_NB`) rather than block at all.
    NonBlocking,
    /// Block for up to the given duration, then fail with [`LockError::Timeout`].
    After(Duration),
    /// Block indefinitely. May still return [`LockError::Interrupted`] if an
    /// unrelated signal arrives; callers are expected to retry with a short
    /// finite timeout in that case.
    Infinite,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {0} held by another process")]
    Locked(PathBuf),
    #[error("timed out waiting for lock {0}")]
    Timeout(PathBuf),
    #[error("lock acquisition for {0} interrupted by a signal")]
    Interrupted(PathBuf),
    #[error("i/o error locking {0}: {1}")]
    Io(PathBuf, #[source] io::Error),
}

type HandleSlot = Arc<Mutex<Option<File>>>;

lazy_static! {
    /// Per-process registry of lock handles, keyed by absolute path.
    ///
    /// `flock(2)` locks are associated with the *open file description*, not
    /// the path or inode: two independently-opened file descriptors against
    /// the same path do not exclude each other within one process. Without
    /// this registry, two call sites in the same invocation acquiring the
    /// same named lock could each get their own fd and deadlock (or worse,
    /// silently fail to exclude each other) instead of transparently sharing
    /// one lock, as happens e.g. between `launch`'s own lock calls and a
    /// nested `await_launch`.
    static ref REGISTRY: Mutex<HashMap<PathBuf, HandleSlot>> = Mutex::new(HashMap::new());
}

/// A lockable file, reusing the per-process singleton handle for its path.
pub struct FileLock {
    path: PathBuf,
    handle: HandleSlot,
}

impl FileLock {
    /// Open (or reuse) the process-wide handle for `path`. `path` must be
    /// absolute; the parent directory is created if missing.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        ensure_parent_dir(&path)?;
        let handle = REGISTRY
            .lock()
            .expect("file lock registry poisoned")
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        Ok(Self { path, handle })
    }

    /// Open a handle that bypasses the process-wide registry. Only meant for
    /// tests that need two independent handles against the same path within
    /// a single test process, to simulate two cooperating OS processes.
    pub fn open_detached(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        ensure_parent_dir(&path)?;
        Ok(Self {
            path,
            handle: Arc::new(Mutex::new(None)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, blocking per `timeout`. On success, returns a guard
    /// that releases (and closes) the handle when dropped.
    pub fn lock(&self, mode: LockMode, timeout: Timeout) -> Result<LockGuard<'_>, LockError> {
        let mut slot = self.handle.lock().expect("file lock handle poisoned");
        if slot.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)
                .map_err(|e| LockError::Io(self.path.clone(), e))?;
            *slot = Some(file);
        }
        let fd = slot.as_ref().expect("just inserted").as_raw_fd();

        info!("request // {} {} ({:?})", self.path.display(), mode, timeout);
        let result = match timeout {
            Timeout::NonBlocking => raw_flock(fd, mode.raw() | libc::LOCK_NB),
            Timeout::After(d) if d.is_zero() => raw_flock(fd, mode.raw() | libc::LOCK_NB),
            Timeout::After(d) => flock_with_alarm(fd, mode.raw(), ceil_secs(d)),
            Timeout::Infinite => raw_flock(fd, mode.raw()),
        };

        if let Err(e) = result {
            error!("failure // {} {}: {}", self.path.display(), mode, e);
            return Err(classify(&self.path, timeout, e));
        }
        info!("success // {} {}", self.path.display(), mode);

        if mode == LockMode::Exclusive {
            if let Some(file) = slot.as_mut() {
                let _ = writeln!(file, "{}", common::Timestamp::now());
            }
        }

        drop(slot);
        Ok(LockGuard { lock: self })
    }

    fn unlock_and_close(&self) {
        let mut slot = self.handle.lock().expect("file lock handle poisoned");
        if let Some(file) = slot.take() {
            let _ = raw_flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }

    /// Like [`FileLock::lock`], but takes ownership of the handle so the
    /// resulting guard can outlive the function that acquired it (e.g. be
    /// returned up a call stack) instead of borrowing a local `FileLock`.
    pub fn lock_owned(self, mode: LockMode, timeout: Timeout) -> Result<OwnedLockGuard, LockError> {
        {
            let guard = self.lock(mode, timeout)?;
            std::mem::forget(guard);
        }
        Ok(OwnedLockGuard { lock: self })
    }
}

/// RAII guard for a held lock. Dropping it releases the lock and closes the
/// underlying handle unconditionally, matching the source's `unlock()`.
pub struct LockGuard<'a> {
    lock: &'a FileLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_and_close();
    }
}

/// An owned variant of [`LockGuard`] for callers that need to hand a held
/// lock to another function or store it past the scope that acquired it.
pub struct OwnedLockGuard {
    lock: FileLock,
}

impl OwnedLockGuard {
    pub fn path(&self) -> &Path {
        self.lock.path()
    }
}

impl Drop for OwnedLockGuard {
    fn drop(&mut self) {
        self.lock.unlock_and_close();
    }
}

fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn ceil_secs(d: Duration) -> libc::c_uint {
    let secs = d.as_secs() + if d.subsec_nanos() > 0 { 1 } else { 0 };
    secs.min(libc::c_uint::MAX as u64) as libc::c_uint
}

fn raw_flock(fd: libc::c_int, op: libc::c_int) -> io::Result<()> {
    let ret = unsafe { libc::flock(fd, op) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

extern "C" fn noop_alarm_handler(_: libc::c_int) {}

/// Installs a one-shot SIGALRM that fires after `secs`, attempts the flock
/// call, then restores the previous handler. Mirrors
/// `deimos.flock.timeout`'s use of `signal.alarm` as a `flock` cancellation
/// mechanism, since POSIX gives no other way to bound a blocking `flock(2)`.
fn flock_with_alarm(fd: libc::c_int, op: libc::c_int, secs: libc::c_uint) -> io::Result<()> {
    let previous = unsafe { libc::signal(libc::SIGALRM, noop_alarm_handler as libc::sighandler_t) };
    unsafe { libc::alarm(secs) };
    let result = raw_flock(fd, op);
    unsafe { libc::alarm(0) };
    unsafe { libc::signal(libc::SIGALRM, previous) };
    result
}

fn classify(path: &Path, timeout: Timeout, err: io::Error) -> LockError {
    let raw = err.raw_os_error();
    match timeout {
        Timeout::NonBlocking | Timeout::After(_) if d_is_zero(timeout) => {
            if raw == Some(libc::EWOULDBLOCK) || raw == Some(libc::EAGAIN) {
                LockError::Locked(path.to_path_buf())
            } else {
                LockError::Io(path.to_path_buf(), err)
            }
        }
        Timeout::After(_) => {
            if raw == Some(libc::EINTR) || raw == Some(libc::EAGAIN) || raw == Some(libc::EACCES) {
                LockError::Timeout(path.to_path_buf())
            } else {
                LockError::Io(path.to_path_buf(), err)
            }
        }
        Timeout::Infinite => {
            if raw == Some(libc::EINTR) {
                LockError::Interrupted(path.to_path_buf())
            } else {
                LockError::Io(path.to_path_buf(), err)
            }
        }
        Timeout::NonBlocking => unreachable!(),
    }
}

fn d_is_zero(timeout: Timeout) -> bool {
    matches!(timeout, Timeout::NonBlocking) || matches!(timeout, Timeout::After(d) if d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn exclusive_then_shared_is_blocked_nonblocking() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("launch");

        let a = FileLock::open_detached(&path)?;
        let b = FileLock::open_detached(&path)?;

        let held = a.lock(LockMode::Exclusive, Timeout::NonBlocking)?;
        let err = b.lock(LockMode::Shared, Timeout::NonBlocking).unwrap_err();
        assert!(matches!(err, LockError::Locked(_)));
        drop(held);

        // Once released, a fresh attempt succeeds.
        let _ = b.lock(LockMode::Shared, Timeout::NonBlocking)?;
        Ok(())
    }

    #[test]
    fn two_shared_locks_coexist() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("wait");

        let a = FileLock::open_detached(&path)?;
        let b = FileLock::open_detached(&path)?;

        let _g1 = a.lock(LockMode::Shared, Timeout::NonBlocking)?;
        let _g2 = b.lock(LockMode::Shared, Timeout::NonBlocking)?;
        Ok(())
    }

    #[test]
    fn timeout_expires_without_holding_lock() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("destroy");

        let a = FileLock::open_detached(&path)?;
        let b = FileLock::open_detached(&path)?;

        let _held = a.lock(LockMode::Exclusive, Timeout::NonBlocking)?;
        let err = b
            .lock(LockMode::Exclusive, Timeout::After(Duration::from_millis(200)))
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout(_)));
        Ok(())
    }

    #[test]
    fn exclusive_acquisition_appends_timestamp() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("launch");
        let lock = FileLock::open_detached(&path)?;
        let _g = lock.lock(LockMode::Exclusive, Timeout::NonBlocking)?;
        drop(_g);
        let contents = fs::read_to_string(&path)?;
        assert!(contents.trim_end().parse::<common::Timestamp>().is_ok());
        Ok(())
    }

    #[test]
    fn lock_owned_outlives_the_acquiring_function() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("launch");

        fn acquire(path: &Path) -> Result<OwnedLockGuard> {
            let lock = FileLock::open_detached(path)?;
            Ok(lock.lock_owned(LockMode::Exclusive, Timeout::NonBlocking)?)
        }

        let held = acquire(&path)?;
        let other = FileLock::open_detached(&path)?;
        let err = other.lock(LockMode::Shared, Timeout::NonBlocking).unwrap_err();
        assert!(matches!(err, LockError::Locked(_)));
        drop(held);
        let _ = other.lock(LockMode::Shared, Timeout::NonBlocking)?;
        Ok(())
    }

    #[test]
    fn registry_reuses_handle_for_same_process() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("registry");
        let a = FileLock::open(&path)?;
        let b = FileLock::open(&path)?;
        // Same process, same path: acquiring exclusive via `a` and again via
        // `b` must not deadlock, since both dedup onto one fd.
        let g1 = a.lock(LockMode::Exclusive, Timeout::NonBlocking)?;
        drop(g1);
        let _g2 = b.lock(LockMode::Exclusive, Timeout::NonBlocking)?;
        Ok(())
    }
}
