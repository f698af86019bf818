//! Ages out old container state directories.
//!
//! Listing and removal are deliberately separate operations (`dirs` /
//! `remove`) so the `state` CLI verb can preview a cutoff's blast radius
//! before committing to it. `remove` is guarded by its own `cleanup` lock,
//! acquired non-blocking: if another cleanup invocation already holds it,
//! this one is a silent no-op rather than a queued wait, since cleanup runs
//! on a timer and the next tick will simply try again.
//!
//! Grounded on `examples/original_source/deimos/cleanup.py`.

mod error;

pub use error::Error;

use std::{
    fs,
    path::{Path, PathBuf},
};

use common::Timestamp;
use filelock::{FileLock, LockError, LockMode, Timeout};
use log::{error, info};

pub struct Cleanup {
    root: PathBuf,
}

impl Cleanup {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// List `start-time/` index entries (as their own path, a symlink into
    /// `mesos/<container-id>`) whose timestamp sorts strictly before
    /// `cutoff`, optionally restricted to containers that have (or haven't)
    /// exited yet.
    pub fn dirs(&self, cutoff: Timestamp, exited: Option<bool>) -> Result<Vec<PathBuf>, Error> {
        let index_dir = self.root.join("start-time");
        if !index_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<_> = fs::read_dir(&index_dir)
            .map_err(|e| Error::io(&index_dir, e))?
            .filter_map(|e| e.ok())
            .collect();
        entries.sort_by_key(|e| e.file_name());

        let cutoff_str = cutoff.to_string();
        let mut out = Vec::new();
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name >= cutoff_str {
                continue;
            }
            let link = entry.path();
            if let Some(want_exited) = exited {
                let resolved = match self.resolve(&link) {
                    Some(p) => p,
                    None => continue,
                };
                let has_exit = resolved.join("exit").exists();
                if has_exit != want_exited {
                    continue;
                }
            }
            out.push(link);
        }
        Ok(out)
    }

    /// Remove every container directory (and its reverse indices) whose
    /// start-time entry matches `dirs(cutoff, exited)`. Returns the number
    /// of directories that failed to remove. A no-op, returning `Ok(0)`,
    /// if the cleanup lock is already held.
    pub fn remove(&self, cutoff: Timestamp, exited: Option<bool>) -> Result<usize, Error> {
        let lock = FileLock::open(self.root.join("cleanup")).map_err(|e| Error::io(self.root.join("cleanup"), e))?;
        let _guard = match lock.lock(LockMode::Exclusive, Timeout::NonBlocking) {
            Ok(guard) => guard,
            Err(LockError::Locked(_)) => {
                info!("cleanup lock already held, skipping this pass");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut failures = 0;
        for link in self.dirs(cutoff, exited)? {
            if let Err(e) = self.remove_one(&link) {
                error!("failed to remove {}: {}", link.display(), e);
                failures += 1;
            }
        }
        Ok(failures)
    }

    fn resolve(&self, start_time_link: &Path) -> Option<PathBuf> {
        let target = fs::read_link(start_time_link).ok()?;
        Some(start_time_link.parent()?.join(target))
    }

    fn remove_one(&self, start_time_link: &Path) -> Result<(), Error> {
        let mesos_dir = self
            .resolve(start_time_link)
            .ok_or_else(|| Error::io(start_time_link, std::io::Error::new(std::io::ErrorKind::NotFound, "dangling start-time entry")))?;

        let runtime_id = fs::read_to_string(mesos_dir.join("cid")).ok().map(|s| s.trim().to_string());

        ignore_not_found(fs::remove_file(start_time_link)).map_err(|e| Error::io(start_time_link, e))?;
        ignore_not_found(fs::remove_dir_all(&mesos_dir)).map_err(|e| Error::io(&mesos_dir, e))?;
        if let Some(runtime_id) = runtime_id {
            let docker_link = self.root.join("docker").join(&runtime_id);
            ignore_not_found(fs::remove_file(&docker_link)).map_err(|e| Error::io(&docker_link, e))?;
        }
        Ok(())
    }
}

fn ignore_not_found(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::{os::unix::fs::symlink, time::Duration};
    use tempfile::TempDir;

    fn seed_container(root: &Path, id: &str, ts: Timestamp, runtime_id: Option<&str>, exited: bool) -> Result<()> {
        let mesos_dir = root.join("mesos").join(id);
        fs::create_dir_all(&mesos_dir)?;
        if let Some(rid) = runtime_id {
            fs::write(mesos_dir.join("cid"), rid)?;
            fs::create_dir_all(root.join("docker"))?;
            symlink(format!("../mesos/{}", id), root.join("docker").join(rid))?;
        }
        if exited {
            fs::write(mesos_dir.join("exit"), "0")?;
        }
        fs::create_dir_all(root.join("start-time"))?;
        symlink(format!("../mesos/{}", id), root.join("start-time").join(ts.to_string()))?;
        Ok(())
    }

    #[test]
    fn lists_entries_before_the_cutoff() -> Result<()> {
        let dir = TempDir::new()?;
        let old = Timestamp::now();
        std::thread::sleep(Duration::from_secs(1));
        let cutoff = Timestamp::now();
        std::thread::sleep(Duration::from_secs(1));
        let new = Timestamp::now();

        seed_container(dir.path(), "old", old, Some("rt-old"), false)?;
        seed_container(dir.path(), "new", new, Some("rt-new"), false)?;

        let cleanup = Cleanup::new(dir.path());
        let found = cleanup.dirs(cutoff, None)?;
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with(old.to_string()));
        Ok(())
    }

    #[test]
    fn filters_by_exited_flag() -> Result<()> {
        let dir = TempDir::new()?;
        let ts1 = Timestamp::now();
        std::thread::sleep(Duration::from_secs(1));
        let ts2 = Timestamp::now();
        std::thread::sleep(Duration::from_secs(1));
        let cutoff = Timestamp::now();

        seed_container(dir.path(), "exited", ts1, Some("rt-1"), true)?;
        seed_container(dir.path(), "running", ts2, Some("rt-2"), false)?;

        let cleanup = Cleanup::new(dir.path());
        let exited_only = cleanup.dirs(cutoff, Some(true))?;
        assert_eq!(exited_only.len(), 1);
        assert!(exited_only[0].ends_with(ts1.to_string()));
        Ok(())
    }

    #[test]
    fn remove_deletes_mesos_docker_and_index_entries() -> Result<()> {
        let dir = TempDir::new()?;
        let ts = Timestamp::now();
        std::thread::sleep(Duration::from_secs(1));
        let cutoff = Timestamp::now();
        seed_container(dir.path(), "ct-1", ts, Some("rt-1"), false)?;

        let cleanup = Cleanup::new(dir.path());
        let failures = cleanup.remove(cutoff, None)?;
        assert_eq!(failures, 0);
        assert!(!dir.path().join("mesos/ct-1").exists());
        assert!(!dir.path().join("docker/rt-1").exists());
        assert!(!dir.path().join("start-time").join(ts.to_string()).exists());
        Ok(())
    }

    #[test]
    fn remove_is_a_noop_when_lock_is_held() -> Result<()> {
        let dir = TempDir::new()?;
        let lock = FileLock::open_detached(dir.path().join("cleanup"))?;
        let _held = lock.lock(LockMode::Exclusive, Timeout::NonBlocking)?;

        let cleanup = Cleanup::new(dir.path());
        let failures = cleanup.remove(Timestamp::now(), None)?;
        assert_eq!(failures, 0);
        Ok(())
    }
}
