//! Resource usage accounting read directly from cgroup v1 pseudo-files.
//!
//! The runtime daemon already creates the cgroups; this crate only ever
//! reads them. Subsystem paths are discovered by globbing rather than
//! assumed, since a container's cgroup can sit directly under a subsystem
//! (`/sys/fs/cgroup/<subsys>/<id>`) or nested under a `docker/` parent
//! (`/sys/fs/cgroup/<subsys>/docker/<id>`), depending on the runtime's
//! cgroup driver.
//!
//! Grounded on `examples/original_source/deimos/cgroups.py`.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use glob::glob;
use log::debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error reading {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

const DEFAULT_ROOT: &str = "/sys/fs/cgroup";

/// Resolved cgroup subsystem directories for one container.
#[derive(Debug, Clone, Default)]
pub struct CGroupReader {
    subsystems: HashMap<String, PathBuf>,
}

impl CGroupReader {
    /// Discover cgroups for `container_id` under the real `/sys/fs/cgroup`.
    pub fn for_container(container_id: &str) -> Self {
        Self::under_root(DEFAULT_ROOT, container_id)
    }

    /// Discover cgroups for `container_id` under an arbitrary root, for
    /// tests that can't write to `/sys/fs/cgroup`.
    pub fn under_root(root: &str, container_id: &str) -> Self {
        let mut subsystems = HashMap::new();
        for pattern in &[
            format!("{}/*/{}", root, container_id),
            format!("{}/*/docker/{}", root, container_id),
        ] {
            let paths = match glob(pattern) {
                Ok(paths) => paths,
                Err(e) => {
                    debug!("invalid cgroup glob pattern {}: {}", pattern, e);
                    continue;
                }
            };
            for entry in paths.flatten() {
                if let Some(name) = subsystem_name(root, &entry) {
                    subsystems.entry(name).or_insert(entry);
                }
            }
        }
        Self { subsystems }
    }

    /// True if no cgroup subsystem was found for this container at all
    /// (e.g. it has already exited and been reaped by the runtime).
    pub fn is_empty(&self) -> bool {
        self.subsystems.is_empty()
    }

    pub fn memory_rss(&self) -> Option<u64> {
        kv(&self.subsystems, "memory", "memory.stat")?.get("rss")?.parse().ok()
    }

    pub fn memory_limit_bytes(&self) -> Option<u64> {
        scalar(&self.subsystems, "memory", "memory.limit_in_bytes")?.parse().ok()
    }

    /// CPU shares, converted to a fractional core count the way they were
    /// allocated (`shares / 1024`).
    pub fn cpu_limit(&self) -> Option<f64> {
        let shares: f64 = scalar(&self.subsystems, "cpu", "cpu.shares")?.parse().ok()?;
        Some(shares / 1024.0)
    }

    /// User-mode CPU time in seconds, converted from the kernel's
    /// USER_HZ-jiffies (always 100 on Linux).
    pub fn cpu_user_seconds(&self) -> Option<f64> {
        let jiffies: f64 = kv(&self.subsystems, "cpuacct", "cpuacct.stat")?.get("user")?.parse().ok()?;
        Some(jiffies / 100.0)
    }

    pub fn cpu_system_seconds(&self) -> Option<f64> {
        let jiffies: f64 = kv(&self.subsystems, "cpuacct", "cpuacct.stat")?.get("system")?.parse().ok()?;
        Some(jiffies / 100.0)
    }
}

fn subsystem_name(root: &str, path: &Path) -> Option<String> {
    let prefix = format!("{}/", root.trim_end_matches('/'));
    let rel = path.to_str()?.strip_prefix(&prefix)?;
    let first = rel.split('/').next()?;
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

fn scalar(subsystems: &HashMap<String, PathBuf>, subsystem: &str, file: &str) -> Option<String> {
    let dir = subsystems.get(subsystem)?;
    fs::read_to_string(dir.join(file)).ok().map(|s| s.trim().to_string())
}

/// Parse a cgroup "key value" file, one pair per line, silently skipping
/// lines that aren't exactly two whitespace-separated tokens.
fn kv(subsystems: &HashMap<String, PathBuf>, subsystem: &str, file: &str) -> Option<HashMap<String, String>> {
    let dir = subsystems.get(subsystem)?;
    let contents = fs::read_to_string(dir.join(file)).ok()?;
    let mut map = HashMap::new();
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(k), Some(v), None) = (parts.next(), parts.next(), parts.next()) {
            map.insert(k.to_string(), v.to_string());
        }
    }
    Some(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) -> Result<()> {
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(path, contents)?;
        Ok(())
    }

    #[test]
    fn reads_memory_and_cpu_accounting() -> Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path().to_str().unwrap();
        write(&dir.path().join("memory/ct-1/memory.stat"), "cache 100\nrss 2048\n")?;
        write(&dir.path().join("memory/ct-1/memory.limit_in_bytes"), "1073741824\n")?;
        write(&dir.path().join("cpu/ct-1/cpu.shares"), "512\n")?;
        write(&dir.path().join("cpuacct/ct-1/cpuacct.stat"), "user 250\nsystem 50\n")?;

        let reader = CGroupReader::under_root(root, "ct-1");
        assert!(!reader.is_empty());
        assert_eq!(reader.memory_rss(), Some(2048));
        assert_eq!(reader.memory_limit_bytes(), Some(1_073_741_824));
        assert_eq!(reader.cpu_limit(), Some(0.5));
        assert_eq!(reader.cpu_user_seconds(), Some(2.5));
        assert_eq!(reader.cpu_system_seconds(), Some(0.5));
        Ok(())
    }

    #[test]
    fn finds_docker_nested_subsystems() -> Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path().to_str().unwrap();
        write(&dir.path().join("memory/docker/ct-2/memory.stat"), "rss 4096\n")?;

        let reader = CGroupReader::under_root(root, "ct-2");
        assert_eq!(reader.memory_rss(), Some(4096));
        Ok(())
    }

    #[test]
    fn missing_container_is_empty() {
        let dir = TempDir::new().unwrap();
        let reader = CGroupReader::under_root(dir.path().to_str().unwrap(), "nope");
        assert!(reader.is_empty());
        assert_eq!(reader.memory_rss(), None);
    }

    #[test]
    fn malformed_lines_are_skipped() -> Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path().to_str().unwrap();
        write(&dir.path().join("cpuacct/ct-3/cpuacct.stat"), "garbage line here\nuser 10\n")?;
        let reader = CGroupReader::under_root(root, "ct-3");
        assert_eq!(reader.cpu_user_seconds(), Some(0.1));
        Ok(())
    }
}
