//! Fetches a task's `CommandInfo.uris` into its sandbox directory before
//! launch.
//!
//! A single URI failing to fetch must never abort the whole launch -- the
//! agent itself tolerates this, and so must this adapter -- so every
//! per-URI failure here is logged and skipped rather than propagated.
//! Transport is chosen by URI scheme and always shells out to an external
//! binary (curl for HTTP-like schemes, an object-store CLI otherwise)
//! rather than embedding an HTTP client, matching the URI fetcher's
//! transport being explicitly out of scope for this adapter to reimplement.
//!
//! Grounded on the sync `ExecCommand` exec-wrapper shape of
//! `crates/sandbox/src/pinns.rs`. Semantics grounded on
//! `examples/original_source/deimos/containerizer.py` (`place_uris`,
//! `unpacker`).

mod error;

pub use error::Error;

use std::{
    fmt::Debug,
    fs,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};

use dyn_clone::{clone_trait_object, DynClone};
use log::warn;
use recordio::UriSpec;

pub trait ExecCommand: Debug + DynClone + Send + Sync {
    fn run(&self, argv: &[String]) -> std::io::Result<ExitStatus> {
        Command::new(&argv[0]).args(&argv[1..]).status()
    }
}

clone_trait_object!(ExecCommand);

#[derive(Clone, Debug, Default)]
struct DefaultExecCommand;

impl ExecCommand for DefaultExecCommand {}

#[derive(Clone)]
pub struct Stager {
    exec: Box<dyn ExecCommand>,
    optimistic_unpack: bool,
}

impl Stager {
    pub fn new(optimistic_unpack: bool) -> Self {
        Self {
            exec: Box::new(DefaultExecCommand),
            optimistic_unpack,
        }
    }

    #[doc(hidden)]
    pub fn with_exec(exec: Box<dyn ExecCommand>, optimistic_unpack: bool) -> Self {
        Self { exec, optimistic_unpack }
    }

    /// Fetch each URI into `directory`, creating it first if needed.
    /// Individual fetch failures are logged and skipped.
    pub fn stage(&self, uris: &[UriSpec], directory: &Path) -> Result<(), Error> {
        fs::create_dir_all(directory).map_err(|e| Error::Io(directory.to_path_buf(), e))?;
        for uri in uris {
            if let Err(e) = self.stage_one(uri, directory) {
                warn!("failed staging {}: {}", uri.value, e);
            }
        }
        Ok(())
    }

    fn stage_one(&self, uri: &UriSpec, directory: &Path) -> Result<(), Error> {
        let basename = basename_of(&uri.value).ok_or_else(|| {
            Error::Io(directory.to_path_buf(), std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty uri basename"))
        })?;
        let dest = directory.join(basename);
        let argv = fetch_argv(&uri.value, &dest);
        let status = self.exec.run(&argv).map_err(|e| Error::Io(dest.clone(), e))?;
        if !status.success() {
            return Err(Error::Io(
                dest,
                std::io::Error::new(std::io::ErrorKind::Other, format!("fetch exited with {}", status)),
            ));
        }

        if uri.executable {
            set_executable(&dest).map_err(|e| Error::Io(dest.clone(), e))?;
        }

        if uri.extract && self.optimistic_unpack {
            if let Some(argv) = unpack_argv(&uri.value, &dest, directory) {
                if self.exec.run(&argv).map_err(|e| Error::Io(dest.clone(), e))?.success() {
                    let _ = fs::remove_file(&dest);
                }
            }
        }
        Ok(())
    }
}

fn basename_of(uri: &str) -> Option<&str> {
    let name = uri.rsplit('/').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn scheme_of(uri: &str) -> &str {
    uri.split("://").next().unwrap_or("")
}

fn fetch_argv(uri: &str, dest: &Path) -> Vec<String> {
    let dest = dest.to_string_lossy().into_owned();
    match scheme_of(uri) {
        "s3" => vec!["aws".into(), "s3".into(), "cp".into(), uri.into(), dest],
        "hdfs" => vec!["hadoop".into(), "fs".into(), "-get".into(), uri.into(), dest],
        _ => vec!["curl".into(), "-sSfL".into(), uri.into(), "--output".into(), dest],
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Detect a known archive suffix and build the argv to unpack `dest` into
/// `directory`. `None` if the URI doesn't look like an archive.
fn unpack_argv(uri: &str, dest: &Path, directory: &Path) -> Option<Vec<String>> {
    let lower = uri.to_lowercase();
    let dest = dest.to_string_lossy().into_owned();
    let directory = directory.to_string_lossy().into_owned();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        Some(vec!["tar".into(), "-C".into(), directory, "-xzf".into(), dest])
    } else if lower.ends_with(".tar.bz2") {
        Some(vec!["tar".into(), "-C".into(), directory, "-xjf".into(), dest])
    } else if lower.ends_with(".tar.xz") {
        Some(vec!["tar".into(), "-C".into(), directory, "-xJf".into(), dest])
    } else if lower.ends_with(".zip") {
        Some(vec!["unzip".into(), "-o".into(), "-d".into(), directory, dest])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::{
        process::ExitStatus,
        sync::{Arc, Mutex},
    };
    use tempfile::TempDir;

    #[derive(Clone, Debug)]
    struct RecordingExec {
        calls: Arc<Mutex<Vec<Vec<String>>>>,
        scripted: &'static str,
    }

    impl ExecCommand for RecordingExec {
        fn run(&self, argv: &[String]) -> std::io::Result<ExitStatus> {
            self.calls.lock().unwrap().push(argv.to_vec());
            Command::new(which::which(self.scripted).unwrap()).status()
        }
    }

    #[test]
    fn stages_a_plain_uri() -> Result<()> {
        let dir = TempDir::new()?;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let exec = Box::new(RecordingExec {
            calls: calls.clone(),
            scripted: "true",
        });
        let stager = Stager::with_exec(exec, false);
        let uris = vec![UriSpec {
            value: "http://example.com/run.sh".into(),
            executable: true,
            extract: false,
        }];
        stager.stage(&uris, dir.path())?;
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(calls.lock().unwrap()[0][0], "curl");
        Ok(())
    }

    #[test]
    fn a_failing_uri_does_not_abort_the_batch() -> Result<()> {
        let dir = TempDir::new()?;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let exec = Box::new(RecordingExec {
            calls: calls.clone(),
            scripted: "false",
        });
        let stager = Stager::with_exec(exec, false);
        let uris = vec![UriSpec {
            value: "http://example.com/a.tar.gz".into(),
            executable: false,
            extract: true,
        }];
        stager.stage(&uris, dir.path())?;
        Ok(())
    }

    #[test]
    fn detects_known_archive_suffixes() {
        let dest = PathBuf::from("/tmp/x/a.tar.gz");
        let dir = PathBuf::from("/tmp/x");
        assert!(unpack_argv("http://h/a.tar.gz", &dest, &dir).is_some());
        assert!(unpack_argv("http://h/a.tgz", &dest, &dir).is_some());
        assert!(unpack_argv("http://h/a.zip", &dest, &dir).is_some());
        assert!(unpack_argv("http://h/a.bin", &dest, &dir).is_none());
    }

    #[test]
    fn picks_transport_by_scheme() {
        let dest = PathBuf::from("/tmp/x/a");
        assert_eq!(fetch_argv("s3://bucket/a", &dest)[0], "aws");
        assert_eq!(fetch_argv("hdfs://nn/a", &dest)[0], "hadoop");
        assert_eq!(fetch_argv("http://h/a", &dest)[0], "curl");
    }
}
