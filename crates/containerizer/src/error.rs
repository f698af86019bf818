use std::{io, path::PathBuf};

use thiserror::Error;

/// Composes every leaf crate's error into one type carrying the exit-code
/// classification the `cli` crate needs (SPEC_FULL.md §7/§12).
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    State(#[from] state::Error),

    #[error(transparent)]
    Runtime(#[from] runtime::Error),

    #[error(transparent)]
    Launchspec(#[from] launchspec::Error),

    #[error(transparent)]
    Uristage(#[from] uristage::Error),

    #[error(transparent)]
    Recordio(#[from] recordio::Error),

    #[error(transparent)]
    Cgroup(#[from] cgroup::Error),

    #[error("i/o error at {0}: {1}")]
    Io(PathBuf, #[source] io::Error),

    #[error("failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("container {0} is not known to this state root")]
    UnknownContainer(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, err: io::Error) -> Self {
        Error::Io(path.into(), err)
    }

    /// The exit code the `cli` crate's `main` should use for this error, per
    /// the classification table in SPEC_FULL.md §7/§12. Everything that
    /// isn't a recognized, well-understood failure mode falls through to the
    /// generic "unhandled" code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::State(state::Error::CidTimeout) => 4,
            Error::State(state::Error::TimestampRetryExhausted(_)) => 4,
            Error::State(state::Error::BadStateInvariant(_)) => 4,
            Error::State(state::Error::Lock(_)) => 4,
            Error::State(state::Error::Io(..)) => 8,

            Error::Runtime(runtime::Error::AwaitTimeout) => 4,
            Error::Runtime(runtime::Error::CliFailure { .. }) => 4,
            Error::Runtime(_) => 8,

            Error::Launchspec(_) => 4,
            Error::Recordio(_) => 4,

            Error::UnknownContainer(_) => 4,

            Error::Uristage(_) => 8,
            Error::Cgroup(_) => 8,
            Error::Io(..) => 8,
            Error::Fork(_) => 8,
        }
    }
}
