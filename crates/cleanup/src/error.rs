use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error at {0}: {1}")]
    Io(PathBuf, #[source] io::Error),

    #[error(transparent)]
    Lock(#[from] filelock::LockError),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, err: io::Error) -> Self {
        Error::Io(path.into(), err)
    }
}
