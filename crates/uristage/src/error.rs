use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error staging into {0}: {1}")]
    Io(PathBuf, #[source] io::Error),
}
