use std::process::ExitStatus;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to run the runtime binary: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("runtime cli exited {status}: argv={argv:?} stderr={stderr}")]
    CliFailure {
        argv: Vec<String>,
        status: ExitStatus,
        stderr: String,
    },

    #[error("malformed inspect output: {0:?}")]
    MalformedInspect(String),

    #[error("failed to parse image inspect json: {0}")]
    ImageInfo(#[from] serde_json::Error),

    #[error("timed out waiting for container to appear")]
    AwaitTimeout,
}
