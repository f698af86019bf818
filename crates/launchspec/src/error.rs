use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("launch record has neither a task command nor an executor command")]
    MissingCommand,

    #[error("{0:?} is not a docker:// image url")]
    InvalidImageUrl(String),
}
