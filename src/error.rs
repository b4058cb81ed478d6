use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{} is not a file or a directory", .0.display())]
    InvalidSource(PathBuf),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("duplicate item name: {0}")]
    DuplicateName(String),
    #[error("key {0} not found")]
    KeyNotFound(String),
    #[error("index {index} out of range for {len} boxes")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },
    #[error("model {0} is not supported")]
    UnsupportedModel(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub(crate) fn decode(what: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            what,
            reason: reason.to_string(),
        }
    }
}
