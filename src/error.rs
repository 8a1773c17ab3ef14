use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StashError>;

#[derive(Error, Debug)]
pub enum StashError {
    #[error("Not found: {0}")]
    NotFound(PathBuf),

    #[error("Is a directory: {0}")]
    IsDirectory(PathBuf),

    #[error("Already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Bad file descriptor: {0}")]
    BadDescriptor(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
