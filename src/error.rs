use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WalError>;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL page {0} is broken")]
    PageBroken(u64),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("invalid WAL segment file name: {0}")]
    InvalidName(String),
    #[error("background task '{0}' cannot be stopped within the shutdown timeout")]
    ShutdownTimeout(String),
    #[error("flush task was interrupted before completion")]
    Interrupted,
}
