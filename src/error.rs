use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// SiltDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A capacity limit was hit: a full memtable slot reservation, a full
    /// tombstone budget, a full level, or the configured level budget.
    Capacity(String),
    /// Invalid data, typically decoding errors, corruption, or unexpected
    /// internal values such as an unsorted merge input.
    InvalidData(String),
    /// Invalid user input, typically malformed configuration or query bounds.
    InvalidInput(String),
    /// An operation that the configured policy does not permit, e.g.
    /// `delete_record` on a tree using tombstone deletes.
    InvalidOperation(String),
    /// A persisted run file failed checksum verification.
    ChecksumMismatch(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Capacity(msg) => write!(f, "capacity exhausted: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::InvalidOperation(msg) => write!(f, "invalid operation: {msg}"),
            Error::ChecksumMismatch(msg) => write!(f, "checksum mismatch: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)) };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)) };
}

/// A SiltDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
