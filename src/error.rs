use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// emberdb errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// An IO error from the run writer or metadata-log file operations.
    Io(String),
    /// Invalid data, typically decoding errors, corruption, or unexpected internal values.
    InvalidData(String),
    /// An operation was attempted on an object in the wrong state.
    InvalidOperation(String),
    /// A metadata-log transaction failed to commit. The commit is the
    /// linearisation point for structural changes, so in-memory state is
    /// left untouched when this is returned.
    LogCommitFailed(String),
    /// The write iterator failed while merging its sources.
    WriteIterator(String),
    /// The coordinator failed to process a batch of deferred DELETEs.
    DeferredDelete(String),
    /// The task was cancelled.
    Cancelled,
    /// An artificial failure armed through the error-injection knobs.
    Injected(String),
    /// The LSM tree was dropped while a task was in flight. Benign, never
    /// surfaced to the user.
    LsmDropped,
    /// A write was attempted on a sealed memtable or other read-only structure.
    ReadOnly,
    /// The scheduler is throttled after repeated background task failures.
    Throttled(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidOperation(msg) => write!(f, "invalid operation: {msg}"),
            Error::LogCommitFailed(msg) => write!(f, "metadata log commit failed: {msg}"),
            Error::WriteIterator(msg) => write!(f, "write iterator failed: {msg}"),
            Error::DeferredDelete(msg) => write!(f, "deferred delete failed: {msg}"),
            Error::Cancelled => write!(f, "task cancelled"),
            Error::Injected(msg) => write!(f, "error injection: {msg}"),
            Error::LsmDropped => write!(f, "lsm tree dropped"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::Throttled(msg) => write!(f, "scheduler is throttled: {msg}"),
        }
    }
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}
