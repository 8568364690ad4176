use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Cinder errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The store has been closed; no further operations are possible.
    Closed,
    /// A structural invariant of the on-disk state does not hold, e.g. the
    /// map file names the same block twice. Fatal to the affected store.
    Corruption(String),
    /// Invalid caller input, typically a payload or size of the wrong length.
    InvalidInput(String),
    /// An IO error.
    IO(String),
    /// The requested reference is not present in the store.
    NotFound,
    /// No free slot is left for a new block.
    OutOfSpace,
    /// No backend is registered under the requested kind.
    UnknownBackend(String),
    /// A store replacement was attempted across different backend kinds.
    WrongBackend(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Closed => write!(f, "store is closed"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NotFound => write!(f, "block not found"),
            Error::OutOfSpace => write!(f, "out of space"),
            Error::UnknownBackend(kind) => write!(f, "unknown backend kind: {kind}"),
            Error::WrongBackend(msg) => write!(f, "wrong backend: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A cinder Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

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
