//! Error taxonomy.
//!
//! Inside the engine, control-flow faults travel as [`Panic`] through
//! `Result` propagation; the embedding API maps them to [`Error`] at
//! the top level. Host `panic!` is reserved for interpreter bugs.

use std::fmt;

use thiserror::Error;

use crate::value::Value;

/// A fault raised by the engine itself, mirroring the source
/// language's runtime errors (index out of range, nil dereference,
/// divide by zero, slice bounds, failed assertions).
#[derive(Debug, Clone, Error)]
#[error("runtime error: {0}")]
pub struct RuntimeError(pub String);

/// A bare string error used for top-level reporting.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct PlainError(pub String);

/// The in-flight panic kinds. `recover` hands the payload back to the
/// program with its kind preserved.
#[derive(Debug, Clone)]
pub enum Panic {
    /// The program called `panic(v)`.
    Target(Value),
    Runtime(RuntimeError),
    Plain(PlainError),
    /// The program called `os.Exit(code)`; unwinds through defers and
    /// is caught by `run`.
    Exit(i32),
}

impl Panic {
    pub fn runtime(msg: impl Into<String>) -> Panic {
        Panic::Runtime(RuntimeError(msg.into()))
    }

    pub fn plain(msg: impl Into<String>) -> Panic {
        Panic::Plain(PlainError(msg.into()))
    }
}

impl fmt::Display for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Panic::Target(v) => write!(f, "{}", v),
            Panic::Runtime(e) => write!(f, "{}", e),
            Panic::Plain(e) => write!(f, "{}", e),
            Panic::Exit(code) => write!(f, "exit status {}", code),
        }
    }
}

pub type EvalResult<T> = Result<T, Panic>;

/// What the embedding API reports.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no function {0}")]
    NoFunction(String),
    #[error("{0}")]
    Runtime(RuntimeError),
    #[error("{0}")]
    Plain(PlainError),
    /// An uncaught target panic; displays the panic payload.
    #[error("{0}")]
    Panic(Value),
    #[error("init error: {0}")]
    Init(Box<Error>),
}

impl Error {
    /// Top-level mapping from an in-flight panic. `Exit` is handled by
    /// the caller before this point.
    pub(crate) fn from_panic(p: Panic) -> Error {
        match p {
            Panic::Target(v) => Error::Panic(v),
            Panic::Runtime(e) => Error::Runtime(e),
            Panic::Plain(e) => Error::Plain(e),
            Panic::Exit(code) => Error::Plain(PlainError(format!("exit status {}", code))),
        }
    }
}
