use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use thiserror::Error;

use crate::session::ConnectionId;

#[derive(Debug, Error)]
pub enum WebDbError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("conversion error: {0}")]
    Conversion(String),
    #[error("unknown error: {0}")]
    Unknown(String),
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),
    #[error("maximum number of connections reached ({0})")]
    ConnectionLimit(usize),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification reported to hosts alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    Execution,
    Conversion,
    Unknown,
    NotFound,
}

impl WebDbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WebDbError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            WebDbError::Execution(_) | WebDbError::ConnectionLimit(_) => ErrorKind::Execution,
            WebDbError::Conversion(_) => ErrorKind::Conversion,
            WebDbError::Unknown(_) | WebDbError::Io(_) => ErrorKind::Unknown,
            WebDbError::ConnectionNotFound(_) => ErrorKind::NotFound,
        }
    }

    pub(crate) fn worker_gone() -> Self {
        WebDbError::Execution("connection worker is no longer running".to_string())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Execution => "execution",
            ErrorKind::Conversion => "conversion",
            ErrorKind::Unknown => "unknown",
            ErrorKind::NotFound => "not_found",
        };
        f.write_str(name)
    }
}

impl From<duckdb::Error> for WebDbError {
    fn from(err: duckdb::Error) -> Self {
        WebDbError::Execution(err.to_string())
    }
}

impl From<arrow_schema::ArrowError> for WebDbError {
    fn from(err: arrow_schema::ArrowError) -> Self {
        WebDbError::Conversion(err.to_string())
    }
}

/// Run `f`, turning a panic into [`WebDbError::Unknown`] so it never unwinds into the host.
pub(crate) fn catch_panics<T>(f: impl FnOnce() -> Result<T, WebDbError>) -> Result<T, WebDbError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(%message, "panic caught at host boundary");
            Err(WebDbError::Unknown(message))
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
