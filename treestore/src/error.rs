// SPDX-License-Identifier: AGPL-3.0-only

//! The error taxonomy of spec.md §7, implemented by hand in the manner the
//! teacher's `util::error` module uses: a single closed enum, a `Display`
//! impl that renders a human message, and `From` impls at every boundary
//! that produces a foreign error (`io::Error`, lock poisoning, ...).

use std::{fmt, io};

pub type StoreResult<T> = Result<T, Error>;

/// An opaque blob a subscriber can attach to a `CallbackFailed` error so the
/// originator can recover structured diagnostic data (spec.md §6, §7).
pub type ErrorData = Vec<u8>;

#[derive(Debug)]
pub enum Error {
    /// Malformed input, unknown path, type mismatch.
    InvalidArg(String),
    /// Referenced entity absent (module, subscription, anchor node).
    NotFound(String),
    /// Creation collides with an existing node or scheduled operation.
    Exists(String),
    /// Schema-level constraint broken (keys, when, must, type).
    ValidationFailed(String),
    /// POSIX permission check failed.
    Unauthorized(String),
    /// Timeout on a lock acquire.
    Locked(String),
    /// A subscriber returned an error.
    CallbackFailed {
        message: String,
        format_tag: Option<String>,
        data: Option<ErrorData>,
    },
    /// The request is invalid in the current datastore state.
    OperationFailed(String),
    /// Underlying operating-system call failed.
    Sys(io::Error),
    /// Invariant broken; indicates a bug in core or a schema extension.
    Internal(String),
}

impl Error {
    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        Self::InvalidArg(msg.into())
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
    pub fn exists(msg: impl Into<String>) -> Self {
        Self::Exists(msg.into())
    }
    pub fn validation_failed(msg: impl Into<String>) -> Self {
        Self::ValidationFailed(msg.into())
    }
    pub fn locked(msg: impl Into<String>) -> Self {
        Self::Locked(msg.into())
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }
    pub fn callback_failed(message: impl Into<String>) -> Self {
        Self::CallbackFailed {
            message: message.into(),
            format_tag: None,
            data: None,
        }
    }
    pub fn with_error_data(mut self, data: ErrorData) -> Self {
        if let Self::CallbackFailed { data: slot, .. } = &mut self {
            *slot = Some(data);
        }
        self
    }
    /// The error-data blob a `CallbackFailed` carries, if any (spec.md §7).
    pub fn error_data(&self) -> Option<&[u8]> {
        match self {
            Self::CallbackFailed { data, .. } => data.as_deref(),
            _ => None,
        }
    }
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::InvalidArg(_) => "INVALID_ARG",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Exists(_) => "EXISTS",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Locked(_) => "LOCKED",
            Self::CallbackFailed { .. } => "CALLBACK_FAILED",
            Self::OperationFailed(_) => "OPERATION_FAILED",
            Self::Sys(_) => "SYS",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArg(m) => write!(f, "invalid argument: {m}"),
            Self::NotFound(m) => write!(f, "not found: {m}"),
            Self::Exists(m) => write!(f, "already exists: {m}"),
            Self::ValidationFailed(m) => write!(f, "validation failed: {m}"),
            Self::Unauthorized(m) => write!(f, "unauthorized: {m}"),
            Self::Locked(m) => write!(f, "lock timed out: {m}"),
            Self::CallbackFailed { message, .. } => write!(f, "subscriber callback failed: {message}"),
            Self::OperationFailed(m) => write!(f, "operation failed: {m}"),
            Self::Sys(e) => write!(f, "system error: {e}"),
            Self::Internal(m) => write!(f, "internal error (this is a bug): {m}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sys(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Sys(e)
    }
}

/// Produced when a scoped lock guard observes the lock's owning process is
/// gone (spec.md §4.D "Recovery"); not itself fatal, callers decide.
#[derive(Debug)]
pub struct PoisonRecoveryError(pub String);

impl From<PoisonRecoveryError> for Error {
    fn from(e: PoisonRecoveryError) -> Self {
        Self::Internal(format!("recovered a poisoned lock: {}", e.0))
    }
}
