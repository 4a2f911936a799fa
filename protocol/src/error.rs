use std::io;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;

use crate::ids::RequestId;
use crate::ids::SessionId;
use crate::model::RequestStatus;

pub type Result<T> = std::result::Result<T, SlbErr>;

/// Coarse error taxonomy. Drivers branch on this rather than matching the
/// full [`SlbErr`] payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    SessionNotFound,
    SessionInactive,
    SessionProgramMismatch,
    AgentBlocked,
    RateLimited,
    AlreadyReviewed,
    StatusConflict,
    Expired,
    ParseError,
    ExceedsMaxSize,
    Toctou,
    SubprocessFailed,
    Timeout,
    NotFound,
    Io,
    Internal,
}

#[derive(Error, Debug)]
pub enum SlbErr {
    #[error("{field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session {0} has ended")]
    SessionInactive(SessionId),

    #[error("session {id} was started by `{expected}`, not `{got}`")]
    SessionProgramMismatch {
        id: SessionId,
        expected: String,
        got: String,
    },

    #[error("agent `{0}` is blocked from creating requests")]
    AgentBlocked(String),

    #[error(
        "rate limited: {pending}/{max_pending} pending, {recent}/{max_per_minute} in the last minute, resets at {reset_at}"
    )]
    RateLimited {
        pending: u32,
        max_pending: u32,
        recent: u32,
        max_per_minute: u32,
        reset_at: DateTime<Utc>,
    },

    #[error("session {reviewer} already reviewed request {request}")]
    AlreadyReviewed {
        request: RequestId,
        reviewer: SessionId,
    },

    /// A compare-and-set status transition lost the race; carries the status
    /// the loser observed.
    #[error("request status is {current}")]
    StatusConflict { current: RequestStatus },

    #[error("request {0} expired")]
    Expired(RequestId),

    #[error("failed to parse command: {0}")]
    ParseError(String),

    #[error("capture size {observed} bytes exceeds limit of {limit} bytes")]
    ExceedsMaxSize { limit: u64, observed: u64 },

    #[error("file changed while being captured: {path}")]
    Toctou { path: PathBuf },

    #[error("{op}: {detail}")]
    SubprocessFailed { op: String, detail: String },

    #[error("{op} timed out")]
    Timeout { op: String },

    #[error("not found")]
    NotFound,

    #[error("{op}: {source}")]
    Io {
        op: String,
        #[source]
        source: io::Error,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl SlbErr {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SlbErr::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an I/O error with the name of the operation and the path or
    /// command it was acting on.
    pub fn io(op: impl Into<String>, source: io::Error) -> Self {
        SlbErr::Io {
            op: op.into(),
            source,
        }
    }

    pub fn subprocess(op: impl Into<String>, detail: impl Into<String>) -> Self {
        SlbErr::SubprocessFailed {
            op: op.into(),
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SlbErr::Validation { .. } => ErrorKind::Validation,
            SlbErr::SessionNotFound(_) => ErrorKind::SessionNotFound,
            SlbErr::SessionInactive(_) => ErrorKind::SessionInactive,
            SlbErr::SessionProgramMismatch { .. } => ErrorKind::SessionProgramMismatch,
            SlbErr::AgentBlocked(_) => ErrorKind::AgentBlocked,
            SlbErr::RateLimited { .. } => ErrorKind::RateLimited,
            SlbErr::AlreadyReviewed { .. } => ErrorKind::AlreadyReviewed,
            SlbErr::StatusConflict { .. } => ErrorKind::StatusConflict,
            SlbErr::Expired(_) => ErrorKind::Expired,
            SlbErr::ParseError(_) => ErrorKind::ParseError,
            SlbErr::ExceedsMaxSize { .. } => ErrorKind::ExceedsMaxSize,
            SlbErr::Toctou { .. } => ErrorKind::Toctou,
            SlbErr::SubprocessFailed { .. } => ErrorKind::SubprocessFailed,
            SlbErr::Timeout { .. } => ErrorKind::Timeout,
            SlbErr::NotFound => ErrorKind::NotFound,
            SlbErr::Io { .. } => ErrorKind::Io,
            SlbErr::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller can reasonably retry or re-prompt after this error.
    /// Fatal kinds abort the current operation but leave the store
    /// consistent.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation
                | ErrorKind::RateLimited
                | ErrorKind::AlreadyReviewed
                | ErrorKind::Expired
                | ErrorKind::StatusConflict
                | ErrorKind::SessionInactive
        )
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn rate_limited_message_carries_the_numbers() {
        let err = SlbErr::RateLimited {
            pending: 5,
            max_pending: 5,
            recent: 2,
            max_per_minute: 10,
            reset_at: "2026-01-01T00:01:00Z".parse().unwrap(),
        };
        let msg = err.to_string();
        assert!(msg.contains("5/5 pending"), "{msg}");
        assert!(msg.contains("2/10"), "{msg}");
        assert!(err.is_recoverable());
    }

    #[test]
    fn io_errors_are_fatal_but_carry_the_operation() {
        let err = SlbErr::io(
            "open rollback manifest",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(!err.is_recoverable());
        assert!(err.to_string().starts_with("open rollback manifest"));
    }
}
