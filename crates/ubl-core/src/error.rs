// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! Comprehensive error catalog for the ledger core.
//!
//! Errors are values: every fallible operation returns a [`LedgerError`]
//! carrying a stable [`ErrorKind`], a human-readable message, and an
//! optional structured details map. Adapters raise their own errors, which
//! the core wraps and classifies before returning.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Convenience alias used across the workspace.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// The only error categories the core raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Optimistic-version precondition failed; re-read and retry.
    ConcurrencyConflict,
    /// Hash linkage verification failed. Fatal; halts appends until reviewed.
    ChainBroken,
    /// Malformed event input (missing fields, unsupported actor tag).
    InvalidEvent,
    /// A domain invariant would be violated by the requested change.
    InvariantViolation,
    /// The authorization engine denied the request.
    Unauthorized,
    /// Workflow transition guards did not pass.
    GuardsFailed,
    /// No transition matches the requested name/current-state pair.
    InvalidTransition,
    /// Attempted transition on a terminated workflow instance.
    WorkflowComplete,
    /// The referenced aggregate has no events.
    NotFound,
    /// Rate-limit gate refused the request; includes retry-after.
    RateLimited,
    /// Quota gate refused the request.
    QuotaExceeded,
    /// A policy's `Deny` effect applied.
    PolicyDenied,
    /// A saga or awaited operation timed out.
    Timeout,
    /// Saga compensation itself failed.
    CompensationFailed,
    /// An unexpected internal failure (I/O, serialization, channels).
    Internal,
}

impl ErrorKind {
    /// Stable wire code for this kind (`SCREAMING_SNAKE_CASE`).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
            Self::ChainBroken => "CHAIN_BROKEN",
            Self::InvalidEvent => "INVALID_EVENT",
            Self::InvariantViolation => "INVARIANT_VIOLATION",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::GuardsFailed => "GUARDS_FAILED",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::WorkflowComplete => "WORKFLOW_COMPLETE",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::Timeout => "TIMEOUT",
            Self::CompensationFailed => "COMPENSATION_FAILED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether a caller may retry after re-reading state.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict | Self::Timeout)
    }

    /// Whether the error is fatal and operator-only.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ChainBroken)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A typed ledger error: kind, message, and optional structured details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, thiserror::Error)]
#[error("{}: {}", kind.code(), message)]
pub struct LedgerError {
    /// Stable category.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Structured context (failed guard names, retry-after, sequences, …).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl LedgerError {
    /// Create an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    /// Attach a structured detail, consuming and returning `self`.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Read a structured detail by key.
    #[must_use]
    pub fn detail(&self, key: &str) -> Option<&serde_json::Value> {
        self.details.get(key)
    }

    /// The error's stable wire code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Whether a caller may retry after re-reading state.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }

    /// Constructor for [`ErrorKind::ConcurrencyConflict`].
    #[must_use]
    pub fn concurrency_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConcurrencyConflict, message)
    }

    /// Constructor for [`ErrorKind::ChainBroken`].
    #[must_use]
    pub fn chain_broken(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ChainBroken, message)
    }

    /// Constructor for [`ErrorKind::InvalidEvent`].
    #[must_use]
    pub fn invalid_event(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidEvent, message)
    }

    /// Constructor for [`ErrorKind::InvariantViolation`].
    #[must_use]
    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvariantViolation, message)
    }

    /// Constructor for [`ErrorKind::Unauthorized`].
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// Constructor for [`ErrorKind::NotFound`].
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Constructor for [`ErrorKind::Internal`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Constructor for [`ErrorKind::Timeout`].
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        Self::internal(format!("json: {e}"))
    }
}
