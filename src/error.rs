//! Error types and error handling strategy for the runtime.
//!
//! Errors are explicit and typed; nothing in the engine paths panics on a
//! recoverable condition. Every kind carries a category for grouping and a
//! [`Recoverability`] classification so callers (in particular the lock
//! admission retry path) can decide whether to re-submit.
//!
//! # Error Categories
//!
//! - **Ordering**: ticket allocation and serving-order violations
//! - **Ownership**: DAG structure errors (unknown contexts, cycles)
//! - **Locking**: dominator admission and grant errors
//! - **Context**: event engine and migration errors
//! - **Mapping**: context-to-node directory errors
//! - **Elasticity**: rule configuration and evaluation errors
//! - **Codec**: wire encoding/decoding errors
//! - **Internal**: runtime bugs and invalid states

use core::fmt;
use std::sync::Arc;

use crate::types::{ContextName, OrderId};

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Ordering ===
    /// A ticket was observed out of allocation order.
    TicketOutOfOrder,
    /// A serving pointer cannot advance (stalled behind a skip gap).
    ServingStalled,
    /// Waited past the configured gate timeout.
    GateTimeout,

    // === Ownership ===
    /// Context is not present in the ownership structure.
    UnknownContext,
    /// A requested ownership edit would introduce a cycle.
    WouldCycle,
    /// Edge to add already exists, or edge to remove does not.
    NoSuchEdge,

    // === Locking ===
    /// The DAG version stamped on a request is older than the current one.
    StaleVersion,
    /// A release arrived for a lock the event does not hold.
    NotHeld,
    /// A lock request was submitted twice for the same event and context.
    DuplicateRequest,

    // === Context engine ===
    /// The context has been migrated away or destroyed.
    ContextGone,
    /// An event state transition violated the lifecycle machine.
    InvalidStateTransition,
    /// A snapshot for the requested version is not available.
    SnapshotMissing,

    // === Mapping ===
    /// No node is recorded for the context.
    Unmapped,

    // === Elasticity ===
    /// A rule or condition failed validation.
    InvalidRule,

    // === Codec ===
    /// Payload could not be decoded.
    DecodeFailed,
    /// Payload could not be encoded.
    EncodeFailed,

    // === Internal ===
    /// Internal runtime error (bug).
    Internal,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::TicketOutOfOrder | Self::ServingStalled | Self::GateTimeout => {
                ErrorCategory::Ordering
            }
            Self::UnknownContext | Self::WouldCycle | Self::NoSuchEdge => ErrorCategory::Ownership,
            Self::StaleVersion | Self::NotHeld | Self::DuplicateRequest => ErrorCategory::Locking,
            Self::ContextGone | Self::InvalidStateTransition | Self::SnapshotMissing => {
                ErrorCategory::Context
            }
            Self::Unmapped => ErrorCategory::Mapping,
            Self::InvalidRule => ErrorCategory::Elasticity,
            Self::DecodeFailed | Self::EncodeFailed => ErrorCategory::Codec,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Returns the recoverability classification for this error kind.
    ///
    /// `StaleVersion` is the load-bearing transient: lock admission stamps
    /// every request with the DAG version it was computed against, and a
    /// stale stamp means recompute the dominator and resubmit.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            Self::StaleVersion | Self::GateTimeout | Self::SnapshotMissing => {
                Recoverability::Transient
            }
            Self::TicketOutOfOrder
            | Self::WouldCycle
            | Self::NoSuchEdge
            | Self::NotHeld
            | Self::DuplicateRequest
            | Self::InvalidStateTransition
            | Self::InvalidRule
            | Self::DecodeFailed
            | Self::EncodeFailed
            | Self::Internal => Recoverability::Permanent,
            Self::ServingStalled | Self::UnknownContext | Self::ContextGone | Self::Unmapped => {
                Recoverability::Unknown
            }
        }
    }

    /// Returns true if this error is typically retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.recoverability(), Recoverability::Transient)
    }
}

/// Classification of error recoverability for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Temporary failure that may succeed on retry.
    Transient,
    /// Permanent failure that will not succeed on retry.
    Permanent,
    /// Recoverability depends on context and cannot be determined
    /// from the error kind alone.
    Unknown,
}

impl Recoverability {
    /// Returns true if this error is safe to retry.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Returns true if this error should never be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent)
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Ticket allocation and serving-order failures.
    Ordering,
    /// Ownership structure failures.
    Ownership,
    /// Dominator lock admission failures.
    Locking,
    /// Event engine failures.
    Context,
    /// Context-to-node directory failures.
    Mapping,
    /// Elasticity rule failures.
    Elasticity,
    /// Wire codec failures.
    Codec,
    /// Internal runtime errors.
    Internal,
}

/// Diagnostic context for an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// The context involved in the error.
    pub context: Option<ContextName>,
    /// The event involved in the error.
    pub event: Option<OrderId>,
}

/// The main error type for runtime operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    context: ErrorContext,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
            context: ErrorContext {
                context: None,
                event: None,
            },
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the recoverability classification.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        self.kind.recoverability()
    }

    /// Returns true if this error is typically retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Attaches the context the error refers to.
    #[must_use]
    pub fn in_context(mut self, name: ContextName) -> Self {
        self.context.context = Some(name);
        self
    }

    /// Attaches the event the error refers to.
    #[must_use]
    pub fn for_event(mut self, event: OrderId) -> Self {
        self.context.event = Some(event);
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the error context.
    #[must_use]
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Creates an unknown-context error.
    #[must_use]
    pub fn unknown_context(name: &ContextName) -> Self {
        Self::new(ErrorKind::UnknownContext)
            .with_message(format!("context not in ownership structure: {name}"))
            .in_context(name.clone())
    }

    /// Creates a stale-version error with both versions recorded.
    #[must_use]
    pub fn stale_version(stamped: u64, current: u64) -> Self {
        Self::new(ErrorKind::StaleVersion)
            .with_message(format!("request stamped v{stamped}, structure at v{current}"))
    }

    /// Creates an internal error (runtime bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context message on error.
    fn context(self, msg: impl Into<String>) -> Result<T>;
    /// Attach a context message computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_message(msg))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_message(f()))
    }
}

/// A specialized Result type for runtime operations.
pub type Result<T> = core::result::Result<T, Error>;
