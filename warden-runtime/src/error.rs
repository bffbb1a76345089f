//! # Runtime Errors
//!
//! Every fallible runtime operation reports a [`WardenError`]: a kind, a
//! message, an optional free-text context and zero or more remediation
//! suggestions. The named constructors below fix the message and
//! suggestions for each failure the runtime can raise, so call sites stay
//! uniform.
//!
//! ## Propagation
//!
//! - Allocator and shared-cell operations fail synchronously to the caller.
//! - Pool dispatch fails synchronously when no worker can accept a task.
//! - A task's own failure surfaces only through its [`TaskHandle`].
//!
//! [`TaskHandle`]: crate::pool::TaskHandle

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;

/// Result alias used across the runtime.
pub type Result<T> = std::result::Result<T, WardenError>;

/// Broad classification of a runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Allocation limits, allocation failure, bounds and liveness violations.
    Memory,
    /// Pool admission, deadlock risk, task failure and shutdown.
    Runtime,
    /// Caller supplied inconsistent arguments.
    InvalidArgument,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Memory => "memory",
            ErrorKind::Runtime => "runtime",
            ErrorKind::InvalidArgument => "invalid argument",
        };
        f.write_str(name)
    }
}

/// Error raised by runtime operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct WardenError {
    kind: ErrorKind,
    message: String,
    context: Option<String>,
    suggestions: Vec<String>,
}

impl WardenError {
    /// Create an error with no context or suggestions.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
            suggestions: Vec::new(),
        }
    }

    /// Attach a free-text context describing where the error arose.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Append a remediation suggestion.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// The error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The error message, without the kind prefix.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The context label, if any.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Remediation suggestions, in the order they were added.
    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    /// Returns true for [`ErrorKind::Memory`] errors.
    pub fn is_memory(&self) -> bool {
        self.kind == ErrorKind::Memory
    }

    /// Returns true for [`ErrorKind::Runtime`] errors.
    pub fn is_runtime(&self) -> bool {
        self.kind == ErrorKind::Runtime
    }

    // ========================================================================
    // Memory errors
    // ========================================================================

    /// A single allocation larger than the configured limit.
    pub fn allocation_too_large(requested: usize, limit: usize) -> Self {
        Self::new(
            ErrorKind::Memory,
            format!(
                "allocation size exceeds safety limit ({} bytes requested, limit {})",
                requested, limit
            ),
        )
        .with_context("memory allocation safety check")
        .with_suggestion("Reduce allocation size")
        .with_suggestion("Use streaming or chunked processing")
    }

    /// The system allocator returned null.
    pub fn allocation_failed(bytes: usize) -> Self {
        Self::new(
            ErrorKind::Memory,
            format!("memory allocation failed ({} bytes)", bytes),
        )
        .with_context("memory allocation")
    }

    /// Element access outside a handle's range.
    pub fn out_of_bounds(index: usize, len: usize) -> Self {
        Self::new(
            ErrorKind::Memory,
            format!("array access out of bounds (index {}, length {})", index, len),
        )
        .with_context("boundary-guarded handle access")
        .with_suggestion("Check array size before accessing")
        .with_suggestion("Use try_index() for checked access without an error")
    }

    /// Access through a handle whose block was deallocated.
    pub fn use_after_free(address: usize) -> Self {
        Self::new(
            ErrorKind::Memory,
            format!("access to a deallocated block at {:#x}", address),
        )
        .with_context("handle liveness check")
        .with_suggestion("Do not use a handle after deallocating it")
    }

    /// An alignment that is not a power of two.
    pub fn invalid_alignment(align: usize) -> Self {
        Self::new(
            ErrorKind::InvalidArgument,
            format!("alignment {} is not a power of two", align),
        )
    }

    // ========================================================================
    // Runtime errors
    // ========================================================================

    /// No worker could accept a submitted task.
    pub fn workers_overwhelmed() -> Self {
        Self::new(
            ErrorKind::Runtime,
            "all workers are overwhelmed and need rest",
        )
        .with_context("task dispatch")
        .with_suggestion("Reduce task submission rate")
        .with_suggestion("Wait for workers to complete their wellness breaks")
    }

    /// A specific worker refused assignment because it needs a break.
    pub fn assignment_refused(worker: usize) -> Self {
        Self::new(
            ErrorKind::Runtime,
            format!("could not assign task, worker {} needs a wellness break", worker),
        )
        .with_suggestion("Retry after a short delay")
    }

    /// A lock acquisition that would violate lock ordering.
    pub fn potential_deadlock(lock: &str) -> Self {
        Self::new(
            ErrorKind::Runtime,
            format!("potential deadlock detected for lock: {}", lock),
        )
        .with_context("deadlock prevention")
        .with_suggestion("Review lock acquisition order")
        .with_suggestion("Consider using try_lock with timeout")
    }

    /// A task panicked; the panic was caught by its worker.
    pub fn task_panicked(message: &str) -> Self {
        Self::new(ErrorKind::Runtime, format!("task panicked: {}", message))
            .with_context("worker task isolation")
    }

    /// A queued task was dropped before it ran.
    pub fn task_discarded() -> Self {
        Self::new(
            ErrorKind::Runtime,
            "task was discarded before it ran (pool shut down)",
        )
    }

    /// The runtime or pool has already been shut down.
    pub fn shut_down() -> Self {
        Self::new(ErrorKind::Runtime, "runtime has been shut down")
    }

    /// A worker thread could not be spawned.
    pub fn spawn_failed(what: &str, source: &std::io::Error) -> Self {
        Self::new(
            ErrorKind::Runtime,
            format!("failed to spawn {}: {}", what, source),
        )
    }

    // ========================================================================
    // Argument errors
    // ========================================================================

    /// Slices passed to a numeric kernel have inconsistent lengths.
    pub fn length_mismatch(operation: &str, expected: usize, actual: usize) -> Self {
        Self::new(
            ErrorKind::InvalidArgument,
            format!(
                "{}: expected length {}, got {}",
                operation, expected, actual
            ),
        )
    }
}

impl From<ConfigError> for WardenError {
    fn from(err: ConfigError) -> Self {
        Self::new(ErrorKind::InvalidArgument, err.to_string())
            .with_context("runtime configuration")
    }
}
