//! Error taxonomy, item metadata, and retry metadata shared across the engine.
//!
//! A `Display`-able kind enum separate from the error payload itself, so
//! callers can branch on classification without matching the whole error.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::sequence::Sequence;

/// High-level classification of a [`StreamError`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    /// Invalid parameter (negative skip, zero batch, zero concurrency).
    /// Always fatal, never retried.
    Validation,
    /// Matches the retryable predicate; retried per policy.
    Transient,
    /// Non-retryable user/domain failure.
    Permanent,
    /// Caused by explicit cancellation; propagated without wrapping and
    /// without triggering retry.
    Cancelled,
    /// Invariant violation (e.g. unexpected ordered-buffer state); aborts
    /// the pipeline with diagnostic context.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{label}")
    }
}

/// A single item's provenance and timing, attached by the error/metrics
/// layer — never by pure operators.
#[derive(Debug, Clone)]
pub struct ItemMetadata {
    /// Name of the step that produced or processed this item.
    pub step_name: Arc<str>,
    /// The item's 0-based ordinal in the step's *input*.
    pub item_index: usize,
    /// Wall-clock time spent processing this item, in milliseconds.
    pub duration_ms: u64,
    /// Stable identifier for the whole pipeline run.
    pub trace_id: Uuid,
    /// Identifier for this specific item, fresh per item.
    pub span_id: Uuid,
}

impl ItemMetadata {
    /// Builds metadata for `item_index` within `step_name`, stamping a fresh
    /// `span_id` and inheriting `trace_id` from the enclosing run.
    #[must_use]
    pub fn new(step_name: impl Into<Arc<str>>, item_index: usize, trace_id: Uuid) -> Self {
        Self {
            step_name: step_name.into(),
            item_index,
            duration_ms: 0,
            trace_id,
            span_id: Uuid::new_v4(),
        }
    }

    /// Returns a copy with `duration_ms` set.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// A fallible item's error, enriched with run and item identifiers.
#[derive(Debug, Clone)]
pub struct StreamError {
    /// Short machine-readable error code (e.g. `"ETIMEDOUT"`, `"VALIDATION"`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// The step that raised or forwarded this error.
    pub step_name: Arc<str>,
    /// The offending item's index, if known.
    pub item_index: Option<usize>,
    /// Whether the retryable predicate classified this error as transient.
    pub retryable: bool,
    /// High-level classification.
    pub kind: ErrorKind,
    /// Stable identifier for the whole pipeline run.
    pub trace_id: Uuid,
    /// Identifier for the item that raised this error, if any.
    pub span_id: Uuid,
    /// The original error, if this one wraps a foreign failure.
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error in step '{}'{}: {}",
            self.kind,
            self.step_name,
            self.item_index_display(),
            self.message
        )
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl StreamError {
    /// Builds a validation error: always fatal, never retried, not tied to a
    /// specific item.
    #[must_use]
    pub fn validation(step_name: impl Into<Arc<str>>, message: impl Into<String>) -> Self {
        Self {
            code: "VALIDATION".to_owned(),
            message: message.into(),
            step_name: step_name.into(),
            item_index: None,
            retryable: false,
            kind: ErrorKind::Validation,
            trace_id: Uuid::nil(),
            span_id: Uuid::nil(),
            cause: None,
        }
    }

    /// Builds an internal error signalling an invariant violation.
    #[must_use]
    pub fn internal(step_name: impl Into<Arc<str>>, message: impl Into<String>) -> Self {
        Self {
            code: "INTERNAL".to_owned(),
            message: message.into(),
            step_name: step_name.into(),
            item_index: None,
            retryable: false,
            kind: ErrorKind::Internal,
            trace_id: Uuid::nil(),
            span_id: Uuid::nil(),
            cause: None,
        }
    }

    /// Builds a cancellation error: propagated without retry.
    #[must_use]
    pub fn cancelled(step_name: impl Into<Arc<str>>) -> Self {
        Self {
            code: "CANCELLED".to_owned(),
            message: "operation cancelled".to_owned(),
            step_name: step_name.into(),
            item_index: None,
            retryable: false,
            kind: ErrorKind::Cancelled,
            trace_id: Uuid::nil(),
            span_id: Uuid::nil(),
            cause: None,
        }
    }

    /// Wraps a foreign error raised by a user closure at `item_index`,
    /// classifying it with the retryable predicate (see [`crate::retry::is_retryable`]).
    #[must_use]
    pub fn from_cause(
        step_name: impl Into<Arc<str>>,
        item_index: usize,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        let message = cause.to_string();
        let retryable = crate::retry::is_retryable(&message, None);
        Self {
            code: if retryable {
                "TRANSIENT".to_owned()
            } else {
                "PERMANENT".to_owned()
            },
            message,
            step_name: step_name.into(),
            item_index: Some(item_index),
            retryable,
            kind: if retryable {
                ErrorKind::Transient
            } else {
                ErrorKind::Permanent
            },
            trace_id: Uuid::nil(),
            span_id: Uuid::nil(),
            cause: Some(Arc::new(cause)),
        }
    }

    /// Returns a copy enriched with the run's `trace_id` and a fresh
    /// per-item `span_id`, if not already set.
    #[must_use]
    pub fn enrich(mut self, trace_id: Uuid) -> Self {
        if self.trace_id.is_nil() {
            self.trace_id = trace_id;
        }
        if self.span_id.is_nil() {
            self.span_id = Uuid::new_v4();
        }
        self
    }

    fn item_index_display(&self) -> String {
        match self.item_index {
            Some(i) => format!(" at item {i}"),
            None => String::new(),
        }
    }
}

/// One retry attempt's outcome, recorded in [`RetryMetadata`].
#[derive(Debug, Clone)]
pub struct RetryAttemptError {
    /// 1-based attempt number.
    pub attempt: usize,
    /// The error observed on this attempt.
    pub error: StreamError,
    /// How long this attempt took, in milliseconds.
    pub duration_ms: u64,
}

/// Aggregate retry outcome for a single item. Maintains the invariant:
/// `attempts >= 1`, `attempts <= max_attempts`, and
/// `attempts == errors.len() + (1 if succeeded else 0)`.
#[derive(Debug, Clone, Default)]
pub struct RetryMetadata {
    /// Total attempts made for this item.
    pub attempts: usize,
    /// Whether the final attempt succeeded.
    pub succeeded: bool,
    /// Total wall-clock time spent across all attempts, in milliseconds.
    pub total_duration_ms: u64,
    /// One entry per failed attempt.
    pub errors: Vec<RetryAttemptError>,
}

impl RetryMetadata {
    /// Asserts the invariant that `attempts == errors.len() + (1 if succeeded else 0)`.
    /// Debug-only; a violation indicates a bug in [`crate::retry::with_retry`].
    #[cfg(debug_assertions)]
    pub(crate) fn assert_consistent(&self) {
        let expected = self.errors.len() + usize::from(self.succeeded);
        debug_assert_eq!(
            self.attempts, expected,
            "retry metadata attempts/errors mismatch"
        );
    }
}

/// A sequence that yields a single fatal error then exhausts.
///
/// Operator constructors that reject an invalid parameter (zero batch size,
/// zero concurrency, zero `max_attempts`) use this instead of panicking or
/// asserting, so the failure surfaces as an ordinary catchable item per the
/// `Validation` error kind's contract rather than unwinding the caller.
pub(crate) struct FailedSequence<T> {
    error: Option<StreamError>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FailedSequence<T> {
    pub(crate) fn new(error: StreamError) -> Self {
        Self {
            error: Some(error),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Send> Sequence<T> for FailedSequence<T> {
    async fn next(&mut self) -> Option<Result<T, StreamError>> {
        self.error.take().map(Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_never_retryable() {
        let err = StreamError::validation("batch", "n must be > 0");
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(!err.retryable);
        assert!(err.item_index.is_none());
    }

    #[test]
    fn from_cause_classifies_using_the_retryable_predicate() {
        let err = StreamError::from_cause(
            "fetch",
            3,
            std::io::Error::new(std::io::ErrorKind::Other, "ETIMEDOUT while connecting"),
        );
        assert!(err.retryable);
        assert_eq!(err.kind, ErrorKind::Transient);
        assert_eq!(err.item_index, Some(3));

        let err = StreamError::from_cause(
            "fetch",
            4,
            std::io::Error::new(std::io::ErrorKind::Other, "invalid payload"),
        );
        assert!(!err.retryable);
        assert_eq!(err.kind, ErrorKind::Permanent);
    }

    #[test]
    fn enrich_only_fills_nil_identifiers() {
        let trace_id = Uuid::new_v4();
        let err = StreamError::validation("step", "bad").enrich(trace_id);
        assert_eq!(err.trace_id, trace_id);
        assert!(!err.span_id.is_nil());

        let already_tagged_trace = Uuid::new_v4();
        let mut err2 = StreamError::validation("step", "bad");
        err2.trace_id = already_tagged_trace;
        let err2 = err2.enrich(trace_id);
        assert_eq!(err2.trace_id, already_tagged_trace);
    }

    #[test]
    fn display_includes_item_index_when_present() {
        let err = StreamError::from_cause("map", 7, std::fmt::Error);
        let rendered = err.to_string();
        assert!(rendered.contains("item 7"));
        assert!(rendered.contains("map"));
    }

    #[test]
    fn retry_metadata_consistency_holds_for_success_and_failure() {
        let mut meta = RetryMetadata {
            attempts: 1,
            succeeded: true,
            total_duration_ms: 5,
            errors: Vec::new(),
        };
        meta.assert_consistent();

        meta.attempts = 2;
        meta.succeeded = false;
        meta.errors.push(RetryAttemptError {
            attempt: 1,
            error: StreamError::validation("s", "x"),
            duration_ms: 1,
        });
        meta.errors.push(RetryAttemptError {
            attempt: 2,
            error: StreamError::validation("s", "x"),
            duration_ms: 1,
        });
        meta.assert_consistent();
    }

    #[tokio::test]
    async fn failed_sequence_yields_its_error_once_then_exhausts() {
        let mut seq: FailedSequence<i32> = FailedSequence::new(StreamError::validation("op", "bad input"));
        assert!(seq.next().await.unwrap().is_err());
        assert!(seq.next().await.is_none());
    }
}
