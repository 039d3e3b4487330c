//! The retryable-error predicate and the per-item `with_retry` operator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::TimeSource;
use crate::error::{RetryAttemptError, RetryMetadata, StreamError};
use crate::sequence::{BoxSeq, Sequence};

const DEFAULT_RETRYABLE_SUBSTRINGS: &[&str] = &[
    "econnreset",
    "etimedout",
    "econnrefused",
    "fetch failed",
    "rate limit",
];

/// Classifies `message` as retryable by case-insensitive substring match.
///
/// When `allow_list` is `Some`, it is authoritative and replaces the
/// built-in substrings entirely — a caller opting into an explicit list of
/// error codes no longer benefits from the default heuristics.
#[must_use]
pub fn is_retryable(message: &str, allow_list: Option<&[&str]>) -> bool {
    let haystack = message.to_lowercase();
    let needles = allow_list.unwrap_or(DEFAULT_RETRYABLE_SUBSTRINGS);
    needles
        .iter()
        .any(|needle| haystack.contains(&needle.to_lowercase()))
}

/// Options controlling [`with_retry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Maximum attempts per item, including the first. Must be `>= 1`.
    pub max_attempts: usize,
    /// Base backoff, in milliseconds. The delay before attempt `k` (1-based,
    /// `k >= 2`) is `backoff_ms * (k - 1)` — a linear ramp, despite the
    /// common "exponential backoff" name for this family of operator.
    pub backoff_ms: u64,
    /// Caller-supplied allow-list of error-code substrings. When set, it
    /// fully replaces the built-in retryable heuristic.
    pub allow_list: Option<Vec<String>>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 100,
            allow_list: None,
        }
    }
}

impl RetryOptions {
    fn allow_list_refs(&self) -> Option<Vec<&str>> {
        self.allow_list
            .as_ref()
            .map(|codes| codes.iter().map(String::as_str).collect())
    }
}

/// Retries a fallible per-item operation with a linear backoff ramp,
/// attaching [`RetryMetadata`] to every output.
///
/// `op` receives a clone of the upstream item and its 0-based index and
/// returns either a transformed value or a boxed error; the item must be
/// `Clone` so a failed attempt can be retried against a fresh copy.
/// Non-retryable errors (or exhausting `max_attempts`) terminate the item
/// with the last-seen error.
pub fn with_retry<T, U, F>(
    upstream: BoxSeq<T>,
    step_name: impl Into<Arc<str>>,
    opts: RetryOptions,
    op: F,
) -> BoxSeq<(U, RetryMetadata)>
where
    T: Send + Clone + 'static,
    U: Send + 'static,
    F: FnMut(T, usize) -> Result<U, Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    with_retry_with_clock(upstream, step_name, opts, op, TimeSource::default())
}

/// As [`with_retry`], but with an injectable [`TimeSource`] for
/// deterministic backoff in tests.
pub fn with_retry_with_clock<T, U, F>(
    upstream: BoxSeq<T>,
    step_name: impl Into<Arc<str>>,
    opts: RetryOptions,
    op: F,
    time_source: TimeSource,
) -> BoxSeq<(U, RetryMetadata)>
where
    T: Send + Clone + 'static,
    U: Send + 'static,
    F: FnMut(T, usize) -> Result<U, Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    if opts.max_attempts == 0 {
        return Box::new(crate::error::FailedSequence::new(StreamError::validation(
            "with_retry",
            "max_attempts must be >= 1",
        )));
    }
    Box::new(WithRetry {
        upstream: Some(upstream),
        step_name: step_name.into(),
        opts,
        op,
        index: 0,
        time_source,
    })
}

struct WithRetry<T, U, F> {
    upstream: Option<BoxSeq<T>>,
    step_name: Arc<str>,
    opts: RetryOptions,
    op: F,
    index: usize,
    time_source: TimeSource,
}

#[async_trait]
impl<T, U, F> Sequence<(U, RetryMetadata)> for WithRetry<T, U, F>
where
    T: Send + Clone + 'static,
    U: Send + 'static,
    F: FnMut(T, usize) -> Result<U, Box<dyn std::error::Error + Send + Sync>> + Send,
{
    async fn next(&mut self) -> Option<Result<(U, RetryMetadata), StreamError>> {
        let upstream = self.upstream.as_mut()?;
        let item = match upstream.next().await? {
            Err(err) => return Some(Err(err)),
            Ok(value) => value,
        };

        let item_index = self.index;
        self.index += 1;
        let allow_list = self.opts.allow_list_refs();

        let mut meta = RetryMetadata::default();
        loop {
            meta.attempts += 1;
            let attempt_started = self.time_source.now();
            let outcome = (self.op)(item.clone(), item_index);
            let attempt_duration_ms = self
                .time_source
                .now()
                .saturating_duration_since(attempt_started)
                .as_millis() as u64;
            meta.total_duration_ms += attempt_duration_ms;

            let cause = match outcome {
                Ok(result) => {
                    meta.succeeded = true;
                    #[cfg(debug_assertions)]
                    meta.assert_consistent();
                    return Some(Ok((result, meta)));
                }
                Err(cause) => cause,
            };

            let message = cause.to_string();
            let retryable = is_retryable(&message, allow_list.as_deref());
            let stream_err = StreamError::from_cause(self.step_name.clone(), item_index, StringError(message));
            meta.errors.push(RetryAttemptError {
                attempt: meta.attempts,
                error: stream_err.clone(),
                duration_ms: attempt_duration_ms,
            });

            if !retryable || meta.attempts >= self.opts.max_attempts {
                meta.succeeded = false;
                #[cfg(debug_assertions)]
                meta.assert_consistent();
                tracing::warn!(
                    step = %self.step_name,
                    item_index,
                    attempts = meta.attempts,
                    retryable,
                    "giving up on item after {} attempt(s): {}",
                    meta.attempts,
                    stream_err.message
                );
                return Some(Err(stream_err));
            }

            let delay_ms = self.opts.backoff_ms * (meta.attempts as u64);
            tracing::debug!(
                step = %self.step_name,
                item_index,
                attempt = meta.attempts,
                delay_ms,
                "retrying item after transient failure"
            );
            self.time_source.sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    async fn cancel(&mut self) {
        if let Some(upstream) = self.upstream.as_mut() {
            upstream.cancel().await;
        }
        self.upstream = None;
    }
}

#[derive(Debug)]
struct StringError(String);

impl std::fmt::Display for StringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StringError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::to_array;
    use crate::sequence::BoxSeq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn default_substrings_match_case_insensitively() {
        assert!(is_retryable("Connection reset: ECONNRESET", None));
        assert!(is_retryable("request timed out (ETIMEDOUT)", None));
        assert!(is_retryable("econnrefused while dialing", None));
        assert!(is_retryable("upstream fetch failed", None));
        assert!(is_retryable("429 rate limit exceeded", None));
        assert!(!is_retryable("invalid json payload", None));
    }

    #[test]
    fn explicit_allow_list_replaces_the_default_heuristic() {
        assert!(!is_retryable("ECONNRESET", Some(&["custom_code"])));
        assert!(is_retryable("custom_code observed", Some(&["custom_code"])));
    }

    #[tokio::test]
    async fn succeeds_on_first_try_with_a_single_attempt_recorded() {
        let upstream: BoxSeq<i32> = crate::source::from_array(vec![10]);
        let seq = with_retry(upstream, "double", RetryOptions::default(), |n, _i| Ok(n * 2));
        let mut seq = seq;
        let (value, meta) = seq.next().await.unwrap().unwrap();
        assert_eq!(value, 20);
        assert_eq!(meta.attempts, 1);
        assert!(meta.succeeded);
        assert!(meta.errors.is_empty());
    }

    #[tokio::test]
    async fn retries_transient_failures_until_max_attempts_then_gives_up() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let upstream: BoxSeq<i32> = crate::source::from_array(vec![1]);
        let opts = RetryOptions {
            max_attempts: 3,
            backoff_ms: 1,
            allow_list: None,
        };
        let seq = with_retry(upstream, "flaky", opts, move |_n, _i| -> Result<i32, Box<dyn std::error::Error + Send + Sync>> {
            calls2.fetch_add(1, Ordering::SeqCst);
            Err(Box::from("ETIMEDOUT"))
        });
        let mut seq = seq;
        let result = seq.next().await.unwrap();
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_after_one_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let upstream: BoxSeq<i32> = crate::source::from_array(vec![1]);
        let seq = with_retry(upstream, "strict", RetryOptions::default(), move |_n, _i| -> Result<i32, Box<dyn std::error::Error + Send + Sync>> {
            calls2.fetch_add(1, Ordering::SeqCst);
            Err(Box::from("invalid input"))
        });
        let mut seq = seq;
        let result = seq.next().await.unwrap();
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_max_attempts_surfaces_as_a_validation_error_instead_of_panicking() {
        let upstream: BoxSeq<i32> = crate::source::from_array(vec![1]);
        let opts = RetryOptions {
            max_attempts: 0,
            backoff_ms: 1,
            allow_list: None,
        };
        let seq = with_retry(upstream, "bad", opts, |n, _i| Ok(n));
        let mut seq = seq;
        let err = seq.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
        assert!(seq.next().await.is_none());
    }

    #[tokio::test]
    async fn every_item_gets_independent_retry_metadata() {
        let upstream: BoxSeq<i32> = crate::source::from_array(vec![1, 2, 3]);
        let seq = with_retry(upstream, "id", RetryOptions::default(), |n, _i| Ok(n));
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out.len(), 3);
        for (value, meta) in out {
            assert_eq!(meta.attempts, 1);
            assert!(meta.succeeded);
            assert!(value >= 1);
        }
    }
}
