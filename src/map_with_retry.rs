//! `map_with_retry`: the composition of [`crate::retry::with_retry`] and
//! [`crate::strategy::with_error_strategy`].
//!
//! Every item is retried per [`RetryOptions`](crate::retry::RetryOptions),
//! then the outcome (success or exhausted failure) is handed to an
//! [`ErrorStrategy`]. Unlike plain `with_error_strategy`, every
//! [`StreamResult`] produced here carries its [`RetryMetadata`] — including
//! on failure, where `with_retry` alone would discard it along with the
//! error it returns.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::TimeSource;
use crate::error::{ItemMetadata, RetryAttemptError, RetryMetadata, StreamError};
use crate::retry::{is_retryable, RetryOptions};
use crate::sequence::{BoxSeq, Sequence};
use crate::strategy::{ErrorStrategy, StreamResult};

/// Retries each item per `retry_opts`, then applies `strategy` to the final
/// outcome. Always yields [`StreamResult`] enriched with [`RetryMetadata`];
/// items dropped by `SkipFailed` after exhausting retries are omitted
/// entirely, matching `spec.md`'s "skipped items are omitted entirely".
pub fn map_with_retry<T, U, F>(
    upstream: BoxSeq<T>,
    step_name: impl Into<Arc<str>>,
    trace_id: Uuid,
    retry_opts: RetryOptions,
    strategy: ErrorStrategy,
    op: F,
) -> BoxSeq<StreamResult<U>>
where
    T: Send + Clone + 'static,
    U: Send + 'static,
    F: FnMut(T, usize) -> Result<U, Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    map_with_retry_with_clock(upstream, step_name, trace_id, retry_opts, strategy, op, TimeSource::default())
}

/// As [`map_with_retry`], but with an injectable [`TimeSource`] for
/// deterministic backoff in tests.
pub fn map_with_retry_with_clock<T, U, F>(
    upstream: BoxSeq<T>,
    step_name: impl Into<Arc<str>>,
    trace_id: Uuid,
    retry_opts: RetryOptions,
    strategy: ErrorStrategy,
    op: F,
    time_source: TimeSource,
) -> BoxSeq<StreamResult<U>>
where
    T: Send + Clone + 'static,
    U: Send + 'static,
    F: FnMut(T, usize) -> Result<U, Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    if retry_opts.max_attempts == 0 {
        return Box::new(crate::error::FailedSequence::new(StreamError::validation(
            "map_with_retry",
            "max_attempts must be >= 1",
        )));
    }
    Box::new(MapWithRetry {
        upstream: Some(upstream),
        step_name: step_name.into(),
        trace_id,
        retry_opts,
        strategy,
        op,
        index: 0,
        time_source,
    })
}

struct MapWithRetry<T, U, F> {
    upstream: Option<BoxSeq<T>>,
    step_name: Arc<str>,
    trace_id: Uuid,
    retry_opts: RetryOptions,
    strategy: ErrorStrategy,
    op: F,
    index: usize,
    time_source: TimeSource,
}

impl<T, U, F> MapWithRetry<T, U, F>
where
    T: Send + Clone + 'static,
    U: Send + 'static,
    F: FnMut(T, usize) -> Result<U, Box<dyn std::error::Error + Send + Sync>> + Send,
{
    /// Runs the retry loop for one item, returning either the successful
    /// value or the last error, each paired with the item's [`RetryMetadata`].
    async fn retry_one(&mut self, item: T, item_index: usize) -> Result<(U, RetryMetadata), (StreamError, RetryMetadata)> {
        let allow_list: Option<Vec<&str>> = self
            .retry_opts
            .allow_list
            .as_ref()
            .map(|codes| codes.iter().map(String::as_str).collect());
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
                Ok(value) => {
                    meta.succeeded = true;
                    #[cfg(debug_assertions)]
                    meta.assert_consistent();
                    return Ok((value, meta));
                }
                Err(cause) => cause,
            };

            let message = cause.to_string();
            let retryable = is_retryable(&message, allow_list.as_deref());
            let stream_err = StreamError::from_cause(self.step_name.clone(), item_index, StringError(message))
                .enrich(self.trace_id);
            meta.errors.push(RetryAttemptError {
                attempt: meta.attempts,
                error: stream_err.clone(),
                duration_ms: attempt_duration_ms,
            });

            if !retryable || meta.attempts >= self.retry_opts.max_attempts {
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
                return Err((stream_err, meta));
            }

            let delay_ms = self.retry_opts.backoff_ms * (meta.attempts as u64);
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
}

#[async_trait]
impl<T, U, F> Sequence<StreamResult<U>> for MapWithRetry<T, U, F>
where
    T: Send + Clone + 'static,
    U: Send + 'static,
    F: FnMut(T, usize) -> Result<U, Box<dyn std::error::Error + Send + Sync>> + Send,
{
    async fn next(&mut self) -> Option<Result<StreamResult<U>, StreamError>> {
        loop {
            let upstream = self.upstream.as_mut()?;
            let item = match upstream.next().await? {
                Err(err) => {
                    self.upstream = None;
                    return Some(Err(err));
                }
                Ok(value) => value,
            };

            let item_index = self.index;
            self.index += 1;
            let meta = ItemMetadata::new(self.step_name.clone(), item_index, self.trace_id);

            match self.retry_one(item, item_index).await {
                Ok((data, retry_metadata)) => {
                    return Some(Ok(StreamResult::Ok {
                        data,
                        meta,
                        retry_metadata: Some(retry_metadata),
                    }))
                }
                Err((error, retry_metadata)) => match self.strategy {
                    ErrorStrategy::FailFast => {
                        self.upstream = None;
                        return Some(Err(error));
                    }
                    ErrorStrategy::SkipFailed => continue,
                    ErrorStrategy::WrapErrors => {
                        return Some(Ok(StreamResult::Err {
                            error,
                            meta,
                            retry_metadata: Some(retry_metadata),
                        }))
                    }
                },
            }
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
    use crate::source::{from_array, to_array};

    fn halves(n: i32) -> Result<i32, Box<dyn std::error::Error + Send + Sync>> {
        if n % 2 == 0 {
            Ok(n / 2)
        } else {
            Err(Box::from("non-retryable: odd number"))
        }
    }

    #[tokio::test]
    async fn wrap_errors_carries_retry_metadata_on_both_outcomes_e4() {
        let seq = map_with_retry(
            from_array(1..=5),
            "halve",
            Uuid::new_v4(),
            RetryOptions {
                max_attempts: 3,
                backoff_ms: 1,
                allow_list: None,
            },
            ErrorStrategy::WrapErrors,
            halves,
        );
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out.len(), 5);

        assert!(matches!(out[0], StreamResult::Err { .. }));
        assert!(matches!(out[1], StreamResult::Ok { data: 1, .. }));
        assert!(matches!(out[2], StreamResult::Err { .. }));
        assert!(matches!(out[3], StreamResult::Ok { data: 2, .. }));
        assert!(matches!(out[4], StreamResult::Err { .. }));

        let StreamResult::Err {
            ref retry_metadata, ..
        } = out[0]
        else {
            unreachable!()
        };
        let retry_metadata = retry_metadata.as_ref().unwrap();
        assert_eq!(retry_metadata.attempts, 1);
        assert!(!retry_metadata.succeeded);
    }

    #[tokio::test]
    async fn zero_max_attempts_surfaces_as_a_validation_error_instead_of_panicking() {
        let seq = map_with_retry(
            from_array(1..=3),
            "bad",
            Uuid::new_v4(),
            RetryOptions {
                max_attempts: 0,
                backoff_ms: 1,
                allow_list: None,
            },
            ErrorStrategy::FailFast,
            halves,
        );
        let mut seq = seq;
        let err = seq.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
        assert!(seq.next().await.is_none());
    }

    #[tokio::test]
    async fn skip_failed_omits_exhausted_items_entirely() {
        let seq = map_with_retry(
            from_array(1..=4),
            "halve",
            Uuid::new_v4(),
            RetryOptions::default(),
            ErrorStrategy::SkipFailed,
            halves,
        );
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        let values: Vec<i32> = out
            .iter()
            .filter_map(StreamResult::ok)
            .copied()
            .collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test]
    async fn fail_fast_stops_at_the_first_exhausted_item() {
        let seq = map_with_retry(
            from_array(vec![2, 4, 3, 6]),
            "halve",
            Uuid::new_v4(),
            RetryOptions::default(),
            ErrorStrategy::FailFast,
            halves,
        );
        let mut seq = seq;
        assert!(matches!(
            seq.next().await,
            Some(Ok(StreamResult::Ok { data: 1, .. }))
        ));
        assert!(matches!(
            seq.next().await,
            Some(Ok(StreamResult::Ok { data: 2, .. }))
        ));
        assert!(matches!(seq.next().await, Some(Err(_))));
        assert!(seq.next().await.is_none());
    }

    #[tokio::test]
    async fn retries_transient_failures_before_settling_e3() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc as StdArc;

        let calls = StdArc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let seq = map_with_retry(
            from_array(1..=5),
            "flaky",
            Uuid::new_v4(),
            RetryOptions {
                max_attempts: 3,
                backoff_ms: 1,
                allow_list: None,
            },
            ErrorStrategy::FailFast,
            move |n: i32, _i| -> Result<i32, Box<dyn std::error::Error + Send + Sync>> {
                let call = calls2.fetch_add(1, Ordering::SeqCst);
                if n == 2 && call < 2 {
                    Err(Box::from("ETIMEDOUT"))
                } else {
                    Ok(n)
                }
            },
        );
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        let values: Vec<i32> = out.iter().filter_map(StreamResult::ok).copied().collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }
}
