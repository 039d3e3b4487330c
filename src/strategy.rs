//! Per-item error-propagation strategies: `FailFast`, `SkipFailed`, `WrapErrors`.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{ItemMetadata, RetryMetadata, StreamError};
use crate::sequence::{BoxSeq, Sequence};

/// The outcome of a fallible step, carrying [`ItemMetadata`] regardless of
/// success or failure so downstream consumers can always inspect
/// provenance and timing.
///
/// `retry_metadata` is `None` when produced by [`with_error_strategy`]
/// directly (no retry policy was applied) and `Some` when produced by
/// [`crate::map_with_retry::map_with_retry`], which composes a retry policy
/// with this strategy.
#[derive(Debug, Clone)]
pub enum StreamResult<T> {
    /// The item was processed successfully.
    Ok {
        /// The produced value.
        data: T,
        /// Provenance and timing for this item.
        meta: ItemMetadata,
        /// Retry outcome, if a retry policy was applied upstream.
        retry_metadata: Option<RetryMetadata>,
    },
    /// The item failed; `data` never existed for this item.
    Err {
        /// The failure.
        error: StreamError,
        /// Provenance and timing for this item.
        meta: ItemMetadata,
        /// Retry outcome, if a retry policy was applied upstream.
        retry_metadata: Option<RetryMetadata>,
    },
}

impl<T> StreamResult<T> {
    /// Returns the success value, if any.
    pub fn ok(&self) -> Option<&T> {
        match self {
            StreamResult::Ok { data, .. } => Some(data),
            StreamResult::Err { .. } => None,
        }
    }

    /// Returns the metadata regardless of outcome.
    pub fn meta(&self) -> &ItemMetadata {
        match self {
            StreamResult::Ok { meta, .. } => meta,
            StreamResult::Err { meta, .. } => meta,
        }
    }

    /// Returns the retry outcome, if a retry policy was applied upstream.
    pub fn retry_metadata(&self) -> Option<&RetryMetadata> {
        match self {
            StreamResult::Ok { retry_metadata, .. } => retry_metadata.as_ref(),
            StreamResult::Err { retry_metadata, .. } => retry_metadata.as_ref(),
        }
    }
}

/// How a [`with_error_strategy`]-wrapped step reacts to a per-item failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorStrategy {
    /// The first failure terminates the whole sequence with that error.
    FailFast,
    /// Failed items are dropped; only successes are yielded.
    SkipFailed,
    /// Every item — success or failure — is yielded as a [`StreamResult`].
    WrapErrors,
}

/// Applies a fallible `op` to each item under `strategy`, attaching
/// [`ItemMetadata`] to every attempt.
///
/// `trace_id` is the run-stable identifier stamped onto every item and
/// error produced by this step.
pub fn with_error_strategy<T, U, F>(
    upstream: BoxSeq<T>,
    step_name: impl Into<Arc<str>>,
    trace_id: uuid::Uuid,
    strategy: ErrorStrategy,
    op: F,
) -> BoxSeq<StreamResult<U>>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T, usize) -> Result<U, Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    Box::new(WithErrorStrategy {
        upstream: Some(upstream),
        step_name: step_name.into(),
        trace_id,
        strategy,
        op,
        index: 0,
    })
}

struct WithErrorStrategy<T, U, F> {
    upstream: Option<BoxSeq<T>>,
    step_name: Arc<str>,
    trace_id: uuid::Uuid,
    strategy: ErrorStrategy,
    op: F,
    index: usize,
}

#[async_trait]
impl<T, U, F> Sequence<StreamResult<U>> for WithErrorStrategy<T, U, F>
where
    T: Send + 'static,
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

            match (self.op)(item, item_index) {
                Ok(data) => {
                    return Some(Ok(StreamResult::Ok {
                        data,
                        meta,
                        retry_metadata: None,
                    }))
                }
                Err(cause) => {
                    let error = StreamError::from_cause(self.step_name.clone(), item_index, StringError(cause.to_string()))
                        .enrich(self.trace_id);

                    match self.strategy {
                        ErrorStrategy::FailFast => {
                            self.upstream = None;
                            return Some(Err(error));
                        }
                        ErrorStrategy::SkipFailed => continue,
                        ErrorStrategy::WrapErrors => {
                            return Some(Ok(StreamResult::Err {
                                error,
                                meta,
                                retry_metadata: None,
                            }))
                        }
                    }
                }
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
            Err(Box::from("odd number rejected"))
        }
    }

    #[tokio::test]
    async fn fail_fast_stops_at_the_first_error() {
        let seq = with_error_strategy(
            from_array(vec![2, 4, 3, 6]),
            "halve",
            uuid::Uuid::new_v4(),
            ErrorStrategy::FailFast,
            halves,
        );
        let mut seq = seq;
        assert!(matches!(seq.next().await, Some(Ok(StreamResult::Ok { data: 1, .. }))));
        assert!(matches!(seq.next().await, Some(Ok(StreamResult::Ok { data: 2, .. }))));
        assert!(matches!(seq.next().await, Some(Err(_))));
        assert!(seq.next().await.is_none());
    }

    #[tokio::test]
    async fn skip_failed_drops_failures_and_continues() {
        let seq = with_error_strategy(
            from_array(vec![2, 4, 3, 6]),
            "halve",
            uuid::Uuid::new_v4(),
            ErrorStrategy::SkipFailed,
            halves,
        );
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        let values: Vec<i32> = out.iter().filter_map(StreamResult::ok).copied().collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn wrap_errors_yields_every_item() {
        let seq = with_error_strategy(
            from_array(vec![2, 3]),
            "halve",
            uuid::Uuid::new_v4(),
            ErrorStrategy::WrapErrors,
            halves,
        );
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], StreamResult::Ok { data: 1, .. }));
        assert!(matches!(out[1], StreamResult::Err { .. }));
    }
}
