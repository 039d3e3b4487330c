//! The core pull-based sequence abstraction.
//!
//! A [`Sequence`] is a consumer-driven, lazy source of items: nothing
//! happens until [`Sequence::next`] is called, and every operator pulls from
//! its upstream on demand. Termination is one of: exhausted (`None`),
//! errored (`Some(Err(_))`), or cancelled (via [`Sequence::cancel`]).

use async_trait::async_trait;

use crate::error::StreamError;

/// A lazy, pull-based source of `T`.
///
/// Implementors own whatever buffered state their operator needs (a single
/// pending item for 1-to-1 transforms, a deque for windowing, an in-flight
/// task set for the parallel scheduler) and must release it from
/// [`Sequence::cancel`].
#[async_trait]
pub trait Sequence<T: Send>: Send {
    /// Pulls the next item, if any.
    ///
    /// Returns `None` once the sequence is exhausted. Returns `Some(Err(_))`
    /// on a fatal error; after an error the sequence should not be polled
    /// again (behavior is operator-defined, but no operator here resumes
    /// after an error).
    async fn next(&mut self) -> Option<Result<T, StreamError>>;

    /// Cooperatively cancels this sequence: stops pulling upstream, awaits
    /// or abandons (best effort) any in-flight task it owns, and drops
    /// buffered state on cancellation, so resources never outlive the pull
    /// that abandoned them.
    ///
    /// The default implementation does nothing, which is correct for
    /// stateless sources; stateful operators (batching, windowing, the
    /// parallel scheduler, time buffering) must override it.
    async fn cancel(&mut self) {}
}

/// A boxed, dynamically dispatched sequence — the common currency between
/// operators, since each one wraps its upstream behind this alias.
pub type BoxSeq<T> = Box<dyn Sequence<T> + Send>;

#[async_trait]
impl<T: Send> Sequence<T> for BoxSeq<T> {
    async fn next(&mut self) -> Option<Result<T, StreamError>> {
        (**self).next().await
    }

    async fn cancel(&mut self) {
        (**self).cancel().await;
    }
}
