//! Sources and sinks: `from_array`, `from_async_iterable`, `to_array`,
//! `for_each`, `reduce`.

use async_trait::async_trait;
use std::collections::VecDeque;

use crate::error::StreamError;
use crate::sequence::{BoxSeq, Sequence};

/// A finite sequence over an in-memory list. O(1) per item.
pub struct FromArray<T> {
    items: VecDeque<T>,
}

#[async_trait]
impl<T: Send> Sequence<T> for FromArray<T> {
    async fn next(&mut self) -> Option<Result<T, StreamError>> {
        self.items.pop_front().map(Ok)
    }
}

/// Builds a finite [`Sequence`] over `items`.
pub fn from_array<T: Send + 'static>(items: impl IntoIterator<Item = T>) -> BoxSeq<T> {
    Box::new(FromArray {
        items: items.into_iter().collect(),
    })
}

/// Any pull-based async producer a caller can hand to the engine: an object
/// implementing this trait can be wrapped with [`from_async_iterable`] and
/// gains the full operator algebra.
///
/// This is the "any pull-based, finite-or-infinite item producer" contract
/// from outside this crate.
#[async_trait]
pub trait AsyncIterable<T: Send>: Send {
    /// Produces the next item, or `None` at exhaustion, or an error.
    async fn next_item(&mut self) -> Option<Result<T, StreamError>>;
}

struct FromAsyncIterable<T, S> {
    inner: S,
    _marker: std::marker::PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, S> Sequence<T> for FromAsyncIterable<T, S>
where
    T: Send,
    S: AsyncIterable<T>,
{
    async fn next(&mut self) -> Option<Result<T, StreamError>> {
        self.inner.next_item().await
    }

    async fn cancel(&mut self) {
        // The wrapped producer owns its own resources; this adapter holds
        // none of its own, so cancellation is a pure pass-through: dropping
        // `self.inner` (which happens when this sequence is dropped) is
        // sufficient to release it.
    }
}

/// Wraps any [`AsyncIterable`] producer as a [`Sequence`], propagating its
/// termination and cancellation unchanged.
pub fn from_async_iterable<T, S>(source: S) -> BoxSeq<T>
where
    T: Send + 'static,
    S: AsyncIterable<T> + 'static,
{
    Box::new(FromAsyncIterable {
        inner: source,
        _marker: std::marker::PhantomData,
    })
}

/// Consumes `seq` fully into a `Vec`. Caller accepts the memory cost — this
/// is the one operator in the crate with no bound beyond the caller's
/// choice.
pub async fn to_array<T: Send>(seq: &mut (dyn Sequence<T> + Send)) -> Result<Vec<T>, StreamError> {
    let mut out = Vec::new();
    while let Some(item) = seq.next().await {
        out.push(item?);
    }
    Ok(out)
}

/// Calls `f` once per item in order, for side effects only.
pub async fn for_each<T: Send>(
    seq: &mut (dyn Sequence<T> + Send),
    mut f: impl FnMut(T) + Send,
) -> Result<(), StreamError> {
    while let Some(item) = seq.next().await {
        f(item?);
    }
    Ok(())
}

/// Folds `seq` into a single accumulator, propagating the first error and
/// leaving the accumulator's final state undefined on failure (matching
/// `to_array`'s all-or-nothing consumption).
pub async fn reduce<T, Acc>(
    seq: &mut (dyn Sequence<T> + Send),
    init: Acc,
    mut f: impl FnMut(Acc, T) -> Acc + Send,
) -> Result<Acc, StreamError>
where
    T: Send,
    Acc: Send,
{
    let mut acc = init;
    while let Some(item) = seq.next().await {
        acc = f(acc, item?);
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_array_yields_items_in_order_then_exhausts() {
        let mut seq = from_array(vec![1, 2, 3]);
        assert_eq!(seq.next().await.unwrap().unwrap(), 1);
        assert_eq!(seq.next().await.unwrap().unwrap(), 2);
        assert_eq!(seq.next().await.unwrap().unwrap(), 3);
        assert!(seq.next().await.is_none());
        assert!(seq.next().await.is_none());
    }

    #[tokio::test]
    async fn to_array_collects_everything() {
        let mut seq = from_array(vec!["a", "b", "c"]);
        let items = to_array(&mut *seq).await.unwrap();
        assert_eq!(items, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn reduce_folds_in_order() {
        let mut seq = from_array(1..=5);
        let sum = reduce(&mut *seq, 0, |acc, x| acc + x).await.unwrap();
        assert_eq!(sum, 15);
    }

    #[tokio::test]
    async fn for_each_visits_every_item() {
        let mut seq = from_array(vec![1, 2, 3]);
        let mut seen = Vec::new();
        for_each(&mut *seq, |x| seen.push(x)).await.unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    struct Counter {
        remaining: u32,
    }

    #[async_trait]
    impl AsyncIterable<u32> for Counter {
        async fn next_item(&mut self) -> Option<Result<u32, StreamError>> {
            if self.remaining == 0 {
                None
            } else {
                self.remaining -= 1;
                Some(Ok(self.remaining))
            }
        }
    }

    #[tokio::test]
    async fn from_async_iterable_propagates_termination() {
        let mut seq = from_async_iterable(Counter { remaining: 3 });
        let items = to_array(&mut *seq).await.unwrap();
        assert_eq!(items, vec![2, 1, 0]);
    }
}
