//! One-to-one and expanding operators: `map`, `filter`, `flat_map`,
//! `flatten`, `tap`, `take`, `skip`.
//!
//! Each operator is a small struct implementing [`Sequence`], composed via
//! [`SequenceExt`] so chains read as
//! `from_array(xs).map(f).filter(p).take(3)`.

use async_trait::async_trait;

use crate::error::StreamError;
use crate::sequence::{BoxSeq, Sequence};

/// Extension methods that turn any boxed [`Sequence`] into an operator
/// chain. Implemented once for `BoxSeq<T>`; every method consumes `self`
/// and returns a new boxed sequence, so intermediate operators never need
/// naming.
pub trait SequenceExt<T: Send + 'static>: Sized {
    /// Yields `f(item, index)`; preserves 1:1 indexing.
    fn map<U, F>(self, f: F) -> BoxSeq<U>
    where
        U: Send + 'static,
        F: FnMut(T, usize) -> U + Send + 'static;

    /// Yields items where `pred(item, index)` is true; `index` advances for
    /// every inspected item, not just yielded ones.
    fn filter<F>(self, pred: F) -> BoxSeq<T>
    where
        F: FnMut(&T, usize) -> bool + Send + 'static;

    /// For each input, yields every element of `f(item, index)`; all
    /// outputs share the input's index.
    fn flat_map<U, I, F>(self, f: F) -> BoxSeq<U>
    where
        U: Send + 'static,
        I: IntoIterator<Item = U> + Send,
        F: FnMut(T, usize) -> I + Send + 'static;

    /// Calls `side_effect(item, index)`, yields the item unchanged, and
    /// propagates side-effect errors.
    fn tap<F>(self, side_effect: F) -> BoxSeq<T>
    where
        F: FnMut(&T, usize) -> Result<(), StreamError> + Send + 'static;

    /// Yields up to `n` items then cancels upstream. `n == 0` yields
    /// nothing and cancels immediately.
    fn take(self, n: usize) -> BoxSeq<T>;

    /// Drops the first `n` items.
    fn skip(self, n: usize) -> BoxSeq<T>;
}

impl<T: Send + 'static> SequenceExt<T> for BoxSeq<T> {
    fn map<U, F>(self, f: F) -> BoxSeq<U>
    where
        U: Send + 'static,
        F: FnMut(T, usize) -> U + Send + 'static,
    {
        Box::new(Map {
            upstream: self,
            f,
            index: 0,
        })
    }

    fn filter<F>(self, pred: F) -> BoxSeq<T>
    where
        F: FnMut(&T, usize) -> bool + Send + 'static,
    {
        Box::new(Filter {
            upstream: self,
            pred,
            index: 0,
        })
    }

    fn flat_map<U, I, F>(self, f: F) -> BoxSeq<U>
    where
        U: Send + 'static,
        I: IntoIterator<Item = U> + Send,
        F: FnMut(T, usize) -> I + Send + 'static,
    {
        Box::new(FlatMap {
            upstream: self,
            f,
            index: 0,
            pending: std::collections::VecDeque::new(),
        })
    }

    fn tap<F>(self, side_effect: F) -> BoxSeq<T>
    where
        F: FnMut(&T, usize) -> Result<(), StreamError> + Send + 'static,
    {
        Box::new(Tap {
            upstream: self,
            side_effect,
            index: 0,
        })
    }

    fn take(self, n: usize) -> BoxSeq<T> {
        Box::new(Take {
            upstream: self,
            remaining: n,
            cancelled: false,
        })
    }

    fn skip(self, n: usize) -> BoxSeq<T> {
        Box::new(Skip {
            upstream: self,
            remaining: n,
        })
    }
}

/// Flattens a sequence of iterables, specialised `flat_map` with the
/// identity function.
pub fn flatten<T, I>(upstream: BoxSeq<I>) -> BoxSeq<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = T> + Send + 'static,
{
    upstream.flat_map(|items, _index| items)
}

struct Map<T, U, F> {
    upstream: BoxSeq<T>,
    f: F,
    index: usize,
}

#[async_trait]
impl<T, U, F> Sequence<U> for Map<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T, usize) -> U + Send,
{
    async fn next(&mut self) -> Option<Result<U, StreamError>> {
        let item = self.upstream.next().await?;
        let result = item.map(|value| {
            let idx = self.index;
            self.index += 1;
            (self.f)(value, idx)
        });
        Some(result)
    }

    async fn cancel(&mut self) {
        self.upstream.cancel().await;
    }
}

struct Filter<T, F> {
    upstream: BoxSeq<T>,
    pred: F,
    index: usize,
}

#[async_trait]
impl<T, F> Sequence<T> for Filter<T, F>
where
    T: Send + 'static,
    F: FnMut(&T, usize) -> bool + Send,
{
    async fn next(&mut self) -> Option<Result<T, StreamError>> {
        loop {
            let item = self.upstream.next().await?;
            match item {
                Err(err) => return Some(Err(err)),
                Ok(value) => {
                    let idx = self.index;
                    self.index += 1;
                    if (self.pred)(&value, idx) {
                        return Some(Ok(value));
                    }
                }
            }
        }
    }

    async fn cancel(&mut self) {
        self.upstream.cancel().await;
    }
}

struct FlatMap<T, U, F> {
    upstream: BoxSeq<T>,
    f: F,
    index: usize,
    pending: std::collections::VecDeque<U>,
}

#[async_trait]
impl<T, U, I, F> Sequence<U> for FlatMap<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    I: IntoIterator<Item = U> + Send,
    F: FnMut(T, usize) -> I + Send,
{
    async fn next(&mut self) -> Option<Result<U, StreamError>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(Ok(item));
            }
            match self.upstream.next().await? {
                Err(err) => return Some(Err(err)),
                Ok(value) => {
                    let idx = self.index;
                    self.index += 1;
                    self.pending.extend((self.f)(value, idx));
                }
            }
        }
    }

    async fn cancel(&mut self) {
        self.pending.clear();
        self.upstream.cancel().await;
    }
}

struct Tap<T, F> {
    upstream: BoxSeq<T>,
    side_effect: F,
    index: usize,
}

#[async_trait]
impl<T, F> Sequence<T> for Tap<T, F>
where
    T: Send + 'static,
    F: FnMut(&T, usize) -> Result<(), StreamError> + Send,
{
    async fn next(&mut self) -> Option<Result<T, StreamError>> {
        let item = self.upstream.next().await?;
        match item {
            Err(err) => Some(Err(err)),
            Ok(value) => {
                let idx = self.index;
                self.index += 1;
                if let Err(err) = (self.side_effect)(&value, idx) {
                    Some(Err(err))
                } else {
                    Some(Ok(value))
                }
            }
        }
    }

    async fn cancel(&mut self) {
        self.upstream.cancel().await;
    }
}

struct Take<T> {
    upstream: BoxSeq<T>,
    remaining: usize,
    cancelled: bool,
}

#[async_trait]
impl<T: Send + 'static> Sequence<T> for Take<T> {
    async fn next(&mut self) -> Option<Result<T, StreamError>> {
        if self.remaining == 0 {
            if !self.cancelled {
                self.cancelled = true;
                self.upstream.cancel().await;
            }
            return None;
        }
        let item = self.upstream.next().await;
        if item.is_some() {
            self.remaining -= 1;
            if self.remaining == 0 {
                self.cancelled = true;
                self.upstream.cancel().await;
            }
        }
        item
    }

    async fn cancel(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.upstream.cancel().await;
        }
    }
}

struct Skip<T> {
    upstream: BoxSeq<T>,
    remaining: usize,
}

#[async_trait]
impl<T: Send + 'static> Sequence<T> for Skip<T> {
    async fn next(&mut self) -> Option<Result<T, StreamError>> {
        while self.remaining > 0 {
            match self.upstream.next().await? {
                Err(err) => return Some(Err(err)),
                Ok(_) => self.remaining -= 1,
            }
        }
        self.upstream.next().await
    }

    async fn cancel(&mut self) {
        self.upstream.cancel().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{from_array, to_array};

    #[tokio::test]
    async fn map_and_filter_compose_e1() {
        let seq = from_array(1..=9)
            .map(|n, _i| n * 2)
            .filter(|n, _i| n % 4 == 0);
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out, vec![4, 8, 12, 16, 20]);
    }

    #[tokio::test]
    async fn map_observes_sequential_indices() {
        let mut indices = Vec::new();
        let seq = from_array(vec!["a", "b", "c"]).map(|v, i| {
            indices.push(i);
            v
        });
        let mut seq = seq;
        let _ = to_array(&mut *seq).await.unwrap();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn filter_advances_index_for_every_inspected_item() {
        let mut seen_indices = Vec::new();
        let seq = from_array(0..6).filter(|v, i| {
            seen_indices.push(i);
            v % 2 == 0
        });
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out, vec![0, 2, 4]);
        assert_eq!(seen_indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn flat_map_shares_input_index_across_outputs() {
        let mut indices = Vec::new();
        let seq = from_array(vec![1, 2]).flat_map(|v, i| {
            indices.push(i);
            vec![v, v, v]
        });
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out, vec![1, 1, 1, 2, 2, 2]);
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn flatten_is_flat_map_identity() {
        let seq = flatten(from_array(vec![vec![1, 2], vec![3], vec![]]));
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn tap_yields_items_unchanged_and_runs_side_effects() {
        let mut observed = Vec::new();
        let seq = from_array(vec![1, 2, 3]).tap(|v, _i| {
            observed.push(*v);
            Ok(())
        });
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(observed, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn tap_propagates_side_effect_errors() {
        let seq = from_array(vec![1, 2, 3]).tap(|v, _i| {
            if *v == 2 {
                Err(StreamError::validation("tap", "boom"))
            } else {
                Ok(())
            }
        });
        let mut seq = seq;
        assert_eq!(seq.next().await.unwrap().unwrap(), 1);
        assert!(seq.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn take_yields_up_to_n_then_stops() {
        let seq = from_array(1..=10).take(3);
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn take_zero_is_empty_and_cancels_immediately() {
        let seq = from_array(1..=10).take(0);
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn skip_drops_the_first_n_items() {
        let seq = from_array(1..=5).skip(2);
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn laziness_map_is_called_at_most_take_n_times() {
        // map's closure should never run more times than take lets through.
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls2 = calls.clone();
        let seq = from_array(1..=1000)
            .map(move |v, _i| {
                calls2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                v
            })
            .take(3);
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert!(calls.load(std::sync::atomic::Ordering::SeqCst) <= 3);
    }
}
