//! Count-based batching and windowing.

use async_trait::async_trait;
use std::collections::VecDeque;

use crate::error::StreamError;
use crate::sequence::{BoxSeq, Sequence};

/// Groups items into lists of exactly `n`, except the final (possibly
/// shorter) batch. Returns a [`StreamError`] of kind [`crate::error::ErrorKind::Validation`]
/// if `n == 0`.
pub fn batch<T: Send + 'static>(upstream: BoxSeq<T>, n: usize) -> Result<BoxSeq<Vec<T>>, StreamError> {
    if n == 0 {
        return Err(StreamError::validation("batch", "n must be >= 1"));
    }
    Ok(Box::new(Batch {
        upstream: Some(upstream),
        n,
        buffer: Vec::with_capacity(n),
    }))
}

struct Batch<T> {
    upstream: Option<BoxSeq<T>>,
    n: usize,
    buffer: Vec<T>,
}

#[async_trait]
impl<T: Send + 'static> Sequence<Vec<T>> for Batch<T> {
    async fn next(&mut self) -> Option<Result<Vec<T>, StreamError>> {
        let upstream = self.upstream.as_mut()?;
        loop {
            match upstream.next().await {
                None => {
                    self.upstream = None;
                    if self.buffer.is_empty() {
                        return None;
                    }
                    return Some(Ok(std::mem::take(&mut self.buffer)));
                }
                Some(Err(err)) => {
                    self.upstream = None;
                    self.buffer.clear();
                    return Some(Err(err));
                }
                Some(Ok(item)) => {
                    self.buffer.push(item);
                    if self.buffer.len() == self.n {
                        return Some(Ok(std::mem::replace(
                            &mut self.buffer,
                            Vec::with_capacity(self.n),
                        )));
                    }
                }
            }
        }
    }

    async fn cancel(&mut self) {
        self.buffer.clear();
        if let Some(upstream) = self.upstream.as_mut() {
            upstream.cancel().await;
        }
        self.upstream = None;
    }
}

/// Emits overlapping lists of length `size` advancing by `slide`. Emits
/// nothing until `size` items have been seen; the final partial window is
/// suppressed unless the source exhausts exactly on a tumbling boundary
/// (`size == slide`).
pub fn window<T: Send + Clone + 'static>(upstream: BoxSeq<T>, size: usize, slide: usize) -> BoxSeq<Vec<T>> {
    Box::new(Window {
        upstream: Some(upstream),
        size,
        slide,
        buf: VecDeque::with_capacity(size),
        skip_remaining: 0,
    })
}

struct Window<T> {
    upstream: Option<BoxSeq<T>>,
    size: usize,
    slide: usize,
    buf: VecDeque<T>,
    /// Items still to discard before buffering resumes — only nonzero
    /// between windows when `slide > size` (gap windows).
    skip_remaining: usize,
}

#[async_trait]
impl<T: Send + Clone + 'static> Sequence<Vec<T>> for Window<T> {
    async fn next(&mut self) -> Option<Result<Vec<T>, StreamError>> {
        let upstream = self.upstream.as_mut()?;
        loop {
            if self.buf.len() == self.size {
                let out: Vec<T> = self.buf.iter().cloned().collect();
                if self.slide >= self.size {
                    self.skip_remaining = self.slide - self.size;
                    self.buf.clear();
                } else {
                    for _ in 0..self.slide {
                        let _ = self.buf.pop_front();
                    }
                }
                return Some(Ok(out));
            }

            match upstream.next().await {
                None => {
                    self.upstream = None;
                    return None;
                }
                Some(Err(err)) => {
                    self.upstream = None;
                    self.buf.clear();
                    return Some(Err(err));
                }
                Some(Ok(item)) => {
                    if self.skip_remaining > 0 {
                        self.skip_remaining -= 1;
                        continue;
                    }
                    self.buf.push_back(item);
                }
            }
        }
    }

    async fn cancel(&mut self) {
        self.buf.clear();
        if let Some(upstream) = self.upstream.as_mut() {
            upstream.cancel().await;
        }
        self.upstream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{from_array, to_array};

    #[tokio::test]
    async fn batch_groups_into_fixed_size_lists_with_short_final() {
        let seq = batch(from_array(1..=7), 3).unwrap();
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
    }

    #[tokio::test]
    async fn batch_on_exact_multiple_has_no_short_final() {
        let seq = batch(from_array(1..=6), 3).unwrap();
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out, vec![vec![1, 2, 3], vec![4, 5, 6]]);
    }

    #[test]
    fn batch_of_zero_is_a_validation_error() {
        let err = batch(from_array(1..=3), 0).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn window_slides_by_one_e6() {
        let seq = window(from_array(1..=6), 3, 1);
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(
            out,
            vec![vec![1, 2, 3], vec![2, 3, 4], vec![3, 4, 5], vec![4, 5, 6]]
        );
    }

    #[tokio::test]
    async fn window_emits_nothing_below_size() {
        let seq = window(from_array(1..=2), 3, 1);
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn tumbling_window_equals_batch_on_exact_boundary() {
        // window(k, k) == batch(k) when the source exhausts exactly on a boundary.
        let windowed = window(from_array(1..=6), 3, 3);
        let mut windowed = windowed;
        let windowed_out = to_array(&mut *windowed).await.unwrap();

        let batched = batch(from_array(1..=6), 3).unwrap();
        let mut batched = batched;
        let batched_out = to_array(&mut *batched).await.unwrap();

        assert_eq!(windowed_out, batched_out);
    }

    #[tokio::test]
    async fn tumbling_window_suppresses_partial_final_unlike_batch() {
        let windowed = window(from_array(1..=7), 3, 3);
        let mut windowed = windowed;
        let windowed_out = to_array(&mut *windowed).await.unwrap();
        assert_eq!(windowed_out, vec![vec![1, 2, 3], vec![4, 5, 6]]);

        let batched = batch(from_array(1..=7), 3).unwrap();
        let mut batched = batched;
        let batched_out = to_array(&mut *batched).await.unwrap();
        assert_eq!(batched_out, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
    }

    #[tokio::test]
    async fn window_with_slide_greater_than_size_skips_gaps() {
        let seq = window(from_array(1..=10), 2, 4);
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out, vec![vec![1, 2], vec![5, 6], vec![9, 10]]);
    }

    #[tokio::test]
    async fn flatten_batch_round_trip_is_identity() {
        use crate::ops::flatten;
        let original: Vec<i32> = (1..=10).collect();
        let seq = flatten(batch(from_array(original.clone()), 4).unwrap());
        let mut seq = seq;
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out, original);
    }
}
