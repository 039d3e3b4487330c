//! Time-based buffering: `buffer_time(window_ms, max_size?)`.
//!
//! A single timer per buffer, started when the first item enters an empty
//! buffer. The buffer emits when the timer fires *or* `max_size` is
//! reached, whichever is first. On upstream exhaustion any non-empty
//! residual is emitted; on cancel the residual is dropped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::clock::TimeSource;
use crate::error::StreamError;
use crate::sequence::{BoxSeq, Sequence};

/// Options for [`buffer_time`], a single explicit record rather than an
/// untyped `{window_ms, max_size}` bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferTimeOptions {
    /// The timer duration, in milliseconds, measured from the first item
    /// entering an empty buffer.
    pub window_ms: u64,
    /// If set, the buffer also emits as soon as it reaches this many items.
    pub max_size: Option<usize>,
}

impl Default for BufferTimeOptions {
    fn default() -> Self {
        Self {
            window_ms: 1000,
            max_size: None,
        }
    }
}

impl BufferTimeOptions {
    /// Shorthand for a time-only buffer with no size cap.
    #[must_use]
    pub fn window(window_ms: u64) -> Self {
        Self {
            window_ms,
            max_size: None,
        }
    }
}

/// Buffers items, emitting a `Vec` either when `window_ms` elapses since the
/// first buffered item, or when `max_size` is reached, whichever is first.
/// An empty buffer never emits on timer fire.
pub fn buffer_time<T: Send + 'static>(upstream: BoxSeq<T>, opts: BufferTimeOptions) -> BoxSeq<Vec<T>> {
    buffer_time_with_clock(upstream, opts, TimeSource::default())
}

/// As [`buffer_time`], but with an injectable [`TimeSource`] for
/// deterministic tests.
pub fn buffer_time_with_clock<T: Send + 'static>(
    upstream: BoxSeq<T>,
    opts: BufferTimeOptions,
    time_source: TimeSource,
) -> BoxSeq<Vec<T>> {
    Box::new(BufferTime {
        upstream: Some(upstream),
        window_ms: opts.window_ms,
        max_size: opts.max_size,
        time_source,
        buffer: Vec::new(),
        deadline: None,
    })
}

struct BufferTime<T> {
    upstream: Option<BoxSeq<T>>,
    window_ms: u64,
    max_size: Option<usize>,
    time_source: TimeSource,
    buffer: Vec<T>,
    /// Set when the first item enters an empty buffer; cleared on emit.
    /// `None` means the timer has not started yet.
    deadline: Option<Instant>,
}

#[async_trait]
impl<T: Send + 'static> Sequence<Vec<T>> for BufferTime<T> {
    async fn next(&mut self) -> Option<Result<Vec<T>, StreamError>> {
        loop {
            let upstream = self.upstream.as_mut()?;

            if let Some(max_size) = self.max_size {
                if self.buffer.len() >= max_size {
                    self.deadline = None;
                    return Some(Ok(std::mem::take(&mut self.buffer)));
                }
            }

            let sleep_until = match self.deadline {
                Some(deadline) => {
                    let now = self.time_source.now();
                    if now >= deadline {
                        self.deadline = None;
                        return Some(Ok(std::mem::take(&mut self.buffer)));
                    }
                    deadline - now
                }
                // No item buffered yet: wait on upstream only, so the
                // timer truly starts when the first item arrives.
                None => Duration::from_secs(u64::MAX / 1000),
            };

            tokio::select! {
                biased;
                item = upstream.next() => {
                    match item {
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
                        Some(Ok(value)) => {
                            if self.buffer.is_empty() {
                                self.deadline = Some(self.time_source.now() + Duration::from_millis(self.window_ms));
                            }
                            self.buffer.push(value);
                        }
                    }
                }
                () = self.time_source.sleep(sleep_until), if self.deadline.is_some() => {
                    // Buffer is non-empty whenever a deadline is set; an
                    // empty buffer never emits on timer fire.
                    self.deadline = None;
                    return Some(Ok(std::mem::take(&mut self.buffer)));
                }
            }
        }
    }

    async fn cancel(&mut self) {
        self.buffer.clear();
        self.deadline = None;
        if let Some(upstream) = self.upstream.as_mut() {
            upstream.cancel().await;
        }
        self.upstream = None;
    }
}
