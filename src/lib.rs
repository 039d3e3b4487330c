//! `flowcore`: a pull-based streaming pipeline engine.
//!
//! A composable, lazy, single-producer/single-consumer dataflow runtime for
//! transforming, filtering, batching, expanding, parallelising, windowing,
//! retrying, and observing sequences of heterogeneous items.
//!
//! The engine is organised as the six cooperating subsystems documented on
//! each module below, assembled leaf-first:
//!
//! - [`sequence`] — the pull-based [`sequence::Sequence`] trait every
//!   operator implements.
//! - [`source`] — sources and sinks: `from_array`, `from_async_iterable`,
//!   `to_array`, `for_each`, `reduce`.
//! - [`ops`] — one-to-one and expanding operators: `map`, `filter`,
//!   `flat_map`, `flatten`, `tap`, `take`, `skip`.
//! - [`batch`] — count-based `batch` and sliding/tumbling `window`.
//! - [`buffer_time`] — time-based buffering with an optional size cap.
//! - [`parallel`] — bounded-concurrency `parallel_map`/`parallel_filter` and
//!   the `merge` combinator.
//! - [`retry`] — the retryable-error predicate and `with_retry`.
//! - [`strategy`] — `with_error_strategy` (`FailFast`/`SkipFailed`/`WrapErrors`).
//! - [`map_with_retry`] — the composition of `retry` and `strategy`.
//! - [`metrics`] — per-step metadata collection, pipeline-wide progress
//!   tracking, a bounded-memory latency sketch, and a typed event bus.
//! - [`state`] — the pipeline state container and `replayable` wrapper.
//! - [`builder`] — the fluent pipeline builder tying A–E together.
//! - [`cancel`] — the cooperative cancellation token shared by the parallel
//!   scheduler and `merge`.
//! - [`clock`] — the injectable clock/sleeper pair used by every time-based
//!   operator.
//! - [`error`] — the error taxonomy, item metadata, and retry metadata.

pub mod batch;
pub mod builder;
pub mod buffer_time;
pub mod cancel;
pub mod clock;
pub mod error;
pub mod map_with_retry;
pub mod metrics;
pub mod ops;
pub mod parallel;
pub mod retry;
pub mod sequence;
pub mod source;
pub mod state;
pub mod strategy;

pub use batch::{batch, window};
pub use builder::{BuildError, Pipeline, PipelineBuilder};
pub use buffer_time::{buffer_time, buffer_time_with_clock, BufferTimeOptions};
pub use cancel::CancellationToken;
pub use clock::{Clock, Sleeper, SystemClock, TimeSource, TokioSleeper};
pub use error::{ErrorKind, ItemMetadata, RetryAttemptError, RetryMetadata, StreamError};
pub use map_with_retry::map_with_retry;
pub use ops::{flatten, SequenceExt};
pub use parallel::{merge, parallel_filter, parallel_map, AsyncOp, DeliveryOrder, ParallelOptions};
pub use retry::{is_retryable, with_retry, with_retry_with_clock, RetryOptions};
pub use sequence::{BoxSeq, Sequence};
pub use source::{for_each, from_array, from_async_iterable, reduce, to_array, AsyncIterable};
pub use state::{replayable, PipelineState, Replayable};
pub use strategy::{with_error_strategy, ErrorStrategy, StreamResult};
