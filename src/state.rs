//! The pipeline state container: named generator/snapshot slots, and a
//! `replayable` wrapper that memoises a one-shot sequence for repeat reads.
//!
//! Slots are stored behind `Box`/`Arc<dyn Any>` rather than a single type
//! parameter, since a pipeline's steps generally disagree on their output
//! type; callers downcast back to the type they know a given key holds.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::StreamError;
use crate::sequence::{BoxSeq, Sequence};

enum Slot {
    Generator(Box<dyn Any + Send>),
    Snapshot(Arc<dyn Any + Send + Sync>),
}

/// Keyed storage for named step outputs. Each key holds either a
/// not-yet-consumed generator or a materialised snapshot, never both; a
/// generator transitions to a snapshot on [`PipelineState::materialize`] or
/// [`PipelineState::with_checkpoint`], and never transitions back.
///
/// Cloning shares the same underlying map — cheap, and a deliberate
/// trade-off: branches consuming the same still-live generator key will
/// race for its items unless that key was wrapped with [`replayable`]
/// first.
#[derive(Clone)]
pub struct PipelineState {
    slots: Arc<SyncMutex<HashMap<String, Slot>>>,
}

impl PipelineState {
    /// Creates an empty state container.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Arc::new(SyncMutex::new(HashMap::new())),
        }
    }

    /// Adds a generator under `key` without materialising it.
    ///
    /// # Panics
    /// Panics if `key` is already present — step names must be unique.
    pub fn with_key<T: Send + 'static>(&self, key: impl Into<String>, seq: BoxSeq<T>) {
        let key = key.into();
        let mut slots = self.slots.lock();
        assert!(!slots.contains_key(&key), "duplicate step name '{key}'");
        slots.insert(key, Slot::Generator(Box::new(seq)));
    }

    /// Adds `seq` under `key`, immediately consuming it into a snapshot.
    pub async fn with_checkpoint<T: Send + 'static>(&self, key: impl Into<String>, seq: BoxSeq<T>) -> Result<(), StreamError> {
        let key = key.into();
        let items = crate::source::to_array(&mut *{ let mut s = seq; s }).await?;
        let mut slots = self.slots.lock();
        assert!(!slots.contains_key(&key), "duplicate step name '{key}'");
        slots.insert(key, Slot::Snapshot(Arc::new(items) as Arc<dyn Any + Send + Sync>));
        Ok(())
    }

    /// Whether `key` currently holds a materialised snapshot.
    #[must_use]
    pub fn has_snapshot(&self, key: &str) -> bool {
        matches!(self.slots.lock().get(key), Some(Slot::Snapshot(_)))
    }

    /// Consumes the generator under `key` into a cached snapshot and
    /// returns it. Idempotent: calling this again on an already-snapshotted
    /// key returns the same cached items without re-consuming anything.
    ///
    /// # Panics
    /// Panics if `key` is absent, or if the stored value is not a generator
    /// or snapshot of `T`.
    pub async fn materialize<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Result<Arc<Vec<T>>, StreamError> {
        let existing = {
            let slots = self.slots.lock();
            match slots.get(key) {
                Some(Slot::Snapshot(items)) => Some(
                    items
                        .clone()
                        .downcast::<Vec<T>>()
                        .unwrap_or_else(|_| panic!("state key '{key}' holds a snapshot of a different type")),
                ),
                Some(Slot::Generator(_)) => None,
                None => panic!("no such state key '{key}'"),
            }
        };
        if let Some(items) = existing {
            return Ok(items);
        }

        let seq = {
            let mut slots = self.slots.lock();
            match slots.remove(key).expect("checked present above") {
                Slot::Generator(boxed) => *boxed
                    .downcast::<BoxSeq<T>>()
                    .unwrap_or_else(|_| panic!("state key '{key}' holds a generator of a different type")),
                Slot::Snapshot(_) => unreachable!("snapshot case handled above"),
            }
        };
        let mut seq = seq;
        let items = Arc::new(crate::source::to_array(&mut *seq).await?);
        self.slots
            .lock()
            .insert(key.to_owned(), Slot::Snapshot(items.clone() as Arc<dyn Any + Send + Sync>));
        Ok(items)
    }

    /// Returns a fresh [`Sequence`] over `key`'s contents: a clone of the
    /// snapshot's items if already materialised, or the live generator
    /// otherwise (which this call consumes — call [`PipelineState::materialize`]
    /// first, or wrap the value with [`replayable`] at insertion time, if
    /// more than one read is needed).
    ///
    /// # Panics
    /// Panics if `key` is absent or holds a different element type.
    #[must_use]
    pub fn stream<T: Clone + Send + Sync + 'static>(&self, key: &str) -> BoxSeq<T> {
        let mut slots = self.slots.lock();
        match slots.remove(key).unwrap_or_else(|| panic!("no such state key '{key}'")) {
            Slot::Generator(boxed) => {
                let seq = *boxed
                    .downcast::<BoxSeq<T>>()
                    .unwrap_or_else(|_| panic!("state key '{key}' holds a generator of a different type"));
                seq
            }
            Slot::Snapshot(items) => {
                let items = items
                    .downcast::<Vec<T>>()
                    .unwrap_or_else(|_| panic!("state key '{key}' holds a snapshot of a different type"));
                slots.insert(key.to_owned(), Slot::Snapshot(items.clone() as Arc<dyn Any + Send + Sync>));
                crate::source::from_array((*items).clone())
            }
        }
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

enum ReplayState<T> {
    Buffering { buffered: Vec<T>, upstream: BoxSeq<T> },
    Done { items: Arc<Vec<T>> },
    Errored { error: StreamError },
}

/// A one-shot sequence wrapped so it can be streamed multiple times: the
/// first cursor to reach a not-yet-buffered position pulls upstream and
/// every cursor observes the same buffered prefix.
#[derive(Clone)]
pub struct Replayable<T> {
    state: Arc<AsyncMutex<ReplayState<T>>>,
}

/// Wraps `seq` so its items can be read by more than one consumer, each
/// seeing the full sequence from the start.
#[must_use]
pub fn replayable<T: Clone + Send + 'static>(seq: BoxSeq<T>) -> Replayable<T> {
    Replayable {
        state: Arc::new(AsyncMutex::new(ReplayState::Buffering {
            buffered: Vec::new(),
            upstream: seq,
        })),
    }
}

impl<T: Clone + Send + 'static> Replayable<T> {
    /// Returns a new cursor over this sequence's items, starting at index 0.
    #[must_use]
    pub fn stream(&self) -> BoxSeq<T> {
        Box::new(ReplayCursor {
            state: self.state.clone(),
            position: 0,
        })
    }
}

struct ReplayCursor<T> {
    state: Arc<AsyncMutex<ReplayState<T>>>,
    position: usize,
}

#[async_trait]
impl<T: Clone + Send + 'static> Sequence<T> for ReplayCursor<T> {
    async fn next(&mut self) -> Option<Result<T, StreamError>> {
        let mut state = self.state.lock().await;
        loop {
            match &mut *state {
                ReplayState::Done { items } => {
                    return items.get(self.position).cloned().map(|item| {
                        self.position += 1;
                        Ok(item)
                    });
                }
                ReplayState::Errored { error } => return Some(Err(error.clone())),
                ReplayState::Buffering { buffered, .. } if self.position < buffered.len() => {
                    let item = buffered[self.position].clone();
                    self.position += 1;
                    return Some(Ok(item));
                }
                ReplayState::Buffering { buffered, upstream } => {
                    match upstream.next().await {
                        None => {
                            let items = Arc::new(std::mem::take(buffered));
                            *state = ReplayState::Done { items };
                        }
                        Some(Err(err)) => {
                            *state = ReplayState::Errored { error: err };
                        }
                        Some(Ok(item)) => {
                            buffered.push(item);
                        }
                    }
                }
            }
        }
    }

    async fn cancel(&mut self) {
        // A replayable sequence outlives any single cursor; cancelling one
        // cursor must not stop sibling cursors from reading the buffer, so
        // this is a pure no-op. The underlying upstream is released only
        // when every `Replayable` clone (and thus the shared state) drops.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{from_array, to_array};

    #[tokio::test]
    async fn with_key_then_stream_yields_the_generators_items() {
        let state = PipelineState::new();
        state.with_key("a", from_array(vec![1, 2, 3]));
        let mut seq = state.stream::<i32>("a");
        let out = to_array(&mut *seq).await.unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn with_checkpoint_materialises_immediately() {
        let state = PipelineState::new();
        state.with_checkpoint("a", from_array(vec![1, 2, 3])).await.unwrap();
        assert!(state.has_snapshot("a"));
    }

    #[tokio::test]
    async fn materialize_is_idempotent() {
        let state = PipelineState::new();
        state.with_key("a", from_array(vec![1, 2, 3]));
        let first = state.materialize::<i32>("a").await.unwrap();
        let second = state.materialize::<i32>("a").await.unwrap();
        assert_eq!(*first, vec![1, 2, 3]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn stream_after_materialize_can_be_read_more_than_once() {
        let state = PipelineState::new();
        state.with_key("a", from_array(vec![1, 2, 3]));
        let _ = state.materialize::<i32>("a").await.unwrap();

        let mut first = state.stream::<i32>("a");
        let out1 = to_array(&mut *first).await.unwrap();
        let mut second = state.stream::<i32>("a");
        let out2 = to_array(&mut *second).await.unwrap();
        assert_eq!(out1, out2);
        assert_eq!(out1, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn replayable_sequence_supports_two_independent_cursors() {
        let shared = replayable(from_array(vec![1, 2, 3, 4]));
        let mut cursor_a = shared.stream();
        let mut cursor_b = shared.stream();
        let out_a = to_array(&mut *cursor_a).await.unwrap();
        let out_b = to_array(&mut *cursor_b).await.unwrap();
        assert_eq!(out_a, out_b);
        assert_eq!(out_a, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn replayable_propagates_errors_to_every_cursor() {
        let failing: BoxSeq<i32> = crate::ops::SequenceExt::tap(from_array(vec![1]), |_v, _i| {
            Err(StreamError::validation("replay", "boom"))
        });
        let shared = replayable(failing);
        let mut cursor_a = shared.stream();
        assert!(cursor_a.next().await.unwrap().is_err());
        let mut cursor_b = shared.stream();
        assert!(cursor_b.next().await.unwrap().is_err());
    }
}
