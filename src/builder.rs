//! The fluent pipeline builder: `start` → `.step(name, op)` → `build`.
//!
//! Each `.step()` call statically fixes the next step's input type to the
//! previous step's output type, so a pipeline that doesn't type-check can't
//! be assembled in the first place. The one thing that *can't* be caught by
//! the type system alone — two steps sharing a name, which would make
//! per-step metrics and events ambiguous — is rejected eagerly as a
//! `BuildError` at the call site that introduces the duplicate.
//!
//! Every step is wrapped so it drives a shared [`ProgressTracker`] and
//! [`EventBus`]: `step_started`/`record_item_processed`/`record_item_yielded`/
//! `step_error`/`step_completed` fire on the item boundaries each step's
//! sequence crosses, and the matching `Event::Step*` variant is published to
//! the bus alongside. `Pipeline` itself wraps the whole chain once more to
//! emit the pipeline-wide `PipelineStart`/`PipelineComplete`/`PipelineError`
//! lifecycle and drive `pipeline_started`/`pipeline_completed`.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::StreamError;
use crate::metrics::events::{Event, EventBus, Listener};
use crate::metrics::progress::{OverallProgress, ProgressTracker};
use crate::sequence::{BoxSeq, Sequence};
use crate::state::PipelineState;

/// A build-time failure assembling a [`PipelineBuilder`].
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum BuildError {
    /// Two steps were registered under the same name.
    #[error("duplicate step name '{0}'")]
    DuplicateStepName(Arc<str>),
}

/// A pipeline under construction, carrying the current output type `T`.
///
/// `start` begins the chain from a source sequence; each `.step()` call
/// consumes the builder and returns a new one typed to the step's output,
/// so the chain reads left-to-right in the order data flows.
pub struct PipelineBuilder<T> {
    seq: BoxSeq<T>,
    names: HashSet<Arc<str>>,
    state: PipelineState,
    trace_id: Uuid,
    tracker: Arc<ProgressTracker>,
    event_bus: EventBus,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Begins a pipeline from a source sequence, stamping a fresh `trace_id`
    /// for the run.
    #[must_use]
    pub fn start(source: BoxSeq<T>) -> Self {
        Self::start_with_trace_id(source, Uuid::new_v4())
    }

    /// As [`start`](Self::start), but with a caller-supplied `trace_id` —
    /// useful when the run needs to correlate with an identifier minted
    /// elsewhere (e.g. an inbound request id).
    #[must_use]
    pub fn start_with_trace_id(source: BoxSeq<T>, trace_id: Uuid) -> Self {
        Self {
            seq: source,
            names: HashSet::new(),
            state: PipelineState::new(),
            trace_id,
            tracker: Arc::new(ProgressTracker::new(trace_id, &[], None)),
            event_bus: EventBus::new(),
        }
    }

    /// Registers a named step, applying `op` to the current sequence and
    /// returning a builder typed to the step's output.
    ///
    /// Fails eagerly if `name` was already used by an earlier step in this
    /// chain.
    pub fn step<U, F>(mut self, name: impl Into<Arc<str>>, op: F) -> Result<PipelineBuilder<U>, BuildError>
    where
        U: Send + 'static,
        F: FnOnce(BoxSeq<T>) -> BoxSeq<U>,
    {
        let name = name.into();
        if !self.names.insert(name.clone()) {
            return Err(BuildError::DuplicateStepName(name));
        }
        let index = self.tracker.register_step(name.clone(), 1);
        let instrumented: BoxSeq<U> = Box::new(StepInstrumentation {
            inner: op(self.seq),
            index,
            trace_id: self.trace_id,
            tracker: self.tracker.clone(),
            event_bus: self.event_bus.clone(),
            started: false,
        });
        Ok(PipelineBuilder {
            seq: instrumented,
            names: self.names,
            state: self.state,
            trace_id: self.trace_id,
            tracker: self.tracker,
            event_bus: self.event_bus,
        })
    }

    /// Registers a listener on the pipeline's event bus before the run
    /// starts; the same bus is shared with the built [`Pipeline`].
    pub fn subscribe(&self, listener: Listener) {
        self.event_bus.subscribe(listener);
    }

    /// Finalizes the chain into an executable [`Pipeline`].
    #[must_use]
    pub fn build(self) -> Pipeline<T> {
        Pipeline {
            seq: self.seq,
            trace_id: self.trace_id,
            state: self.state,
            tracker: self.tracker,
            event_bus: self.event_bus,
            started: false,
            finished: false,
        }
    }
}

/// Wraps a single step's sequence so every item boundary it crosses drives
/// the pipeline's shared [`ProgressTracker`] and [`EventBus`].
struct StepInstrumentation<U> {
    inner: BoxSeq<U>,
    index: usize,
    trace_id: Uuid,
    tracker: Arc<ProgressTracker>,
    event_bus: EventBus,
    started: bool,
}

#[async_trait::async_trait]
impl<U: Send + 'static> Sequence<U> for StepInstrumentation<U> {
    async fn next(&mut self) -> Option<Result<U, StreamError>> {
        if !self.started {
            self.started = true;
            self.tracker.step_started(self.index);
            self.event_bus.emit(Event::StepStart {
                trace_id: self.trace_id,
                step: self.tracker.collector(self.index).snapshot(),
            });
        }

        match self.inner.next().await {
            None => {
                self.tracker.step_completed(self.index, false);
                self.event_bus.emit(Event::StepComplete {
                    trace_id: self.trace_id,
                    step: self.tracker.collector(self.index).snapshot(),
                });
                None
            }
            Some(Err(err)) => {
                self.tracker.record_item_processed(self.index);
                self.tracker.step_error(self.index, usize::MAX, err.clone());
                self.tracker.step_completed(self.index, true);
                self.event_bus.emit(Event::StepError {
                    trace_id: self.trace_id,
                    step: self.tracker.collector(self.index).snapshot(),
                    error: err.clone(),
                });
                Some(Err(err))
            }
            Some(Ok(value)) => {
                self.tracker.record_item_processed(self.index);
                self.tracker.record_item_yielded(self.index);
                self.event_bus.emit(Event::StepProgress {
                    trace_id: self.trace_id,
                    step: self.tracker.collector(self.index).snapshot(),
                });
                Some(Ok(value))
            }
        }
    }

    async fn cancel(&mut self) {
        self.inner.cancel().await;
    }
}

/// An assembled, executable pipeline: a single [`crate::sequence::Sequence`]
/// with its run-scoped `trace_id`, [`PipelineState`], and observability
/// wiring attached.
pub struct Pipeline<T> {
    seq: BoxSeq<T>,
    trace_id: Uuid,
    state: PipelineState,
    tracker: Arc<ProgressTracker>,
    event_bus: EventBus,
    started: bool,
    finished: bool,
}

impl<T: Send + 'static> Pipeline<T> {
    /// The run's stable trace identifier, stamped onto every item and error
    /// produced downstream.
    #[must_use]
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    /// The pipeline's shared state container.
    #[must_use]
    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// A point-in-time snapshot of the whole run's progress, throughput, and
    /// per-step completion.
    #[must_use]
    pub fn progress(&self) -> OverallProgress {
        self.tracker.snapshot()
    }

    /// Registers a listener on the pipeline's event bus.
    pub fn subscribe(&self, listener: Listener) {
        self.event_bus.subscribe(listener);
    }

    /// Consumes the pipeline, handing back its underlying sequence for
    /// direct driving (`next()`, `to_array`, `for_each`, ...). Observability
    /// wiring (progress, events) stops updating once the sequence is
    /// extracted this way.
    #[must_use]
    pub fn into_sequence(self) -> BoxSeq<T> {
        self.seq
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> Sequence<T> for Pipeline<T> {
    async fn next(&mut self) -> Option<Result<T, StreamError>> {
        if !self.started {
            self.started = true;
            self.tracker.pipeline_started();
            self.event_bus.emit(Event::PipelineStart { trace_id: self.trace_id });
        }

        let item = self.seq.next().await;

        if !self.finished {
            match &item {
                None => {
                    self.finished = true;
                    self.tracker.pipeline_completed(false);
                    self.event_bus.emit(Event::PipelineComplete {
                        trace_id: self.trace_id,
                        progress: self.tracker.snapshot(),
                    });
                }
                Some(Err(err)) => {
                    self.finished = true;
                    self.tracker.pipeline_completed(true);
                    self.event_bus.emit(Event::PipelineError {
                        trace_id: self.trace_id,
                        progress: self.tracker.snapshot(),
                        error: err.clone(),
                    });
                }
                Some(Ok(_)) => {}
            }
        }

        item
    }

    async fn cancel(&mut self) {
        self.seq.cancel().await;
    }
}
