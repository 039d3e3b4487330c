//! A one-way typed event bus. Listeners are called synchronously from the
//! executing pipeline task; a panicking listener is caught and logged, and
//! never stops its siblings or the pipeline itself.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::StreamError;
use crate::metrics::collector::StepMetrics;
use crate::metrics::progress::OverallProgress;

/// A single observable occurrence during pipeline execution.
#[derive(Debug, Clone)]
pub enum Event {
    /// The pipeline began executing.
    PipelineStart { trace_id: Uuid },
    /// A step began executing.
    StepStart { trace_id: Uuid, step: StepMetrics },
    /// A step's counters advanced (emitted on item boundaries).
    StepProgress { trace_id: Uuid, step: StepMetrics },
    /// A step finished successfully.
    StepComplete { trace_id: Uuid, step: StepMetrics },
    /// A step failed fatally.
    StepError { trace_id: Uuid, step: StepMetrics, error: StreamError },
    /// One item finished processing (successfully or not).
    ItemProcessed { trace_id: Uuid, step_name: Arc<str>, item_index: usize },
    /// One item was yielded downstream.
    ItemYielded { trace_id: Uuid, step_name: Arc<str>, item_index: usize },
    /// The pipeline finished with no fatal error.
    PipelineComplete { trace_id: Uuid, progress: OverallProgress },
    /// The pipeline finished with a fatal error.
    PipelineError { trace_id: Uuid, progress: OverallProgress, error: StreamError },
}

/// A subscriber callback. Boxed so the bus can hold a heterogeneous list of
/// closures and function pointers alike.
pub type Listener = Box<dyn Fn(&Event) + Send + Sync>;

/// Dispatches [`Event`]s to every registered [`Listener`], isolating panics
/// so one broken listener can't take down the others or the pipeline run
/// that's reporting the event.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener`, returning nothing — this crate does not
    /// support unsubscription, since listeners are expected to live for the
    /// duration of the run that registered them.
    pub fn subscribe(&self, listener: Listener) {
        self.listeners.write().push(listener);
    }

    /// Calls every registered listener with `event`, catching and
    /// discarding any panic a listener raises.
    pub fn emit(&self, event: Event) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            let event_ref = &event;
            let result = catch_unwind(AssertUnwindSafe(|| listener(event_ref)));
            if result.is_err() {
                tracing::warn!("event listener panicked; continuing with remaining listeners");
            }
        }
    }

    /// Number of currently registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_listener_receives_every_event() {
        let bus = EventBus::new();
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));
        let (a, b) = (count_a.clone(), count_b.clone());
        bus.subscribe(Box::new(move |_event| {
            a.fetch_add(1, Ordering::SeqCst);
        }));
        bus.subscribe(Box::new(move |_event| {
            b.fetch_add(1, Ordering::SeqCst);
        }));

        bus.emit(Event::PipelineStart { trace_id: Uuid::new_v4() });
        bus.emit(Event::PipelineStart { trace_id: Uuid::new_v4() });

        assert_eq!(count_a.load(Ordering::SeqCst), 2);
        assert_eq!(count_b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn a_panicking_listener_does_not_stop_the_others() {
        let bus = EventBus::new();
        let survived = Arc::new(AtomicUsize::new(0));
        let survived2 = survived.clone();

        bus.subscribe(Box::new(|_event| panic!("listener is broken")));
        bus.subscribe(Box::new(move |_event| {
            survived2.fetch_add(1, Ordering::SeqCst);
        }));

        bus.emit(Event::PipelineStart { trace_id: Uuid::new_v4() });
        assert_eq!(survived.load(Ordering::SeqCst), 1);
    }
}
