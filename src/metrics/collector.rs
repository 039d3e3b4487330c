//! Per-step metadata collection: counts, a latency t-digest, and timestamps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::StreamError;
use crate::metrics::tdigest::TDigest;

/// Lifecycle state of a single pipeline step.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StepStatus {
    /// Not yet started.
    Pending,
    /// Currently pulling/processing items.
    Running,
    /// Finished with no fatal error.
    Completed,
    /// Finished due to a fatal error.
    Failed,
}

/// A point-in-time snapshot of one step's counters, suitable for display or
/// serialization; detached from the collector that produced it.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    /// The step's name, as given at build time.
    pub name: Arc<str>,
    /// The step's 0-based position in the pipeline.
    pub index: usize,
    /// Current lifecycle state.
    pub status: StepStatus,
    /// Items pulled from upstream.
    pub input_count: u64,
    /// Items yielded downstream.
    pub output_count: u64,
    /// Items currently being processed (parallel steps only).
    pub in_flight: u64,
    /// Configured maximum concurrency, `1` for non-parallel steps.
    pub concurrency_limit: usize,
    /// When this step first started processing.
    pub started_at: Option<Instant>,
    /// When this step finished (successfully or not).
    pub completed_at: Option<Instant>,
    /// Count of per-item errors observed.
    pub error_count: u64,
    /// The most recent per-item error, if any.
    pub last_error: Option<StreamError>,
    /// Exponential moving average of the input rate, items/second.
    pub input_rate_ema: f64,
    /// Exponential moving average of the output rate, items/second.
    pub output_rate_ema: f64,
}

impl StepMetrics {
    fn new(name: Arc<str>, index: usize, concurrency_limit: usize) -> Self {
        Self {
            name,
            index,
            status: StepStatus::Pending,
            input_count: 0,
            output_count: 0,
            in_flight: 0,
            concurrency_limit,
            started_at: None,
            completed_at: None,
            error_count: 0,
            last_error: None,
            input_rate_ema: 0.0,
            output_rate_ema: 0.0,
        }
    }

    /// `output_count / input_count`, `0.0` if nothing has been input yet.
    #[must_use]
    pub fn expansion_ratio(&self) -> f64 {
        if self.input_count == 0 {
            0.0
        } else {
            self.output_count as f64 / self.input_count as f64
        }
    }
}

struct CollectorState {
    metrics: StepMetrics,
    item_started_at: HashMap<usize, Instant>,
    latencies: TDigest,
    skipped_count: u64,
}

/// Records per-item timestamps, outcome counters, and a latency sketch for
/// one step. Cheaply cloneable; every clone shares the same underlying
/// state, so an observer holding a clone always sees live data.
#[derive(Clone)]
pub struct MetadataCollector {
    trace_id: Uuid,
    state: Arc<Mutex<CollectorState>>,
}

impl MetadataCollector {
    /// Creates a collector for `step_name` at `index`, with a concurrency
    /// limit of `1` for non-parallel steps.
    #[must_use]
    pub fn new(step_name: impl Into<Arc<str>>, index: usize, concurrency_limit: usize, trace_id: Uuid) -> Self {
        Self {
            trace_id,
            state: Arc::new(Mutex::new(CollectorState {
                metrics: StepMetrics::new(step_name.into(), index, concurrency_limit),
                item_started_at: HashMap::new(),
                latencies: TDigest::new(),
                skipped_count: 0,
            })),
        }
    }

    /// The run-stable trace id this collector's items are stamped with.
    #[must_use]
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    /// Marks the step as running and records its start time, if not already set.
    pub fn step_started(&self) {
        let mut state = self.state.lock();
        if state.metrics.started_at.is_none() {
            state.metrics.started_at = Some(Instant::now());
        }
        state.metrics.status = StepStatus::Running;
    }

    /// Records that `item_index` began processing.
    pub fn item_started(&self, item_index: usize) {
        let mut state = self.state.lock();
        state.item_started_at.insert(item_index, Instant::now());
        state.metrics.input_count += 1;
        state.metrics.in_flight += 1;
    }

    /// Records that `item_index` finished successfully.
    pub fn item_succeeded(&self, item_index: usize) {
        let mut state = self.state.lock();
        let duration_ms = state
            .item_started_at
            .remove(&item_index)
            .map(|start| start.elapsed().as_millis() as f64)
            .unwrap_or(0.0);
        state.latencies.insert(duration_ms);
        state.metrics.output_count += 1;
        state.metrics.in_flight = state.metrics.in_flight.saturating_sub(1);
    }

    /// Records that `item_index` failed with `error`.
    pub fn item_failed(&self, item_index: usize, error: StreamError) {
        let mut state = self.state.lock();
        state.item_started_at.remove(&item_index);
        state.metrics.error_count += 1;
        state.metrics.last_error = Some(error);
        state.metrics.in_flight = state.metrics.in_flight.saturating_sub(1);
    }

    /// Records that `item_index` was dropped by the error strategy without
    /// being counted as an output.
    pub fn item_skipped(&self, item_index: usize) {
        let mut state = self.state.lock();
        state.item_started_at.remove(&item_index);
        state.skipped_count += 1;
        state.metrics.in_flight = state.metrics.in_flight.saturating_sub(1);
    }

    /// Updates the current in-flight count directly, for parallel steps
    /// that track concurrency outside of per-item start/end calls.
    pub fn set_in_flight(&self, in_flight: u64) {
        self.state.lock().metrics.in_flight = in_flight;
    }

    /// Marks the step as completed (or failed, if `failed` is true) and
    /// records its completion time.
    pub fn step_finished(&self, failed: bool) {
        let mut state = self.state.lock();
        state.metrics.completed_at = Some(Instant::now());
        state.metrics.status = if failed { StepStatus::Failed } else { StepStatus::Completed };
    }

    /// Total items skipped by the error strategy (not reflected in
    /// `output_count`).
    #[must_use]
    pub fn skipped_count(&self) -> u64 {
        self.state.lock().skipped_count
    }

    /// Returns the latency sketch's estimate at quantile `q`, in milliseconds.
    #[must_use]
    pub fn latency_quantile(&self, q: f64) -> Option<f64> {
        self.state.lock().latencies.quantile(q)
    }

    /// Returns a detached snapshot of this step's counters.
    #[must_use]
    pub fn snapshot(&self) -> StepMetrics {
        self.state.lock().metrics.clone()
    }

    /// Directly overwrites the EMA fields on the underlying snapshot — used
    /// by [`crate::metrics::progress::ProgressTracker`], which owns the EMA
    /// computation itself.
    pub(crate) fn set_rate_emas(&self, input_rate_ema: f64, output_rate_ema: f64) {
        let mut state = self.state.lock();
        state.metrics.input_rate_ema = input_rate_ema;
        state.metrics.output_rate_ema = output_rate_ema;
    }
}
