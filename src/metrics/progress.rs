//! Pipeline-wide progress tracking: step lifecycle, throughput EMAs, and ETA.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::clock::TimeSource;
use crate::error::StreamError;
use crate::metrics::collector::{MetadataCollector, StepMetrics, StepStatus};

const EMA_ALPHA: f64 = 0.3;
const EMA_WINDOW: Duration = Duration::from_secs(1);
/// A `Running` step's contribution to overall progress is capped at this
/// fraction of a single step's share, to avoid a near-complete-looking
/// signal spiking right as a long step starts.
const RUNNING_STEP_CAP: f64 = 0.9;

/// A point-in-time summary of the whole pipeline run.
#[derive(Debug, Clone)]
pub struct OverallProgress {
    /// Total number of steps in the pipeline.
    pub total_steps: usize,
    /// Steps that have reached a terminal state.
    pub completed_steps: usize,
    /// Index of the step currently running (or last run).
    pub current_step_index: usize,
    /// Name of the step currently running (or last run).
    pub current_step_name: Arc<str>,
    /// Fraction of the pipeline estimated complete, in `[0, 1]`.
    pub progress_ratio: f64,
    /// Estimated time remaining, in milliseconds.
    pub estimated_remaining_ms: u64,
    /// Wall-clock time elapsed since the run started, in milliseconds.
    pub elapsed_ms: u64,
    /// Total items processed (summed output across all steps so far).
    pub total_items_processed: u64,
    /// Overall items/second across the run so far.
    pub average_throughput: f64,
    /// When the run started.
    pub started_at: Instant,
    /// When the run finished, if it has.
    pub completed_at: Option<Instant>,
    /// Whether every step finished without a fatal error.
    pub is_complete: bool,
    /// Whether any step has failed fatally.
    pub has_failed: bool,
    /// Total per-item errors observed across all steps.
    pub total_errors: u64,
}

struct RateTracker {
    last_sample_at: Instant,
    last_count: u64,
    ema: f64,
}

impl RateTracker {
    fn new(now: Instant) -> Self {
        Self {
            last_sample_at: now,
            last_count: 0,
            ema: 0.0,
        }
    }

    fn observe(&mut self, now: Instant, total_count: u64) {
        let elapsed = now.saturating_duration_since(self.last_sample_at);
        if elapsed < EMA_WINDOW {
            return;
        }
        let delta_count = total_count.saturating_sub(self.last_count);
        let instantaneous = delta_count as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        self.ema = EMA_ALPHA * instantaneous + (1.0 - EMA_ALPHA) * self.ema;
        self.last_sample_at = now;
        self.last_count = total_count;
    }
}

struct StepEntry {
    collector: MetadataCollector,
    input_rate: RateTracker,
    output_rate: RateTracker,
}

struct TrackerState {
    steps: Vec<StepEntry>,
    current_step_index: usize,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
    is_complete: bool,
    has_failed: bool,
}

/// Observes step lifecycle events for a whole pipeline run and derives
/// [`OverallProgress`] on demand.
///
/// An optional sampling rate `k` records only every k-th item event and
/// scales the recorded counts by `k`; this deliberately overestimates counts
/// for a final partial sample group, a known and accepted skew rather than a bug.
pub struct ProgressTracker {
    trace_id: Uuid,
    sampling_rate: Option<u64>,
    sample_counter: Mutex<u64>,
    time_source: TimeSource,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    /// Builds a tracker for `step_names`, in pipeline order.
    #[must_use]
    pub fn new(trace_id: Uuid, step_names: &[(Arc<str>, usize)], sampling_rate: Option<u64>) -> Self {
        Self::with_clock(trace_id, step_names, sampling_rate, TimeSource::default())
    }

    /// As [`ProgressTracker::new`], but with an injectable [`TimeSource`]
    /// for deterministic tests.
    #[must_use]
    pub fn with_clock(
        trace_id: Uuid,
        step_names: &[(Arc<str>, usize)],
        sampling_rate: Option<u64>,
        time_source: TimeSource,
    ) -> Self {
        let now = time_source.now();
        let steps = step_names
            .iter()
            .enumerate()
            .map(|(index, (name, concurrency_limit))| StepEntry {
                collector: MetadataCollector::new(name.clone(), index, *concurrency_limit, trace_id),
                input_rate: RateTracker::new(now),
                output_rate: RateTracker::new(now),
            })
            .collect();
        Self {
            trace_id,
            sampling_rate,
            sample_counter: Mutex::new(0),
            time_source,
            state: Mutex::new(TrackerState {
                steps,
                current_step_index: 0,
                started_at: None,
                completed_at: None,
                is_complete: false,
                has_failed: false,
            }),
        }
    }

    /// Returns the collector backing step `index`, for recording per-item
    /// outcomes.
    #[must_use]
    pub fn collector(&self, index: usize) -> MetadataCollector {
        self.state.lock().steps[index].collector.clone()
    }

    /// Appends a new step to the tracker, returning its index.
    ///
    /// Unlike [`ProgressTracker::new`]'s fixed upfront step list, this lets a
    /// builder register steps incrementally as they're chained.
    pub fn register_step(&self, name: impl Into<Arc<str>>, concurrency_limit: usize) -> usize {
        let now = self.time_source.now();
        let mut state = self.state.lock();
        let index = state.steps.len();
        state.steps.push(StepEntry {
            collector: MetadataCollector::new(name.into(), index, concurrency_limit, self.trace_id),
            input_rate: RateTracker::new(now),
            output_rate: RateTracker::new(now),
        });
        index
    }

    /// Marks the whole run as started.
    pub fn pipeline_started(&self) {
        let mut state = self.state.lock();
        if state.started_at.is_none() {
            state.started_at = Some(self.time_source.now());
        }
    }

    /// Marks step `index` as started and current.
    pub fn step_started(&self, index: usize) {
        let mut state = self.state.lock();
        state.current_step_index = index;
        state.steps[index].collector.step_started();
        tracing::debug!(step_index = index, "step started");
    }

    /// Returns whether this call should be recorded, given the configured
    /// sampling rate, and the scale factor to apply if so.
    fn should_sample(&self) -> Option<u64> {
        match self.sampling_rate {
            None => Some(1),
            Some(k) if k <= 1 => Some(1),
            Some(k) => {
                let mut counter = self.sample_counter.lock();
                *counter += 1;
                if *counter % k == 0 {
                    Some(k)
                } else {
                    None
                }
            }
        }
    }

    /// Records that an item was pulled into step `index`.
    pub fn record_item_processed(&self, index: usize) {
        let Some(scale) = self.should_sample() else {
            return;
        };
        let now = self.time_source.now();
        let mut state = self.state.lock();
        for _ in 0..scale {
            state.steps[index].collector.item_started(usize::MAX);
        }
        let count = state.steps[index].collector.snapshot().input_count;
        state.steps[index].input_rate.observe(now, count);
        drop(state);
        self.sync_rate_emas(index);
    }

    /// Records that an item was yielded from step `index`.
    pub fn record_item_yielded(&self, index: usize) {
        let Some(scale) = self.should_sample() else {
            return;
        };
        let now = self.time_source.now();
        let mut state = self.state.lock();
        for _ in 0..scale {
            state.steps[index].collector.item_succeeded(usize::MAX);
        }
        let count = state.steps[index].collector.snapshot().output_count;
        state.steps[index].output_rate.observe(now, count);
        drop(state);
        self.sync_rate_emas(index);
    }

    fn sync_rate_emas(&self, index: usize) {
        let state = self.state.lock();
        let input_ema = state.steps[index].input_rate.ema;
        let output_ema = state.steps[index].output_rate.ema;
        state.steps[index].collector.set_rate_emas(input_ema, output_ema);
    }

    /// Records the current in-flight count for step `index`.
    pub fn record_in_flight(&self, index: usize, in_flight: u64) {
        self.state.lock().steps[index].collector.set_in_flight(in_flight);
    }

    /// Records that step `index` failed on `item_index` with `error`.
    pub fn step_error(&self, index: usize, item_index: usize, error: StreamError) {
        self.state.lock().steps[index].collector.item_failed(item_index, error);
    }

    /// Marks step `index` as finished.
    pub fn step_completed(&self, index: usize, failed: bool) {
        let mut state = self.state.lock();
        state.steps[index].collector.step_finished(failed);
        if failed {
            state.has_failed = true;
        }
        if failed {
            tracing::warn!(step_index = index, "step finished with a failure");
        } else {
            tracing::debug!(step_index = index, "step finished");
        }
    }

    /// Marks the whole run as finished.
    pub fn pipeline_completed(&self, failed: bool) {
        let mut state = self.state.lock();
        state.completed_at = Some(self.time_source.now());
        state.is_complete = !failed;
        state.has_failed = state.has_failed || failed;
        if failed {
            tracing::error!("pipeline completed with a failure");
        } else {
            tracing::info!("pipeline completed");
        }
    }

    /// Computes the current [`OverallProgress`] snapshot.
    #[must_use]
    pub fn snapshot(&self) -> OverallProgress {
        let state = self.state.lock();
        let total_steps = state.steps.len().max(1);
        let started_at = state.started_at.unwrap_or_else(|| self.time_source.now());
        let now = state.completed_at.unwrap_or_else(|| self.time_source.now());
        let elapsed_ms = now.saturating_duration_since(started_at).as_millis() as u64;

        let mut completed_steps = 0usize;
        let mut total_items_processed = 0u64;
        let mut total_errors = 0u64;
        let mut step_share_sum = 0.0f64;

        for entry in &state.steps {
            let snap = entry.collector.snapshot();
            total_items_processed += snap.output_count;
            total_errors += snap.error_count;
            match snap.status {
                StepStatus::Completed | StepStatus::Failed => {
                    completed_steps += 1;
                    step_share_sum += 1.0 / total_steps as f64;
                }
                StepStatus::Running => {
                    let within_step_ratio = if snap.input_count == 0 {
                        0.0
                    } else {
                        (snap.output_count as f64 / snap.input_count as f64).min(1.0)
                    };
                    let share = (within_step_ratio / total_steps as f64) * RUNNING_STEP_CAP;
                    step_share_sum += share.min(RUNNING_STEP_CAP / total_steps as f64);
                }
                StepStatus::Pending => {}
            }
        }

        // Only the terminal pipeline event may report full completion;
        // every step finishing is a necessary but not sufficient condition.
        let progress_ratio = if state.is_complete {
            1.0
        } else {
            step_share_sum.clamp(0.0, 0.999)
        };
        let estimated_remaining_ms = if progress_ratio > 0.0 {
            let total_estimate = elapsed_ms as f64 / progress_ratio;
            (total_estimate - elapsed_ms as f64).max(0.0) as u64
        } else {
            0
        };

        let average_throughput = if elapsed_ms > 0 {
            total_items_processed as f64 / (elapsed_ms as f64 / 1000.0)
        } else {
            0.0
        };

        let current_step_index = state.current_step_index.min(state.steps.len().saturating_sub(1));
        let current_step_name = state
            .steps
            .get(current_step_index)
            .map(|entry| entry.collector.snapshot().name)
            .unwrap_or_else(|| Arc::from(""));

        OverallProgress {
            total_steps: state.steps.len(),
            completed_steps,
            current_step_index,
            current_step_name,
            progress_ratio,
            estimated_remaining_ms,
            elapsed_ms,
            total_items_processed,
            average_throughput,
            started_at,
            completed_at: state.completed_at,
            is_complete: state.is_complete,
            has_failed: state.has_failed,
            total_errors,
        }
    }

    /// The trace id stamped across this run's metadata.
    #[must_use]
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<(Arc<str>, usize)> {
        names.iter().map(|n| (Arc::from(*n), 1)).collect()
    }

    #[test]
    fn progress_ratio_reaches_one_only_after_pipeline_completed() {
        let tracker = ProgressTracker::new(Uuid::new_v4(), &names(&["a", "b"]), None);
        tracker.pipeline_started();
        tracker.step_started(0);
        tracker.step_completed(0, false);
        tracker.step_started(1);
        tracker.step_completed(1, false);
        let before = tracker.snapshot();
        assert!(before.progress_ratio < 1.0 || before.is_complete);

        tracker.pipeline_completed(false);
        let after = tracker.snapshot();
        assert_eq!(after.progress_ratio, 1.0);
        assert!(after.is_complete);
    }

    #[test]
    fn completed_steps_count_is_monotone_non_decreasing() {
        let tracker = ProgressTracker::new(Uuid::new_v4(), &names(&["a", "b", "c"]), None);
        tracker.pipeline_started();
        let mut last = 0;
        for i in 0..3 {
            tracker.step_started(i);
            tracker.step_completed(i, false);
            let snap = tracker.snapshot();
            assert!(snap.completed_steps >= last);
            last = snap.completed_steps;
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn a_failed_step_is_reflected_in_has_failed() {
        let tracker = ProgressTracker::new(Uuid::new_v4(), &names(&["a"]), None);
        tracker.pipeline_started();
        tracker.step_started(0);
        tracker.step_error(0, 0, StreamError::validation("a", "boom"));
        tracker.step_completed(0, true);
        tracker.pipeline_completed(true);
        let snap = tracker.snapshot();
        assert!(snap.has_failed);
        assert_eq!(snap.total_errors, 1);
    }

    #[test]
    fn register_step_appends_and_returns_its_index() {
        let tracker = ProgressTracker::new(Uuid::new_v4(), &[], None);
        let first = tracker.register_step("a", 1);
        let second = tracker.register_step("b", 4);
        assert_eq!(first, 0);
        assert_eq!(second, 1);
        tracker.pipeline_started();
        tracker.step_started(first);
        tracker.step_completed(first, false);
        tracker.step_started(second);
        tracker.step_completed(second, false);
        let snap = tracker.snapshot();
        assert_eq!(snap.total_steps, 2);
        assert_eq!(snap.completed_steps, 2);
    }

    #[test]
    fn sampling_rate_scales_recorded_counts() {
        let tracker = ProgressTracker::new(Uuid::new_v4(), &names(&["a"]), Some(10));
        tracker.pipeline_started();
        tracker.step_started(0);
        for _ in 0..10 {
            tracker.record_item_processed(0);
        }
        let collector = tracker.collector(0);
        assert_eq!(collector.snapshot().input_count, 10);
    }
}
