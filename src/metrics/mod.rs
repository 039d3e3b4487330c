//! Streaming observability: per-step metadata collection, pipeline-wide
//! progress tracking, a bounded-memory latency sketch, and a typed event bus.

pub mod collector;
pub mod events;
pub mod progress;
pub mod tdigest;

pub use collector::{MetadataCollector, StepMetrics, StepStatus};
pub use events::{Event, EventBus, Listener};
pub use progress::{OverallProgress, ProgressTracker};
pub use tdigest::TDigest;
