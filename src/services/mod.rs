//! Services - monitoring logic and state management
//!
//! - `directory` - Cached crossing directory with single-flight refresh and backoff
//! - `evaluator` - Nearest-crossing selection, ETA and proximity gate
//! - `publisher` - Live session lifecycle (create/update/end, grace, dedup)
//! - `orchestrator` - Trigger coalescing and the evaluation cycle

pub mod directory;
pub mod evaluator;
pub mod orchestrator;
pub mod publisher;

// Re-export commonly used types
pub use directory::{CrossingDirectory, FetchFailure};
pub use evaluator::ProximityEvaluator;
pub use orchestrator::{CycleOutcome, MonitorCommand, MonitorOrchestrator, SkipReason};
pub use publisher::{LiveSessionPublisher, PublishOutcome};
