//! Forecast change alerting
//!
//! Compares consecutive snapshots, filters changes already notified, and
//! delivers the rest. The orchestrator ties fetching, storage, detection and
//! notification together for one location at a time, and keeps the storms
//! found in each new snapshot for tracking.

pub mod detect;
pub mod notify;
pub mod orchestrator;
pub mod storms;

pub use detect::{ChangeDetector, Detection, Thresholds};
pub use notify::{
    AlertMessage, CommandNotifier, ConfiguredNotifier, ConsoleNotifier, LogNotifier, MessageLimits,
    Notifier,
};
pub use orchestrator::{
    FailureReason, Orchestrator, OrchestratorSettings, PassOutcome, PassState, RunSummary,
};
pub use storms::identify_storms;
