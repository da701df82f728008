//! `warden-core`: shared domain types and configuration for the warden daemon.
//!
//! Everything that more than one subsystem needs to agree on lives here:
//! schedule and task-kind definitions, the severity table vocabulary, alert
//! records and the events emitted when they change, and [`config::WardenConfig`].

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::WardenConfig;
pub use error::{Result, WardenError};
pub use types::{
    Alert, AlertEvent, AlertEventKind, AlertState, Comparison, MetricSample, ScheduleSpec,
    Severity, TaskKind, Threshold, CONNECTIVITY_METRIC,
};
