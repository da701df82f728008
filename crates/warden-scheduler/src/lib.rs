//! `warden-scheduler`: in-process task scheduler with SQLite-persisted state.
//!
//! # Overview
//!
//! Tasks are registered on a [`registry::TaskRegistry`] with a
//! [`ScheduleSpec`](types::ScheduleSpec) and a [`task::TaskFunction`]. The
//! [`engine::SchedulerEngine`] ticks every few seconds, admits every task
//! whose `next_run_at` has arrived and hands it to the
//! [`executor::TaskExecutor`], which runs at most `workers` functions at once.
//!
//! A task never overlaps itself: admission flips it from `Idle` to `Running`
//! atomically, and only completion flips it back.
//!
//! # Schedule variants
//!
//! | Variant    | Behaviour                                   |
//! |------------|---------------------------------------------|
//! | `Interval` | Repeat every N seconds after the last due time |
//! | `Daily`    | Fire at HH:MM UTC every day                 |
//! | `Weekly`   | Fire at HH:MM UTC on a specific weekday     |
//! | `Monthly`  | Fire at HH:MM UTC on a day of the month, clamped to short months |
//!
//! After downtime each overdue task runs once, then resumes its cadence.
//!
//! # Sharing the state database
//!
//! Only the holder of the store's lease ([`engine::SchedulerEngine::acquire_lease`])
//! writes task state. Other processes get a read-only view in which runs still
//! in flight elsewhere stay `Running`.

pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lease;
pub mod registry;
pub mod schedule;
pub mod task;
pub mod types;

pub use warden_core::clock;
pub use warden_core::clock::{Clock, ManualClock, SystemClock};
pub use engine::{SchedulerEngine, SchedulerHandle};
pub use error::{Result, SchedulerError};
pub use task::{TaskContext, TaskError, TaskFunction};
pub use types::{
    RunOutcome, RunTrigger, ScheduleSpec, TaskDefinition, TaskFailure, TaskSnapshot, TaskState,
};
