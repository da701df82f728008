//! `warden-monitor`: metric thresholds and the alert lifecycle.
//!
//! Every monitoring tick the [`engine::MonitorEngine`] asks a
//! [`sampler::MetricSampler`] for each configured metric, classifies the
//! value with the [`threshold::ThresholdEvaluator`] and applies the verdict
//! to the [`alert::AlertStore`]. Only transitions (opened, escalated,
//! resolved) reach the notification dispatcher.
//!
//! Alerts resolve only once the value clears the opening threshold by the
//! hysteresis margin, so a value hovering at the boundary does not flap.

pub mod alert;
pub mod db;
pub mod engine;
pub mod error;
pub mod history;
pub mod sampler;
pub mod threshold;

pub use alert::{AlertStore, AlertSummary};
pub use engine::MonitorEngine;
pub use error::{MonitorError, Result, SamplingError};
pub use history::MetricHistory;
pub use sampler::MetricSampler;
pub use threshold::{ThresholdEvaluator, Verdict};
