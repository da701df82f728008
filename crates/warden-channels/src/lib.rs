//! `warden-channels`: alert notification delivery.
//!
//! A [`NotificationDispatcher`] owns one lane per [`NotificationChannel`]:
//! a bounded queue plus a worker that retries transient failures with
//! bounded exponential backoff. Submitting never blocks the monitor.

pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod log;
pub mod retry;
pub mod webhook;

pub use channel::NotificationChannel;
pub use dispatcher::{DispatcherWorkers, LaneStats, NotificationDispatcher};
pub use error::{ChannelError, DeliveryError, Result};
pub use log::LogChannel;
pub use retry::RetryPolicy;
pub use webhook::WebhookChannel;
