use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use warden_core::types::MetricSample;

/// Bounded ring buffer of recent samples across all metrics.
///
/// The oldest sample is evicted once `capacity` is reached. Samples pushed
/// since the last [`take_unsaved`](Self::take_unsaved) are kept aside for
/// the repository, under the same bound.
#[derive(Debug)]
pub struct MetricHistory {
    capacity: usize,
    inner: Mutex<Buffers>,
}

#[derive(Debug)]
struct Buffers {
    samples: VecDeque<MetricSample>,
    unsaved: VecDeque<MetricSample>,
}

fn push_bounded(buf: &mut VecDeque<MetricSample>, capacity: usize, sample: MetricSample) {
    if buf.len() == capacity {
        buf.pop_front();
    }
    buf.push_back(sample);
}

impl MetricHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Buffers {
                samples: VecDeque::with_capacity(capacity),
                unsaved: VecDeque::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, sample: MetricSample) {
        let mut inner = self.inner.lock().expect("metric history poisoned");
        push_bounded(&mut inner.unsaved, self.capacity, sample.clone());
        push_bounded(&mut inner.samples, self.capacity, sample);
    }

    /// Load samples saved by a previous process, oldest first. They are not
    /// reported as unsaved.
    pub fn restore(&self, saved: Vec<MetricSample>) -> usize {
        let mut inner = self.inner.lock().expect("metric history poisoned");
        let n = saved.len();
        for sample in saved {
            push_bounded(&mut inner.samples, self.capacity, sample);
        }
        n
    }

    /// Drain the samples pushed since the last call.
    pub fn take_unsaved(&self) -> Vec<MetricSample> {
        let mut inner = self.inner.lock().expect("metric history poisoned");
        inner.unsaved.drain(..).collect()
    }

    /// Samples taken at or after `cutoff`, oldest first.
    pub fn since(&self, cutoff: DateTime<Utc>) -> Vec<MetricSample> {
        let inner = self.inner.lock().expect("metric history poisoned");
        inner.samples.iter().filter(|s| s.at >= cutoff).cloned().collect()
    }

    /// Most recent sample of `metric`.
    pub fn latest(&self, metric: &str) -> Option<MetricSample> {
        let inner = self.inner.lock().expect("metric history poisoned");
        inner.samples.iter().rev().find(|s| s.metric == metric).cloned()
    }

    /// Time of the newest sample of any metric.
    pub fn last_collection(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().expect("metric history poisoned");
        inner.samples.iter().map(|s| s.at).max()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("metric history poisoned").samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
