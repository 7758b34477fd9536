//! In-process metric sink.
//!
//! Components register named metrics with a set of labels and update them lock-free. The
//! registry can be snapshotted at any time, e.g. by the inspection API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

pub const CONTAINER_COUNT: &str = "container_count";
pub const ADD_CONTAINER: &str = "add_container";
pub const REMOVE_CONTAINER: &str = "remove_container";
pub const UPDATE_CONTAINER: &str = "update_container";
pub const OPEN_COUNT: &str = "open_count";
pub const CLOSE_COUNT: &str = "close_count";
pub const FILE_SIZE: &str = "file_size";
pub const FILE_ROTATE: &str = "file_rotate";
pub const READ_COUNT: &str = "read_count";
pub const READ_SIZE: &str = "read_size";
pub const LOG_PROCESS_LATENCY: &str = "log_process_latency";

#[derive(Debug, Default)]
pub struct Counter(AtomicI64);

impl Counter {
    pub fn add(&self, v: i64) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Running average of all recorded samples.
#[derive(Debug, Default)]
pub struct Average {
    sum: AtomicI64,
    count: AtomicI64,
}

impl Average {
    pub fn add(&self, v: i64) {
        self.sum.fetch_add(v, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / count as f64
    }
}

/// Mean latency in microseconds over all observations.
#[derive(Debug, Default)]
pub struct Latency {
    total_nanos: AtomicU64,
    count: AtomicU64,
}

impl Latency {
    pub fn observe(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mean_micros(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_nanos.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
    }
}

#[derive(Debug, Clone)]
enum Metric {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Average(Arc<Average>),
    Latency(Arc<Latency>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MetricKey {
    name: String,
    labels: BTreeMap<String, String>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_owned(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }
}

/// One exported metric value.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MetricSample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    metrics: DashMap<MetricKey, Metric>,
}

macro_rules! get_or_register {
    ($self:ident, $name:ident, $labels:ident, $variant:ident, $ty:ty) => {{
        let key = MetricKey::new($name, $labels);
        let entry = $self
            .metrics
            .entry(key)
            .or_insert_with(|| Metric::$variant(Arc::new(<$ty>::default())));
        match entry.value() {
            Metric::$variant(m) => Arc::clone(m),
            other => {
                log::warn!(
                    "metric `{}` already registered as {:?}, returning a detached one",
                    $name,
                    other
                );
                Arc::new(<$ty>::default())
            }
        }
    }};
}

impl MetricsRegistry {
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> Arc<Counter> {
        get_or_register!(self, name, labels, Counter, Counter)
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Arc<Gauge> {
        get_or_register!(self, name, labels, Gauge, Gauge)
    }

    pub fn average(&self, name: &str, labels: &[(&str, &str)]) -> Arc<Average> {
        get_or_register!(self, name, labels, Average, Average)
    }

    pub fn latency(&self, name: &str, labels: &[(&str, &str)]) -> Arc<Latency> {
        get_or_register!(self, name, labels, Latency, Latency)
    }

    /// Drops every metric carrying all of `labels`, e.g. the metrics of a stopped reader.
    pub fn remove_labeled(&self, labels: &[(&str, &str)]) {
        self.metrics.retain(|key, _| {
            !labels
                .iter()
                .all(|(k, v)| key.labels.get(*k).map(String::as_str) == Some(*v))
        });
    }

    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut out: Vec<MetricSample> = self
            .metrics
            .iter()
            .map(|entry| {
                let value = match entry.value() {
                    Metric::Counter(m) => m.get() as f64,
                    Metric::Gauge(m) => m.get() as f64,
                    Metric::Average(m) => m.get(),
                    Metric::Latency(m) => m.mean_micros(),
                };
                MetricSample {
                    name: entry.key().name.clone(),
                    labels: entry.key().labels.clone(),
                    value,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }
}
