use std::collections::VecDeque;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::types::{HashMap, TimestampMillis};
use crate::utils::timestamp_millis;

pub const WINDOW_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerSnapshot {
    pub data: Value,
    pub captured_at: TimestampMillis,
}

/// Sliding latency windows per `{broker}.{operation}` key plus the latest
/// metrics snapshot reported by each broker.
#[derive(Default)]
pub struct PerformanceMonitor {
    samples: RwLock<HashMap<String, VecDeque<f64>>>,
    brokers: RwLock<HashMap<String, BrokerSnapshot>>,
}

impl PerformanceMonitor {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn key(operation: &str, broker: Option<&str>) -> String {
        match broker {
            Some(broker) => format!("{}.{}", broker, operation),
            None => operation.to_owned(),
        }
    }

    #[inline]
    pub fn record_latency(&self, operation: &str, value: f64, broker: Option<&str>) {
        let mut samples = self.samples.write();
        let window = samples.entry(Self::key(operation, broker)).or_default();
        if window.len() >= WINDOW_SIZE {
            window.pop_front();
        }
        window.push_back(value);
    }

    pub fn metrics(&self) -> HashMap<String, LatencySummary> {
        self.samples
            .read()
            .iter()
            .filter_map(|(key, window)| summarize(window).map(|s| (key.clone(), s)))
            .collect()
    }

    #[inline]
    pub fn latency(&self, key: &str) -> Option<LatencySummary> {
        self.samples.read().get(key).and_then(summarize)
    }

    #[inline]
    pub fn record_broker_metrics(&self, broker: &str, data: Value) {
        self.brokers
            .write()
            .insert(broker.to_owned(), BrokerSnapshot { data, captured_at: timestamp_millis() });
    }

    #[inline]
    pub fn broker_metrics(&self, broker: &str) -> Option<BrokerSnapshot> {
        self.brokers.read().get(broker).cloned()
    }
}

fn summarize(window: &VecDeque<f64>) -> Option<LatencySummary> {
    if window.is_empty() {
        return None;
    }
    let mut sorted = window.iter().copied().collect::<Vec<_>>();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let count = sorted.len();
    Some(LatencySummary {
        avg: sorted.iter().sum::<f64>() / count as f64,
        min: sorted[0],
        max: sorted[count - 1],
        count,
        p95: percentile(&sorted, 95.0),
        p99: percentile(&sorted, 99.0),
    })
}

///Nearest rank over an ascending, non-empty slice
#[inline]
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = (sorted.len() as f64 * p / 100.0).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
