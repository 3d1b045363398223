//! Runtime counters of one orchestrator
//!
//! `queued` and `dead_lettered` are gauges that follow the queue contents,
//! the remaining counters only grow. Every counter also records its
//! high-water mark.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::utils::Counter;

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct Stats {
    pub queued: Counter,
    pub dead_lettered: Counter,
    pub published: Counter,
    pub publish_failures: Counter,
    pub delivered: Counter,
    pub delivery_failures: Counter,
    pub retries: Counter,
    pub retries_exhausted: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "queued.count": self.queued.count(),
            "queued.max": self.queued.max(),
            "dead_lettered.count": self.dead_lettered.count(),
            "dead_lettered.max": self.dead_lettered.max(),
            "published.count": self.published.count(),
            "publish_failures.count": self.publish_failures.count(),
            "delivered.count": self.delivered.count(),
            "delivery_failures.count": self.delivery_failures.count(),
            "retries.count": self.retries.count(),
            "retries_exhausted.count": self.retries_exhausted.count(),
        })
    }
}
