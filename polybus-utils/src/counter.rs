use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;

/// Lock-free gauge that also remembers the highest value it has reached.
///
/// Lowering the gauge never lowers the recorded peak.
#[derive(Default)]
pub struct Counter {
    current: AtomicIsize,
    peak: AtomicIsize,
}

/// Point-in-time copy of a [`Counter`], also its serialized form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub count: isize,
    pub max: isize,
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    #[inline]
    pub fn add(&self, n: isize) {
        let now = self.current.fetch_add(n, Ordering::SeqCst) + n;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    #[inline]
    pub fn dec(&self) {
        self.sub(1);
    }

    #[inline]
    pub fn sub(&self, n: isize) {
        self.current.fetch_sub(n, Ordering::SeqCst);
    }

    #[inline]
    pub fn set(&self, n: isize) {
        self.current.store(n, Ordering::SeqCst);
        self.peak.fetch_max(n, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.current.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.peak.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot { count: self.count(), max: self.max() }
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!(self.snapshot())
    }
}

impl From<CounterSnapshot> for Counter {
    #[inline]
    fn from(s: CounterSnapshot) -> Self {
        Counter { current: AtomicIsize::new(s.count), peak: AtomicIsize::new(s.max) }
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        self.snapshot().into()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.snapshot(), f)
    }
}

impl Serialize for Counter {
    #[inline]
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(s)
    }
}

impl<'de> Deserialize<'de> for Counter {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        CounterSnapshot::deserialize(d).map(Into::into)
    }
}
