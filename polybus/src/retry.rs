use std::time::Duration;

use crate::types::{DashMap, MessageId, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    ///Try again after `delay`, `attempt` counts from one
    Retry { attempt: usize, delay: Duration },
    ///Out of attempts, the counter has been dropped
    Exhausted { attempts: usize },
}

/// Exponential backoff, in memory only.
///
/// Counters are kept per delivery, a message id as seen by one subscription,
/// so subscribers of the same message never share a budget.
pub struct RetryPolicy {
    max_retries: usize,
    retry_delay: Duration,
    counters: DashMap<(SubscriptionId, MessageId), usize>,
}

impl RetryPolicy {
    #[inline]
    pub fn new(max_retries: usize, retry_delay: Duration) -> Self {
        Self { max_retries, retry_delay, counters: DashMap::default() }
    }

    #[inline]
    fn key(sub: &str, id: &str) -> (SubscriptionId, MessageId) {
        (sub.to_owned(), id.to_owned())
    }

    ///Records a failure of message `id` for subscription `sub`, the n-th retry
    ///(from zero) waits `retry_delay * 2^n`
    pub fn failed(&self, sub: &str, id: &str) -> RetryDecision {
        let key = Self::key(sub, id);
        let mut counter = self.counters.entry(key.clone()).or_insert(0);
        let done = *counter;
        if done >= self.max_retries {
            drop(counter);
            self.counters.remove(&key);
            return RetryDecision::Exhausted { attempts: done };
        }
        *counter += 1;
        let delay = self.retry_delay.saturating_mul(2u32.saturating_pow(done.min(31) as u32));
        RetryDecision::Retry { attempt: done + 1, delay }
    }

    #[inline]
    pub fn succeeded(&self, sub: &str, id: &str) {
        self.counters.remove(&Self::key(sub, id));
    }

    #[inline]
    pub fn attempts(&self, sub: &str, id: &str) -> usize {
        self.counters.get(&Self::key(sub, id)).map(|c| *c).unwrap_or_default()
    }

    ///Deliveries with a pending retry
    #[inline]
    pub fn pending(&self) -> usize {
        self.counters.len()
    }
}
