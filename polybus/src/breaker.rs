use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::conf::CircuitBreaker as CircuitBreakerConf;
use crate::utils::{timestamp_millis, TimestampMillis};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failures: usize,
    pub failure_threshold: usize,
    pub rejected: usize,
    pub last_failure_at: Option<TimestampMillis>,
}

struct Inner {
    state: CircuitState,
    failures: usize,
    opened_at: Option<Instant>,
    rejected: usize,
    last_failure_at: Option<TimestampMillis>,
}

/// Consecutive-failure circuit breaker.
///
/// Closed until `failure_threshold` failures in a row, then Open. An Open
/// breaker rejects calls with [`Error::CircuitOpen`] without running them
/// until `recovery_timeout` has elapsed, after which the next call is let through in
/// HalfOpen: success closes the breaker, failure reopens it and restarts the
/// timer.
pub struct CircuitBreaker {
    failure_threshold: usize,
    recovery_timeout: Duration,
    monitoring_period: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[inline]
    pub fn new(failure_threshold: usize, recovery_timeout: Duration, monitoring_period: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            monitoring_period,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                rejected: 0,
                last_failure_at: None,
            }),
        }
    }

    #[inline]
    pub fn from_conf(conf: &CircuitBreakerConf) -> Self {
        Self::new(conf.failure_threshold, conf.recovery_timeout, conf.monitoring_period)
    }

    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire()?;
        match op().await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    #[inline]
    fn acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.try_half_open(&mut inner);
        if inner.state == CircuitState::Open {
            inner.rejected += 1;
            Err(Error::CircuitOpen)
        } else {
            Ok(())
        }
    }

    #[inline]
    fn try_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && inner.opened_at.map(|at| at.elapsed() >= self.recovery_timeout).unwrap_or(true)
        {
            log::info!("circuit breaker half-open, letting a trial call through");
            inner.state = CircuitState::HalfOpen;
        }
    }

    #[inline]
    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                log::info!("circuit breaker closed");
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.opened_at = None;
            }
            //admitted before the breaker opened, only the recovery timeout may leave Open
            CircuitState::Open => {}
        }
    }

    #[inline]
    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.last_failure_at = Some(timestamp_millis());
        let open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if open {
            log::warn!("circuit breaker open, consecutive failures: {}", inner.failures);
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    ///Current state, an expired Open breaker reports HalfOpen
    #[inline]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.try_half_open(&mut inner);
        inner.state
    }

    #[inline]
    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock();
        self.try_half_open(&mut inner);
        BreakerStats {
            state: inner.state,
            failures: inner.failures,
            failure_threshold: self.failure_threshold,
            rejected: inner.rejected,
            last_failure_at: inner.last_failure_at,
        }
    }

    #[inline]
    pub fn monitoring_period(&self) -> Duration {
        self.monitoring_period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(60), Duration::from_secs(10))
    }

    async fn fail(b: &CircuitBreaker) -> Result<()> {
        b.execute(|| async { Err::<(), _>(Error::publish("t", "boom")) }).await
    }

    async fn ok(b: &CircuitBreaker) -> Result<u32> {
        b.execute(|| async { Ok(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_half_open_closed() {
        let b = breaker();
        for _ in 0..3 {
            assert!(matches!(fail(&b).await, Err(Error::Publish { .. })));
        }
        assert_eq!(b.state(), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let res = b
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(res.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.stats().rejected, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(ok(&b).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_resets_timer() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(matches!(fail(&b).await, Err(Error::Publish { .. })));
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(ok(&b).await.unwrap_err().is_circuit_open());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(ok(&b).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_an_open_breaker() {
        let b = breaker();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let slow = b.execute(move || async move {
            let _ = rx.await;
            Ok(1u32)
        });
        let open = async {
            for _ in 0..3 {
                let _ = fail(&b).await;
            }
            assert_eq!(b.state(), CircuitState::Open);
            let _ = tx.send(());
        };
        let (res, ()) = tokio::join!(slow, open);
        assert_eq!(res.unwrap(), 1);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(ok(&b).await.unwrap_err().is_circuit_open());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(ok(&b).await.is_ok());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let b = breaker();
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        ok(&b).await.unwrap();
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        let v = serde_json::to_value(b.stats()).unwrap();
        assert_eq!(v["state"], "OPEN");
        assert_eq!(v["failure_threshold"], 3);
    }
}
