#![deny(unsafe_code)]

//! Layered configuration for the polybus orchestrator.
//!
//! Sources, lowest precedence first:
//! 1. `/etc/polybus/polybus.{toml,json,...}`
//! 2. `./polybus.{toml,json,...}`
//! 3. the file named by [`Options::cfg_name`]
//! 4. `POLYBUS__<SECTION>__<KEY>` environment variables
//!
//! Durations are written as human-readable strings ("10ms", "30s", "1m").

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use config::{Config, File};
use serde::Deserialize;

use polybus_utils::deserialize_duration;

pub use self::logging::Log;

pub mod logging;

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub broker: Broker,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub performance: Performance,
    #[serde(default)]
    pub circuit_breaker: CircuitBreaker,
    #[serde(default)]
    pub log: Log,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    #[inline]
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    #[inline]
    fn from(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/polybus/polybus").required(false))
            .add_source(File::with_name("polybus").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("polybus").prefix_separator("__").separator("__").try_parsing(true),
        );

        let mut inner: Inner = builder.build()?.try_deserialize()?;
        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    /// Interval between two drain ticks of the orchestrator.
    ///
    /// Brokers with persistence enabled are drained on the coarser interval.
    #[inline]
    pub fn drain_interval(&self) -> Duration {
        if self.features.persistence {
            self.performance.persistent_drain_interval
        } else {
            self.performance.drain_interval
        }
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("broker type is {}", self.broker.typ);
        log::info!("features is {:?}", self.features);
        log::info!("drain interval is {:?}", self.drain_interval());
        log::info!("max queue size is {}", self.performance.max_queue_size);
        log::info!("circuit breaker config is: {:?}", self.circuit_breaker);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Config filename
    pub cfg_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Broker {
    //Broker type tag, e.g. "memory", "redis", "kafka", "nats".
    #[serde(rename = "type", default = "Broker::typ_default")]
    pub typ: String,
    //Connection parameters, passed through to the adapter untouched.
    #[serde(default)]
    pub connection: HashMap<String, String>,
}

impl Default for Broker {
    #[inline]
    fn default() -> Self {
        Self { typ: Self::typ_default(), connection: HashMap::default() }
    }
}

impl Broker {
    fn typ_default() -> String {
        "memory".into()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Features {
    #[serde(default)]
    pub persistence: bool,
    #[serde(default)]
    pub clustering: bool,
    #[serde(default)]
    pub partitioning: bool,
    #[serde(default)]
    pub durability: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Performance {
    #[serde(default = "Performance::batch_size_default")]
    pub batch_size: usize,
    #[serde(default = "Performance::flush_interval_default", deserialize_with = "deserialize_duration")]
    pub flush_interval: Duration,
    #[serde(default = "Performance::max_retries_default")]
    pub max_retries: usize,
    #[serde(default = "Performance::retry_delay_default", deserialize_with = "deserialize_duration")]
    pub retry_delay: Duration,
    //Upper bound for a single adapter call made by the orchestrator.
    #[serde(default = "Performance::timeout_default", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    //Live queue capacity per topic, overflow goes to the dead-letter store.
    #[serde(default = "Performance::max_queue_size_default")]
    pub max_queue_size: usize,
    #[serde(default = "Performance::drain_interval_default", deserialize_with = "deserialize_duration")]
    pub drain_interval: Duration,
    #[serde(
        default = "Performance::persistent_drain_interval_default",
        deserialize_with = "deserialize_duration"
    )]
    pub persistent_drain_interval: Duration,
    //Broker metrics polling interval.
    #[serde(default = "Performance::metrics_interval_default", deserialize_with = "deserialize_duration")]
    pub metrics_interval: Duration,
}

impl Default for Performance {
    #[inline]
    fn default() -> Self {
        Self {
            batch_size: Self::batch_size_default(),
            flush_interval: Self::flush_interval_default(),
            max_retries: Self::max_retries_default(),
            retry_delay: Self::retry_delay_default(),
            timeout: Self::timeout_default(),
            max_queue_size: Self::max_queue_size_default(),
            drain_interval: Self::drain_interval_default(),
            persistent_drain_interval: Self::persistent_drain_interval_default(),
            metrics_interval: Self::metrics_interval_default(),
        }
    }
}

impl Performance {
    fn batch_size_default() -> usize {
        100
    }
    fn flush_interval_default() -> Duration {
        Duration::from_secs(1)
    }
    fn max_retries_default() -> usize {
        3
    }
    fn retry_delay_default() -> Duration {
        Duration::from_secs(1)
    }
    fn timeout_default() -> Duration {
        Duration::from_secs(5)
    }
    fn max_queue_size_default() -> usize {
        10_000
    }
    fn drain_interval_default() -> Duration {
        Duration::from_millis(10)
    }
    fn persistent_drain_interval_default() -> Duration {
        Duration::from_millis(100)
    }
    fn metrics_interval_default() -> Duration {
        Duration::from_secs(30)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreaker {
    #[serde(default = "CircuitBreaker::failure_threshold_default")]
    pub failure_threshold: usize,
    #[serde(default = "CircuitBreaker::recovery_timeout_default", deserialize_with = "deserialize_duration")]
    pub recovery_timeout: Duration,
    //How often the health check samples breaker state, transitions are unaffected.
    #[serde(default = "CircuitBreaker::monitoring_period_default", deserialize_with = "deserialize_duration")]
    pub monitoring_period: Duration,
}

impl Default for CircuitBreaker {
    #[inline]
    fn default() -> Self {
        Self {
            failure_threshold: Self::failure_threshold_default(),
            recovery_timeout: Self::recovery_timeout_default(),
            monitoring_period: Self::monitoring_period_default(),
        }
    }
}

impl CircuitBreaker {
    fn failure_threshold_default() -> usize {
        5
    }
    fn recovery_timeout_default() -> Duration {
        Duration::from_secs(60)
    }
    fn monitoring_period_default() -> Duration {
        Duration::from_secs(10)
    }
}
