//! Worker and relay configuration.
//!
//! Configuration is plain data: hosts build it in code or deserialize it
//! from whatever format they load settings from. Durations are expressed in
//! milliseconds on the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-worker batching configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchWorkerConfig {
    /// Flush a non-empty batch at least this often.
    #[serde(rename = "flush_interval_ms", with = "duration_ms")]
    pub flush_interval: Duration,

    /// Flush as soon as this many messages have accumulated. Capped at
    /// [`MAX_BATCH_SIZE`].
    #[serde(deserialize_with = "non_negative")]
    pub batch_size: usize,

    /// Broker subscription to read from. Empty means "whatever subscription
    /// the worker is given"; a worker rejects a name that differs from its
    /// subscription's.
    pub subscription: String,
}

impl Default for BatchWorkerConfig {
    /// All-zero configuration: size and interval come from the worker's
    /// defaults, the subscription from the worker's subscription.
    fn default() -> Self {
        Self {
            flush_interval: Duration::ZERO,
            batch_size: 0,
            subscription: String::new(),
        }
    }
}

impl BatchWorkerConfig {
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Replace zero size/interval with `defaults` and cap the batch size.
    ///
    /// The subscription is left alone; it is bound by the worker.
    pub fn normalized(mut self, defaults: &BatchWorkerConfig) -> Self {
        if self.batch_size == 0 {
            self.batch_size = if defaults.batch_size == 0 {
                DEFAULT_BATCH_SIZE
            } else {
                defaults.batch_size
            };
        }
        self.batch_size = self.batch_size.min(MAX_BATCH_SIZE);
        if self.flush_interval.is_zero() {
            self.flush_interval = if defaults.flush_interval.is_zero() {
                DEFAULT_FLUSH_INTERVAL
            } else {
                defaults.flush_interval
            };
        }
        self
    }

    /// Bind the configuration to the subscription the worker reads.
    ///
    /// An empty name takes `actual`. A different non-empty name is returned
    /// as the error.
    pub fn bound_to(mut self, actual: &str) -> Result<Self, String> {
        if self.subscription.is_empty() {
            self.subscription = actual.to_string();
            Ok(self)
        } else if self.subscription == actual {
            Ok(self)
        } else {
            Err(self.subscription)
        }
    }

    /// Capacity of the queue between the receive task and the batch loop.
    pub fn queue_capacity(&self) -> usize {
        self.batch_size.saturating_mul(2).max(1)
    }
}

/// Batch size used when neither the caller nor the worker sets one.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Largest accepted batch size; larger values are clamped.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Flush interval used when neither the caller nor the worker sets one.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);

/// Outbox relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
}

impl RelayConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

    pub fn with_interval(interval: Duration) -> Self {
        Self { interval }.normalized()
    }

    pub fn normalized(mut self) -> Self {
        if self.interval.is_zero() {
            self.interval = Self::DEFAULT_INTERVAL;
        }
        self
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
        }
    }
}

fn non_negative<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    let value = i64::deserialize(deserializer)?;
    Ok(usize::try_from(value).unwrap_or(0))
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    // Negative values mean "unset", same as zero.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = i64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms.max(0) as u64))
    }
}
