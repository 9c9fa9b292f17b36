//! Logged metric values

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One value logged for a metric key.
///
/// Publishing logs every key once at step 0. The step is kept so records
/// line up with trackers that model metrics as series.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRecord {
    run_id: String,
    key: String,
    value: f64,
    step: u64,
    logged_at: DateTime<Utc>,
}

impl MetricRecord {
    /// Value logged now.
    #[must_use]
    pub fn new(run_id: impl Into<String>, key: impl Into<String>, step: u64, value: f64) -> Self {
        Self {
            run_id: run_id.into(),
            key: key.into(),
            value,
            step,
            logged_at: Utc::now(),
        }
    }

    /// Owning run.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Metric key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Logged value.
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// Series position.
    #[must_use]
    pub const fn step(&self) -> u64 {
        self.step
    }

    /// Logging time as epoch milliseconds (tracker wire format).
    #[must_use]
    pub fn logged_at_millis(&self) -> i64 {
        self.logged_at.timestamp_millis()
    }
}
