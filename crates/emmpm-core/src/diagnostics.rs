//! Run diagnostics: timing and convergence metrics for each EM iteration.
//!
//! These diagnostics are permanent instrumentation intended for
//! parameter tuning. Every [`EmDriver`](crate::driver::EmDriver) run
//! collects diagnostics alongside the segmentation result.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single segmentation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentationDiagnostics {
    /// Wall-clock duration of the unconditional pilot sampler run
    /// (including penalty initialization), in seconds.
    #[serde(with = "duration_serde")]
    pub pilot_duration: Duration,
    /// One record per completed EM iteration, in order.
    pub iterations: Vec<EmIterationDiagnostics>,
    /// Total wall-clock duration of the entire run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
}

/// Metrics for one EM iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmIterationDiagnostics {
    /// Wall-clock duration of this iteration (seconds), covering the
    /// statistics update, penalties, and the sampler passes.
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Mean-squared drift of means and variances since the previous
    /// iteration.
    pub mse: f64,
    /// Live class count after elimination.
    pub classes: usize,
    /// Inverse temperature used by this iteration's sampler passes.
    pub kappa: f64,
}

impl SegmentationDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Segmentation Diagnostics\n{}", "=".repeat(60)));
        lines.push(format!(
            "Pilot: {:.3}ms  |  Total: {:.3}ms  |  EM iterations: {}",
            duration_ms(self.pilot_duration),
            duration_ms(self.total_duration),
            self.iterations.len(),
        ));
        lines.push(String::new());
        lines.push(format!(
            "{:<6} {:>10} {:>12} {:>8} {:>8}",
            "Iter", "Duration", "MSE", "Classes", "Kappa"
        ));
        lines.push("-".repeat(50));

        for (k, iter) in self.iterations.iter().enumerate() {
            lines.push(format!(
                "{k:<6} {:>8.3}ms {:>12.4e} {:>8} {:>8.3}",
                duration_ms(iter.duration),
                iter.mse,
                iter.classes,
                iter.kappa,
            ));
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
