// Per-engine operation counters. Never shared between engine instances.
use std::time::{Duration, Instant};

const DURATION_EMA_ALPHA: f64 = 0.3;

/// A read-only snapshot of one engine's operation history. Updated on
/// every completed call regardless of outcome.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    /// Exponential moving average of execution wall-clock duration.
    pub average_duration: Duration,
    pub last_operation: Option<Instant>,
}

impl Metrics {
    pub(crate) fn record(&mut self, duration: Duration, success: bool) {
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.average_duration = if self.successes + self.failures == 1 {
            duration
        } else {
            let blended = DURATION_EMA_ALPHA * duration.as_secs_f64()
                + (1.0 - DURATION_EMA_ALPHA) * self.average_duration.as_secs_f64();
            Duration::from_secs_f64(blended)
        };
        self.last_operation = Some(Instant::now());
    }

    pub(crate) fn note_retry(&mut self) {
        self.retries += 1;
    }
}
