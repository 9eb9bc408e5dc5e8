// Adaptive chunk sizing for file transfers. One instance per transfer;
// callers never interleave record() and chunk_size() concurrently.
use std::time::Duration;

pub(crate) const MIN_CHUNK_SIZE: usize = 64;
pub(crate) const MAX_CHUNK_SIZE: usize = 4096;
const EMA_ALPHA: f64 = 0.3;
/// Adjustment rules stay dormant until this many samples are in.
const WARMUP_SAMPLES: u32 = 5;
const GROW_THRESHOLD: f64 = 0.95;
const RESET_THRESHOLD: f64 = 0.5;
const SHRINK_THRESHOLD: f64 = 0.8;

/// Tracks per-transfer throughput and steers the chunk size inside
/// `[64, 4096]`, never below the initial size on a shrink.
#[derive(Debug)]
pub(crate) struct ChunkOptimizer {
    size: usize,
    initial: usize,
    ema_bps: f64,
    samples: u32,
    last_bytes: usize,
    last_duration: Duration,
}

impl ChunkOptimizer {
    pub(crate) fn new(initial: usize) -> Self {
        let initial = initial.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        Self {
            size: initial,
            initial,
            ema_bps: 0.0,
            samples: 0,
            last_bytes: 0,
            last_duration: Duration::ZERO,
        }
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.size
    }

    /// The most recent sample fed through [`record`](Self::record).
    pub(crate) fn last_sample(&self) -> (usize, Duration) {
        (self.last_bytes, self.last_duration)
    }

    /// Feeds one transfer measurement and reconsiders the chunk size.
    pub(crate) fn record(&mut self, bytes: usize, duration: Duration) {
        let bps = bytes as f64 / duration.as_secs_f64().max(1e-6);
        self.samples += 1;
        self.last_bytes = bytes;
        self.last_duration = duration;
        self.ema_bps = if self.samples == 1 {
            bps
        } else {
            EMA_ALPHA * bps + (1.0 - EMA_ALPHA) * self.ema_bps
        };

        if self.samples >= WARMUP_SAMPLES {
            if bps > GROW_THRESHOLD * self.ema_bps && self.size < MAX_CHUNK_SIZE {
                self.size = (self.size + (self.size / 4).max(MIN_CHUNK_SIZE)).min(MAX_CHUNK_SIZE);
            } else if bps < RESET_THRESHOLD * self.ema_bps {
                self.size = self.initial;
            } else if bps < SHRINK_THRESHOLD * self.ema_bps && self.size > self.initial {
                self.size = self
                    .size
                    .saturating_sub((self.size / 4).max(32))
                    .max(self.initial);
            }
        }
        self.size = self.size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    }
}
