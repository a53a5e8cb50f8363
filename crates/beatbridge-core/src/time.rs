//! Timing utilities for BeatBridge
//!
//! Host time is expressed in microseconds since the Unix epoch. This is the
//! time base of `force-beat-at-time` commands and of the clock timeline.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timestamp type (microseconds)
pub type Timestamp = i64;

const MICROS_PER_MINUTE: f64 = 60_000_000.0;

/// Get current Unix timestamp in microseconds
pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as Timestamp
}

/// Beats elapsed over `micros` at `tempo` BPM
pub fn beats_in(micros: Timestamp, tempo: f64) -> f64 {
    micros as f64 * tempo / MICROS_PER_MINUTE
}

/// Microseconds taken by `beats` at `tempo` BPM
pub fn micros_for(beats: f64, tempo: f64) -> Timestamp {
    (beats * MICROS_PER_MINUTE / tempo).round() as Timestamp
}

/// Period of a fixed-rate timer running at `hz`
pub fn tick_interval(hz: u32) -> Duration {
    Duration::from_micros(1_000_000 / u64::from(hz.max(1)))
}
