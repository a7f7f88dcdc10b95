//! Per-sweep timeline reconstruction from block-level device timing.
//!
//! Device timestamps are unwrapped onto a 64-bit microsecond axis so the
//! timeline stays monotonic across the 2^32 overflow of the device clock.
//! Frames without a timing footer fall back to host receipt time; those
//! timestamps carry [`TimeSource::Host`] and are never compared against
//! device time.
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::MAX_TIMING_SAMPLES;
use crate::protocol::BlockTiming;

/// `(end - start) mod 2^32`.
pub fn wrap_delta(start: u32, end: u32) -> u32 {
    end.wrapping_sub(start)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSource {
    Device,
    Host,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepTimestamp {
    pub micros: u64,
    pub source: TimeSource,
}

impl SweepTimestamp {
    pub fn device(micros: u64) -> Self {
        Self {
            micros,
            source: TimeSource::Device,
        }
    }

    pub fn host(micros: u64) -> Self {
        Self {
            micros,
            source: TimeSource::Host,
        }
    }

    /// Seconds elapsed since `origin`; `None` when the two come from
    /// different clocks.
    pub fn seconds_since(&self, origin: &SweepTimestamp) -> Option<f64> {
        if self.source != origin.source {
            return None;
        }
        Some((self.micros as f64 - origin.micros as f64) * 1e-6)
    }
}

/// Extends successive 32-bit clock readings into a monotonic 64-bit count.
/// Consecutive readings must be less than 2^32 microseconds apart.
#[derive(Clone, Debug, Default)]
pub struct ClockUnwrapper {
    last_raw: Option<u32>,
    extended: u64,
}

impl ClockUnwrapper {
    pub fn unwrap(&mut self, raw: u32) -> u64 {
        match self.last_raw {
            None => self.extended = raw as u64,
            Some(prev) => self.extended += wrap_delta(prev, raw) as u64,
        }
        self.last_raw = Some(raw);
        self.extended
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timing summary of one received block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlockTimingRecord {
    pub avg_interval_micros: u16,
    pub timing: Option<BlockTiming>,
    pub sweeps: usize,
    pub samples: usize,
    /// Device time between the previous block's end and this block's start.
    pub gap_micros: Option<u32>,
    pub received_micros: u64,
}

#[derive(Clone, Debug, Default)]
pub struct TimestampReconstructor {
    clock: ClockUnwrapper,
    last_end: Option<u32>,
    device_origin: Option<SweepTimestamp>,
    host_origin: Option<SweepTimestamp>,
    /// End of the last host-timed block; later blocks never start before it.
    host_end: Option<u64>,
    history: VecDeque<BlockTimingRecord>,
}

impl TimestampReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets everything; the next block starts a new capture timeline.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Timestamps for the `sweeps` sweeps of one block.
    ///
    /// With device timing sweep `i` lands at `start + i * elapsed / sweeps`
    /// where `elapsed` is the wrap-safe block duration. Without it sweep `i`
    /// lands at `base + i * samples_per_sweep * avg_interval`, where `base` is
    /// `received_micros` or the end of the previous host-timed block,
    /// whichever is later.
    pub fn sweep_timestamps(
        &mut self,
        timing: Option<BlockTiming>,
        avg_interval_micros: u16,
        sweeps: usize,
        samples_per_sweep: usize,
        received_micros: u64,
    ) -> Vec<SweepTimestamp> {
        self.record(timing, avg_interval_micros, sweeps, samples_per_sweep, received_micros);
        if sweeps == 0 {
            return Vec::new();
        }
        let stamps: Vec<SweepTimestamp> = match timing {
            Some(t) => {
                let base = self.clock.unwrap(t.start_micros);
                let elapsed = t.elapsed_micros() as u64;
                (0..sweeps as u64)
                    .map(|i| SweepTimestamp::device(base + i * elapsed / sweeps as u64))
                    .collect()
            }
            None => {
                let step = samples_per_sweep as u64 * avg_interval_micros as u64;
                let base = self.host_end.map_or(received_micros, |end| end.max(received_micros));
                self.host_end = Some(base + sweeps as u64 * step);
                (0..sweeps as u64)
                    .map(|i| SweepTimestamp::host(base + i * step))
                    .collect()
            }
        };
        if let Some(first) = stamps.first().copied() {
            let origin = match first.source {
                TimeSource::Device => &mut self.device_origin,
                TimeSource::Host => &mut self.host_origin,
            };
            origin.get_or_insert(first);
        }
        stamps
    }

    /// Seconds since the first sweep of this capture on the same clock.
    pub fn relative_seconds(&self, ts: &SweepTimestamp) -> Option<f64> {
        let origin = match ts.source {
            TimeSource::Device => self.device_origin?,
            TimeSource::Host => self.host_origin?,
        };
        ts.seconds_since(&origin)
    }

    pub fn history(&self) -> impl Iterator<Item = &BlockTimingRecord> {
        self.history.iter()
    }

    pub fn last_block(&self) -> Option<&BlockTimingRecord> {
        self.history.back()
    }

    /// Sample rate implied by the average intervals of recent blocks.
    pub fn effective_sample_rate_hz(&self) -> Option<f64> {
        let intervals: Vec<f64> = self
            .history
            .iter()
            .filter(|r| r.avg_interval_micros > 0)
            .map(|r| r.avg_interval_micros as f64)
            .collect();
        if intervals.is_empty() {
            return None;
        }
        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        Some(1e6 / mean)
    }

    pub fn mean_block_gap_micros(&self) -> Option<f64> {
        let gaps: Vec<f64> = self
            .history
            .iter()
            .filter_map(|r| r.gap_micros)
            .map(|g| g as f64)
            .collect();
        if gaps.is_empty() {
            None
        } else {
            Some(gaps.iter().sum::<f64>() / gaps.len() as f64)
        }
    }

    fn record(
        &mut self,
        timing: Option<BlockTiming>,
        avg_interval_micros: u16,
        sweeps: usize,
        samples_per_sweep: usize,
        received_micros: u64,
    ) {
        let gap_micros = match (self.last_end, timing) {
            (Some(prev_end), Some(t)) => Some(wrap_delta(prev_end, t.start_micros)),
            _ => None,
        };
        self.last_end = timing.map(|t| t.end_micros);
        if self.history.len() == MAX_TIMING_SAMPLES {
            self.history.pop_front();
        }
        self.history.push_back(BlockTimingRecord {
            avg_interval_micros,
            timing,
            sweeps,
            samples: sweeps * samples_per_sweep,
            gap_micros,
            received_micros,
        });
    }
}
