//! Scan-table planning.
//!
//! The validator and the hardware-table builder both go through
//! [`plan_entries`], so the entry count that gets validated is always the count
//! that gets programmed.
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::config::{MAX_SAMPLES_BUFFER, SCAN_TABLE_CAPACITY};
use crate::error::{Result, StreamError};
use crate::protocol::FrameLayout;
pub const USB_PACKET_SIZE: usize = 64;
pub const DEFAULT_TARGET_LATENCY: Duration = Duration::from_millis(50);
/// One hardware scan-table slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanEntry {
    Channel(u8),
    /// Reference read on the ground pin; its result is always discarded.
    Ground(u8),
}
impl ScanEntry {
    pub fn is_ground(&self) -> bool {
        matches!(self, ScanEntry::Ground(_))
    }
    pub fn pin(&self) -> u8 {
        match *self {
            ScanEntry::Channel(pin) | ScanEntry::Ground(pin) => pin,
        }
    }
}
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroundMode {
    #[default]
    Off,
    Pin(u8),
}
impl GroundMode {
    pub fn pin(self) -> Option<u8> {
        match self {
            GroundMode::Off => None,
            GroundMode::Pin(pin) => Some(pin),
        }
    }
    pub fn is_enabled(self) -> bool {
        self.pin().is_some()
    }
}
impl From<Option<u8>> for GroundMode {
    fn from(value: Option<u8>) -> Self {
        value.map_or(GroundMode::Off, GroundMode::Pin)
    }
}
/// Validated, ordered scan table for one sweep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanPlan {
    entries: Vec<ScanEntry>,
    samples_per_sweep: usize,
    repeat: u16,
    ground: GroundMode,
}
impl ScanPlan {
    pub fn entries(&self) -> &[ScanEntry] {
        &self.entries
    }
    pub fn scan_entries_per_sweep(&self) -> usize {
        self.entries.len()
    }
    pub fn samples_per_sweep(&self) -> usize {
        self.samples_per_sweep
    }
    pub fn ground_entries(&self) -> usize {
        self.entries.len() - self.samples_per_sweep
    }
    pub fn repeat(&self) -> u16 {
        self.repeat
    }
    pub fn ground(&self) -> GroundMode {
        self.ground
    }
}
/// Maximal runs of identical consecutive channel values.
struct Runs<'a> {
    rest: &'a [u8],
}
impl<'a> Iterator for Runs<'a> {
    type Item = &'a [u8];
    fn next(&mut self) -> Option<Self::Item> {
        let first = *self.rest.first()?;
        let len = self.rest.iter().take_while(|&&ch| ch == first).count();
        let (run, rest) = self.rest.split_at(len);
        self.rest = rest;
        Some(run)
    }
}
/// Lazily yields the scan entries for one sweep: one ground entry before each
/// run of identical channels (when ground is on), then `repeat` reads for every
/// position in the run.
pub fn plan_entries(
    channels: &[u8],
    repeat: u16,
    ground: GroundMode,
) -> impl Iterator<Item = ScanEntry> + '_ {
    Runs { rest: channels }.flat_map(move |run| {
        ground
            .pin()
            .map(ScanEntry::Ground)
            .into_iter()
            .chain(run.iter().flat_map(move |&ch| {
                std::iter::repeat(ScanEntry::Channel(ch)).take(repeat as usize)
            }))
    })
}
/// Entry count the hardware table would need, without allocating it.
pub fn scan_entries_per_sweep(channels: &[u8], repeat: u16, ground: GroundMode) -> usize {
    plan_entries(channels, repeat, ground).count()
}
/// Builds the scan plan, or rejects it if the table would not fit.
pub fn scan_plan(channels: &[u8], repeat: u16, ground: GroundMode) -> Result<ScanPlan> {
    if channels.is_empty() {
        return Err(StreamError::rejected("channel list is empty"));
    }
    if repeat == 0 {
        return Err(StreamError::rejected("repeat count must be at least 1"));
    }
    let needed = scan_entries_per_sweep(channels, repeat, ground);
    if needed > SCAN_TABLE_CAPACITY {
        return Err(StreamError::rejected(format!(
            "{needed} scan entries per sweep exceed the scan table capacity of {SCAN_TABLE_CAPACITY}"
        )));
    }
    let entries: Vec<ScanEntry> = plan_entries(channels, repeat, ground).collect();
    let samples_per_sweep = entries.iter().filter(|e| !e.is_ground()).count();
    Ok(ScanPlan {
        entries,
        samples_per_sweep,
        repeat,
        ground,
    })
}
pub fn max_sweeps_per_block(samples_per_sweep: usize) -> usize {
    if samples_per_sweep == 0 {
        return 1;
    }
    (MAX_SAMPLES_BUFFER / samples_per_sweep).max(1)
}
/// Clamps a requested block size so `sweeps * samples_per_sweep` fits the
/// device sample buffer. Always at least one sweep.
pub fn limit_sweeps_per_block(requested: usize, samples_per_sweep: usize) -> usize {
    requested.clamp(1, max_sweeps_per_block(samples_per_sweep))
}
#[derive(Clone, Debug, PartialEq)]
pub struct BlockCandidate {
    pub sweeps: usize,
    pub total_samples: usize,
    pub block_bytes: usize,
    pub transmit_time: Duration,
    /// Fraction of the last USB packet that carries frame bytes (1.0 = none wasted).
    pub usb_efficiency: f64,
    /// Transmit time relative to the target latency.
    pub latency_ratio: f64,
}
/// Ranks block sizes for a serial link at `baud_rate` (10 bits per byte on the
/// wire). Candidates over the latency target are skipped; the survivors are
/// scored on USB packet fill, latency use (best between 70 and 90 %) and size,
/// and the best `max_candidates` are returned largest first.
pub fn suggest_sweeps_per_block(
    samples_per_sweep: usize,
    layout: FrameLayout,
    baud_rate: u32,
    target_latency: Duration,
    max_candidates: usize,
) -> Vec<BlockCandidate> {
    if samples_per_sweep == 0 || baud_rate == 0 {
        return Vec::new();
    }
    let candidate = |sweeps: usize| {
        let total_samples = sweeps * samples_per_sweep;
        let block_bytes = layout.frame_len(total_samples);
        let transmit_secs = (block_bytes * 10) as f64 / baud_rate as f64;
        let packets = block_bytes.div_ceil(USB_PACKET_SIZE);
        let wasted = packets * USB_PACKET_SIZE - block_bytes;
        let target = target_latency.as_secs_f64();
        BlockCandidate {
            sweeps,
            total_samples,
            block_bytes,
            transmit_time: Duration::from_secs_f64(transmit_secs),
            usb_efficiency: 1.0 - wasted as f64 / USB_PACKET_SIZE as f64,
            latency_ratio: if target > 0.0 { transmit_secs / target } else { 0.0 },
        }
    };
    let mut candidates: Vec<BlockCandidate> = (1..=max_sweeps_per_block(samples_per_sweep))
        .map(candidate)
        .filter(|c| c.total_samples <= MAX_SAMPLES_BUFFER && c.transmit_time <= target_latency)
        .collect();
    if candidates.is_empty() {
        return vec![candidate(1)];
    }
    let largest = candidates
        .iter()
        .map(|c| c.total_samples)
        .max()
        .unwrap_or(1) as f64;
    let score = |c: &BlockCandidate| {
        let util = c.latency_ratio;
        let latency_score = if util <= 0.7 {
            util / 0.7
        } else if util <= 0.9 {
            1.0
        } else {
            1.0 - (util - 0.9) / 0.1
        }
        .clamp(0.0, 1.0);
        0.4 * c.usb_efficiency + 0.3 * latency_score + 0.3 * (c.total_samples as f64 / largest)
    };
    candidates.sort_by(|a, b| {
        score(b)
            .total_cmp(&score(a))
            .then_with(|| b.sweeps.cmp(&a.sweeps))
    });
    candidates.truncate(max_candidates.max(1));
    candidates.sort_by(|a, b| b.sweeps.cmp(&a.sweeps));
    candidates
}
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ScanEntry::{Channel, Ground};
    #[test]
    fn ground_goes_before_each_run() {
        let plan = scan_plan(&[0, 1], 2, GroundMode::Pin(9)).unwrap();
        assert_eq!(
            plan.entries(),
            &[
                Ground(9),
                Channel(0),
                Channel(0),
                Ground(9),
                Channel(1),
                Channel(1)
            ]
        );
        assert_eq!(plan.scan_entries_per_sweep(), 6);
        assert_eq!(plan.samples_per_sweep(), 4);
        assert_eq!(plan.ground_entries(), 2);
    }
    #[test]
    fn identical_neighbours_share_one_ground_read() {
        let plan = scan_plan(&[3, 3, 5, 3], 1, GroundMode::Pin(0)).unwrap();
        assert_eq!(
            plan.entries(),
            &[
                Ground(0),
                Channel(3),
                Channel(3),
                Ground(0),
                Channel(5),
                Ground(0),
                Channel(3)
            ]
        );
        assert_eq!(plan.samples_per_sweep(), 4);
    }
    #[test]
    fn without_ground_only_channels_are_scanned() {
        let plan = scan_plan(&[2, 7, 7], 3, GroundMode::Off).unwrap();
        assert_eq!(plan.scan_entries_per_sweep(), 9);
        assert_eq!(plan.samples_per_sweep(), 9);
        assert!(plan.entries().iter().all(|e| !e.is_ground()));
    }
    #[test]
    fn rejects_empty_and_oversized_tables() {
        assert!(matches!(
            scan_plan(&[], 1, GroundMode::Off),
            Err(StreamError::ConfigRejected { .. })
        ));
        assert!(matches!(
            scan_plan(&[1], 0, GroundMode::Off),
            Err(StreamError::ConfigRejected { .. })
        ));
        // 8 channels x 2 = 16 fits, with ground it needs 24.
        let channels: Vec<u8> = (0..8).collect();
        assert!(scan_plan(&channels, 2, GroundMode::Off).is_ok());
        let err = scan_plan(&channels, 2, GroundMode::Pin(15)).unwrap_err();
        assert!(err.to_string().contains("24 scan entries"));
    }
    #[test]
    fn block_size_is_limited_by_device_buffer() {
        assert_eq!(max_sweeps_per_block(4), 8000);
        assert_eq!(limit_sweeps_per_block(10_000, 4), 8000);
        assert_eq!(limit_sweeps_per_block(0, 4), 1);
        assert_eq!(limit_sweeps_per_block(50, 16), 50);
        assert_eq!(limit_sweeps_per_block(5000, 1600), 20);
    }
    #[test]
    fn suggestions_fit_latency_and_buffer() {
        let target = Duration::from_millis(20);
        let suggestions =
            suggest_sweeps_per_block(8, FrameLayout::Timed, 460_800, target, 5);
        assert!(!suggestions.is_empty() && suggestions.len() <= 5);
        for c in &suggestions {
            assert!(c.transmit_time <= target);
            assert!(c.total_samples <= MAX_SAMPLES_BUFFER);
            assert!((0.0..=1.0).contains(&c.usb_efficiency));
        }
        assert!(suggestions.windows(2).all(|w| w[0].sweeps > w[1].sweeps));
    }
    #[test]
    fn suggestions_fall_back_to_single_sweep() {
        let suggestions =
            suggest_sweeps_per_block(16, FrameLayout::Timed, 300, Duration::from_millis(1), 3);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].sweeps, 1);
    }
    proptest! {
        #[test]
        fn validator_count_matches_built_table(
            channels in prop::collection::vec(0u8..4, 1..16),
            repeat in 1u16..5,
            ground in prop::option::of(0u8..16),
        ) {
            let ground = GroundMode::from(ground);
            let counted = scan_entries_per_sweep(&channels, repeat, ground);
            match scan_plan(&channels, repeat, ground) {
                Ok(plan) => {
                    prop_assert_eq!(plan.scan_entries_per_sweep(), counted);
                    prop_assert!(counted <= SCAN_TABLE_CAPACITY);
                    prop_assert_eq!(plan.samples_per_sweep(), channels.len() * repeat as usize);
                }
                Err(_) => prop_assert!(counted > SCAN_TABLE_CAPACITY),
            }
        }
        #[test]
        fn limited_blocks_fit_device_buffer(requested in 0usize..100_000, sps in 1usize..1600) {
            let sweeps = limit_sweeps_per_block(requested, sps);
            prop_assert!(sweeps >= 1);
            prop_assert!(sweeps * sps <= MAX_SAMPLES_BUFFER);
        }
    }
}
