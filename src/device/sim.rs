use std::thread;
use std::time::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use crate::device::capture::ScanHardware;
use crate::device::scan::ScanEntry;
use crate::error::Result;
/// 12-bit full scale of the simulated converter.
const FULL_SCALE: f64 = 4095.0;
/// Software stand-in for the ADC scan hardware.
///
/// Each channel pin produces a slow sine with its own phase plus a little
/// noise; the device clock advances by a fixed conversion time per read.
pub struct SimulatedAdc {
    table: Vec<ScanEntry>,
    cursor: usize,
    clock_micros: u32,
    conversion_micros: u32,
    sweep_pacing: Option<Duration>,
    stall_after: Option<usize>,
    noise: f64,
    rng: StdRng,
    reads: usize,
    ground_reads: usize,
    table_loads: usize,
}
impl Default for SimulatedAdc {
    fn default() -> Self {
        Self::new()
    }
}
impl SimulatedAdc {
    /// Value reported for ground reads; never produced by a channel read.
    pub const GROUND_MARKER: u16 = u16::MAX;
    pub fn new() -> Self {
        Self {
            table: Vec::new(),
            cursor: 0,
            clock_micros: 0,
            conversion_micros: 13,
            sweep_pacing: None,
            stall_after: None,
            noise: 4.0,
            rng: StdRng::seed_from_u64(0x5eed),
            reads: 0,
            ground_reads: 0,
            table_loads: 0,
        }
    }
    /// Starts the device clock at `micros`, e.g. just below the 2^32 wrap.
    pub fn with_clock_start(mut self, micros: u32) -> Self {
        self.clock_micros = micros;
        self
    }
    pub fn with_conversion_micros(mut self, micros: u32) -> Self {
        self.conversion_micros = micros;
        self
    }
    /// Sleeps this long at the start of every sweep so the simulated device
    /// streams at a realistic pace.
    pub fn with_sweep_pacing(mut self, pacing: Duration) -> Self {
        self.sweep_pacing = Some(pacing);
        self
    }
    /// Stops producing results after `reads` conversions.
    pub fn with_stall_after(mut self, reads: usize) -> Self {
        self.stall_after = Some(reads);
        self
    }
    /// Peak uniform noise added to every channel read; the sign is ignored.
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude.abs();
        self
    }
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }
    pub fn scan_table(&self) -> &[ScanEntry] {
        &self.table
    }
    pub fn reads(&self) -> usize {
        self.reads
    }
    pub fn ground_reads(&self) -> usize {
        self.ground_reads
    }
    pub fn table_loads(&self) -> usize {
        self.table_loads
    }
    fn channel_value(&mut self, pin: u8) -> u16 {
        let t = self.clock_micros as f64 * 1e-6;
        let phase = pin as f64 * 0.7;
        let mid = FULL_SCALE / 2.0;
        let wave = mid + 0.4 * mid * (2.0 * std::f64::consts::PI * 5.0 * t + phase).sin();
        let noisy = wave + self.rng.gen_range(-self.noise..=self.noise);
        noisy.round().clamp(0.0, FULL_SCALE) as u16
    }
}
impl ScanHardware for SimulatedAdc {
    fn load_scan_table(&mut self, entries: &[ScanEntry]) -> Result<()> {
        self.table = entries.to_vec();
        self.cursor = 0;
        self.table_loads += 1;
        Ok(())
    }
    fn start_sweep(&mut self) {
        self.cursor = 0;
        if let Some(pacing) = self.sweep_pacing {
            thread::sleep(pacing);
        }
    }
    fn next_result(&mut self, timeout: Duration) -> Option<u16> {
        let stalled = self.stall_after.is_some_and(|limit| self.reads >= limit);
        if stalled || self.table.is_empty() {
            let waited = timeout.as_micros().min(u32::MAX as u128) as u32;
            self.clock_micros = self.clock_micros.wrapping_add(waited);
            return None;
        }
        let entry = self.table[self.cursor % self.table.len()];
        self.cursor += 1;
        self.reads += 1;
        self.clock_micros = self.clock_micros.wrapping_add(self.conversion_micros);
        match entry {
            ScanEntry::Ground(_) => {
                self.ground_reads += 1;
                Some(Self::GROUND_MARKER)
            }
            ScanEntry::Channel(pin) => Some(self.channel_value(pin)),
        }
    }
    fn micros(&self) -> u32 {
        self.clock_micros
    }
}
