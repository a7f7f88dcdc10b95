use std::time::Duration;
use log::{debug, warn};
use crate::config::SCAN_TIMEOUT;
use crate::device::scan::ScanEntry;
use crate::device::session::{AppliedPlan, Session};
use crate::error::{Result, StreamError};
use crate::protocol::{clamp_interval, BlockTiming, Frame};
/// Scan hardware seen by the capture loop.
pub trait ScanHardware {
    /// Programs the scan table. Only [`Session::apply`] calls this.
    fn load_scan_table(&mut self, entries: &[ScanEntry]) -> Result<()>;
    /// Starts one pass over the programmed table.
    fn start_sweep(&mut self);
    /// Next conversion result in table order, or `None` if nothing arrived
    /// within `timeout`.
    fn next_result(&mut self, timeout: Duration) -> Option<u16>;
    /// Free-running device clock in microseconds; wraps at 2^32.
    fn micros(&self) -> u32;
}
impl<H: ScanHardware + ?Sized> ScanHardware for Box<H> {
    fn load_scan_table(&mut self, entries: &[ScanEntry]) -> Result<()> {
        (**self).load_scan_table(entries)
    }
    fn start_sweep(&mut self) {
        (**self).start_sweep()
    }
    fn next_result(&mut self, timeout: Duration) -> Option<u16> {
        (**self).next_result(timeout)
    }
    fn micros(&self) -> u32 {
        (**self).micros()
    }
}
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Planned,
    Capturing,
    BlockReady,
    Aborted,
}
/// Samples of one block with ground reads already removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub samples: Vec<u16>,
    pub sweeps: usize,
    pub samples_per_sweep: usize,
    /// Hardware conversions performed, ground reads included, warm-up excluded.
    pub scan_reads: usize,
    pub timing: BlockTiming,
}
impl Block {
    /// Average microseconds per transmitted sample, saturated to 16 bits.
    pub fn avg_interval_micros(&self) -> u16 {
        if self.samples.is_empty() {
            return 0;
        }
        clamp_interval(self.timing.elapsed_micros() / self.samples.len() as u32)
    }
    pub fn to_frame(&self) -> Frame {
        Frame {
            samples: self.samples.clone(),
            avg_interval_micros: self.avg_interval_micros(),
            timing: Some(self.timing),
        }
    }
}
/// Drives the scan hardware one block at a time.
///
/// `Idle -> Planned` via [`arm`](BlockCapturer::arm), `Planned -> Capturing ->
/// BlockReady` inside [`capture_block`](BlockCapturer::capture_block), then back
/// to `Planned` or `Idle` through [`finish_block`](BlockCapturer::finish_block).
/// A scan timeout leaves it `Aborted` until [`reset`](BlockCapturer::reset).
pub struct BlockCapturer<H: ScanHardware> {
    hw: H,
    state: CaptureState,
    scan_timeout: Duration,
    warmup_pending: bool,
}
impl<H: ScanHardware> BlockCapturer<H> {
    pub fn new(hw: H) -> Self {
        Self {
            hw,
            state: CaptureState::Idle,
            scan_timeout: SCAN_TIMEOUT,
            warmup_pending: false,
        }
    }
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }
    pub fn state(&self) -> CaptureState {
        self.state
    }
    pub fn hardware(&self) -> &H {
        &self.hw
    }
    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }
    /// Validates and applies the session, ready for the first block of a run.
    pub fn arm(&mut self, session: &mut Session) -> Result<()> {
        match self.state {
            CaptureState::Idle | CaptureState::Planned => {}
            other => {
                return Err(StreamError::InvalidState(format!(
                    "cannot arm capture while {other:?}"
                )))
            }
        }
        session.apply(&mut self.hw)?;
        self.warmup_pending = true;
        self.state = CaptureState::Planned;
        Ok(())
    }
    /// Captures one full block. Configuration changes made since the last
    /// block are applied first; changes cannot land mid-block.
    pub fn capture_block(&mut self, session: &mut Session) -> Result<Block> {
        if self.state != CaptureState::Planned {
            return Err(StreamError::InvalidState(format!(
                "capture requested while {:?}",
                self.state
            )));
        }
        self.state = CaptureState::Capturing;
        match session.apply(&mut self.hw) {
            Ok(true) => self.warmup_pending = true,
            Ok(false) => {}
            Err(e) => {
                self.state = CaptureState::Idle;
                return Err(e);
            }
        }
        let applied = session.require_applied()?.clone();
        if self.warmup_pending {
            let warmup = session.settings().warmup_sweeps;
            for _ in 0..warmup {
                self.run_sweep(&applied, None)?;
            }
            if warmup > 0 {
                debug!("discarded {warmup} warm-up sweeps");
            }
            self.warmup_pending = false;
        }
        let mut samples = Vec::with_capacity(applied.samples_per_block());
        let start_micros = self.hw.micros();
        let mut scan_reads = 0;
        for _ in 0..applied.sweeps_per_block {
            scan_reads += self.run_sweep(&applied, Some(&mut samples))?;
        }
        let end_micros = self.hw.micros();
        self.state = CaptureState::BlockReady;
        Ok(Block {
            samples,
            sweeps: applied.sweeps_per_block,
            samples_per_sweep: applied.plan.samples_per_sweep(),
            scan_reads,
            timing: BlockTiming {
                start_micros,
                end_micros,
            },
        })
    }
    /// BlockReady -> Planned when the run continues, Idle when a stop or time
    /// limit was hit.
    pub fn finish_block(&mut self, keep_running: bool) {
        if self.state == CaptureState::BlockReady {
            self.state = if keep_running {
                CaptureState::Planned
            } else {
                CaptureState::Idle
            };
        }
    }
    /// Back to Idle from any state that is not mid-block.
    pub fn reset(&mut self) {
        if self.state != CaptureState::Capturing {
            self.state = CaptureState::Idle;
        }
    }
    fn run_sweep(&mut self, applied: &AppliedPlan, mut out: Option<&mut Vec<u16>>) -> Result<usize> {
        self.hw.start_sweep();
        for (slot, entry) in applied.plan.entries().iter().enumerate() {
            let Some(value) = self.hw.next_result(self.scan_timeout) else {
                warn!("scan entry {slot} ({entry:?}) timed out, aborting run");
                self.state = CaptureState::Aborted;
                return Err(StreamError::ScanTimeout {
                    slot,
                    waited: self.scan_timeout,
                });
            };
            if let (ScanEntry::Channel(_), Some(out)) = (entry, out.as_deref_mut()) {
                out.push(value);
            }
        }
        Ok(applied.plan.entries().len())
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::scan::GroundMode;
    use crate::device::session::AcquisitionSettings;
    use crate::device::sim::SimulatedAdc;
    fn session(channels: &[u8], repeat: u16, ground: GroundMode, buffer_sweeps: u16) -> Session {
        Session::new(AcquisitionSettings {
            channels: channels.to_vec(),
            repeat,
            ground,
            buffer_sweeps,
            warmup_sweeps: 0,
        })
    }
    #[test]
    fn ground_reads_are_performed_but_never_transmitted() {
        let mut session = session(&[0, 1], 2, GroundMode::Pin(9), 3);
        let mut capturer = BlockCapturer::new(SimulatedAdc::new());
        capturer.arm(&mut session).unwrap();
        let block = capturer.capture_block(&mut session).unwrap();
        assert_eq!(block.samples.len(), 12);
        assert_eq!(block.sweeps, 3);
        assert_eq!(block.samples_per_sweep, 4);
        assert_eq!(block.scan_reads, 18);
        assert_eq!(capturer.hardware().reads(), 18);
        assert_eq!(capturer.hardware().ground_reads(), 6);
        assert!(block
            .samples
            .iter()
            .all(|&v| v != SimulatedAdc::GROUND_MARKER));
        assert_eq!(capturer.state(), CaptureState::BlockReady);
    }
    #[test]
    fn block_timing_brackets_the_samples() {
        let mut session = session(&[0], 1, GroundMode::Off, 4);
        let hw = SimulatedAdc::new().with_conversion_micros(5);
        let mut capturer = BlockCapturer::new(hw);
        capturer.arm(&mut session).unwrap();
        let block = capturer.capture_block(&mut session).unwrap();
        assert_eq!(block.timing.elapsed_micros(), 20);
        assert_eq!(block.avg_interval_micros(), 5);
        let frame = block.to_frame();
        assert_eq!(frame.timing, Some(block.timing));
        assert_eq!(frame.samples, block.samples);
    }
    #[test]
    fn warmup_sweeps_are_discarded_once_per_arm() {
        let mut session = session(&[0, 1], 1, GroundMode::Off, 2);
        session.set_warmup_sweeps(3);
        let mut capturer = BlockCapturer::new(SimulatedAdc::new());
        capturer.arm(&mut session).unwrap();
        let first = capturer.capture_block(&mut session).unwrap();
        assert_eq!(first.samples.len(), 4);
        assert_eq!(capturer.hardware().reads(), (3 + 2) * 2);
        capturer.finish_block(true);
        capturer.capture_block(&mut session).unwrap();
        assert_eq!(capturer.hardware().reads(), (3 + 2 + 2) * 2);
    }
    #[test]
    fn timeout_aborts_the_run() {
        let mut session = session(&[0, 1], 1, GroundMode::Off, 10);
        let hw = SimulatedAdc::new().with_stall_after(5);
        let mut capturer = BlockCapturer::new(hw).with_scan_timeout(Duration::from_millis(1));
        capturer.arm(&mut session).unwrap();
        let err = capturer.capture_block(&mut session).unwrap_err();
        assert!(matches!(err, StreamError::ScanTimeout { slot: 1, .. }));
        assert_eq!(capturer.state(), CaptureState::Aborted);
        assert!(capturer.capture_block(&mut session).is_err());
        capturer.reset();
        assert_eq!(capturer.state(), CaptureState::Idle);
    }
    #[test]
    fn reconfiguration_between_blocks_is_applied_before_the_next() {
        let mut session = session(&[0], 1, GroundMode::Off, 2);
        let mut capturer = BlockCapturer::new(SimulatedAdc::new());
        capturer.arm(&mut session).unwrap();
        capturer.capture_block(&mut session).unwrap();
        capturer.finish_block(true);
        session.set_channels(vec![0, 1, 2]);
        let block = capturer.capture_block(&mut session).unwrap();
        assert_eq!(block.samples_per_sweep, 3);
        assert_eq!(block.samples.len(), 6);
        assert_eq!(capturer.hardware().table_loads(), 2);
        capturer.finish_block(false);
        assert_eq!(capturer.state(), CaptureState::Idle);
    }
    #[test]
    fn rejected_reconfiguration_stops_capture() {
        let mut session = session(&[0], 1, GroundMode::Off, 1);
        let mut capturer = BlockCapturer::new(SimulatedAdc::new());
        capturer.arm(&mut session).unwrap();
        capturer.capture_block(&mut session).unwrap();
        capturer.finish_block(true);
        session.set_channels(Vec::new());
        assert!(matches!(
            capturer.capture_block(&mut session),
            Err(StreamError::ConfigRejected { .. })
        ));
        assert_eq!(capturer.state(), CaptureState::Idle);
    }
    #[test]
    fn capture_requires_arming() {
        let mut session = session(&[0], 1, GroundMode::Off, 1);
        let mut capturer = BlockCapturer::new(SimulatedAdc::new());
        assert!(matches!(
            capturer.capture_block(&mut session),
            Err(StreamError::InvalidState(_))
        ));
    }
}
