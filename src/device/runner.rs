//! Cooperative device main loop.
//!
//! Commands are only looked at between blocks: a block that has started always
//! completes (or times out) before a stop or reconfiguration takes effect.
use std::io::Write;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use log::{error, info};

use crate::device::capture::{BlockCapturer, CaptureState, ScanHardware};
use crate::device::session::Session;
use crate::error::{Result, StreamError};
use crate::protocol::{FrameCodec, FrameLayout};
use crate::types::{DeviceCommand, RunMode};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub blocks_sent: u64,
    pub sweeps_sent: u64,
    pub samples_sent: u64,
    pub scan_reads: u64,
    pub aborted_runs: u64,
}

#[derive(Clone, Copy, Debug)]
struct ActiveRun {
    mode: RunMode,
    /// Device time since the run started, summed block by block so it keeps
    /// counting past the 32-bit clock wrap.
    elapsed_micros: u64,
    last_micros: u32,
}

pub struct DeviceRunner<H: ScanHardware, W: Write> {
    session: Session,
    capturer: BlockCapturer<H>,
    codec: FrameCodec,
    wire: W,
    run: Option<ActiveRun>,
    stats: RunnerStats,
    frame_buf: Vec<u8>,
}

impl<H: ScanHardware, W: Write> DeviceRunner<H, W> {
    pub fn new(session: Session, capturer: BlockCapturer<H>, layout: FrameLayout, wire: W) -> Self {
        Self {
            session,
            capturer,
            codec: FrameCodec::new(layout),
            wire,
            run: None,
            stats: RunnerStats::default(),
            frame_buf: Vec::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn capturer(&self) -> &BlockCapturer<H> {
        &self.capturer
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    pub fn into_wire(self) -> W {
        self.wire
    }

    /// Handles one command. A `Run` whose configuration does not validate
    /// fails fast with `ConfigRejected` and no frame is ever emitted for it.
    pub fn handle(&mut self, command: DeviceCommand) -> Result<()> {
        if self.session.configure(&command) {
            self.echo_settings(&command)?;
            return Ok(());
        }
        match command {
            DeviceCommand::Run(mode) => self.start_run(mode),
            DeviceCommand::Stop => {
                if self.run.take().is_some() {
                    self.capturer.reset();
                    self.status_line("STOPPED")?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn start_run(&mut self, mode: RunMode) -> Result<()> {
        if let Err(e) = self.session.validate() {
            self.status_line(&format!("ERROR: {e}"))?;
            return Err(e);
        }
        if self.capturer.state() == CaptureState::Aborted {
            self.capturer.reset();
        }
        self.capturer.arm(&mut self.session)?;
        self.run = Some(ActiveRun {
            mode,
            elapsed_micros: 0,
            last_micros: self.capturer.hardware().micros(),
        });
        info!("run started ({mode:?})");
        self.status_line("RUNNING")
    }

    /// Captures and transmits one block if a run is active. Returns whether a
    /// frame went out.
    pub fn step(&mut self) -> Result<bool> {
        let Some(mut run) = self.run else {
            return Ok(false);
        };
        let block = match self.capturer.capture_block(&mut self.session) {
            Ok(block) => block,
            Err(e) => {
                self.run = None;
                self.capturer.reset();
                if matches!(e, StreamError::ScanTimeout { .. }) {
                    self.stats.aborted_runs += 1;
                }
                error!("run aborted: {e}");
                self.status_line(&format!("ERROR: {e}"))?;
                return Err(e);
            }
        };
        self.frame_buf.clear();
        self.codec
            .encode_into(&block.to_frame(), &mut self.frame_buf)
            .map_err(|e| StreamError::InvalidState(e.to_string()))?;
        self.wire.write_all(&self.frame_buf)?;
        self.wire.flush()?;
        self.stats.blocks_sent += 1;
        self.stats.sweeps_sent += block.sweeps as u64;
        self.stats.samples_sent += block.samples.len() as u64;
        self.stats.scan_reads += block.scan_reads as u64;

        let now = self.capturer.hardware().micros();
        run.elapsed_micros += now.wrapping_sub(run.last_micros) as u64;
        run.last_micros = now;
        let limit_hit = match run.mode {
            RunMode::Continuous => false,
            RunMode::Timed(limit) => Duration::from_micros(run.elapsed_micros) >= limit,
        };
        self.capturer.finish_block(!limit_hit);
        self.run = (!limit_hit).then_some(run);
        if limit_hit {
            info!("time limit reached after {} blocks", self.stats.blocks_sent);
            self.status_line("DONE")?;
        }
        Ok(true)
    }

    /// Runs until the command channel closes. Errors of a single run are
    /// reported on the wire and the loop keeps serving commands; only wire
    /// failures end it.
    pub fn run_loop(&mut self, commands: &Receiver<DeviceCommand>) -> Result<RunnerStats> {
        loop {
            // 两个采集块之间处理命令
            loop {
                match commands.try_recv() {
                    Ok(cmd) => self.handle_reported(cmd)?,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return self.shutdown(),
                }
            }
            if self.is_running() {
                match self.step() {
                    Ok(_) => {}
                    Err(StreamError::Io(e)) => return Err(StreamError::Io(e)),
                    Err(_) => {}
                }
            } else {
                match commands.recv_timeout(Duration::from_millis(10)) {
                    Ok(cmd) => self.handle_reported(cmd)?,
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return self.shutdown(),
                }
            }
        }
    }

    fn handle_reported(&mut self, cmd: DeviceCommand) -> Result<()> {
        match self.handle(cmd) {
            Ok(()) | Err(StreamError::ConfigRejected { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn shutdown(&mut self) -> Result<RunnerStats> {
        if self.run.take().is_some() {
            self.capturer.reset();
        }
        self.wire.flush()?;
        Ok(self.stats)
    }

    fn echo_settings(&mut self, command: &DeviceCommand) -> Result<()> {
        let line = match command {
            DeviceCommand::Channels(channels) => format!(
                "channels: {}",
                channels
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            DeviceCommand::Repeat(repeat) => format!("repeatCount: {repeat}"),
            DeviceCommand::Ground(ground) => match ground.pin() {
                Some(pin) => format!("groundPin: {pin}"),
                None => "useGroundBeforeEach: false".to_string(),
            },
            DeviceCommand::BufferSweeps(sweeps) => format!("bufferSweeps: {sweeps}"),
            DeviceCommand::WarmupSweeps(sweeps) => format!("warmupSweeps: {sweeps}"),
            DeviceCommand::Run(_) | DeviceCommand::Stop => return Ok(()),
        };
        self.status_line(&line)
    }

    /// Writes a `#`-prefixed, newline-terminated status line between frames.
    pub fn status_line(&mut self, text: &str) -> Result<()> {
        writeln!(self.wire, "# {text}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::scan::GroundMode;
    use crate::device::session::AcquisitionSettings;
    use crate::device::sim::SimulatedAdc;
    use crate::protocol::Decoded;
    use std::sync::mpsc;

    fn runner(hw: SimulatedAdc) -> DeviceRunner<SimulatedAdc, Vec<u8>> {
        let session = Session::new(AcquisitionSettings {
            channels: vec![0, 1],
            repeat: 2,
            ground: GroundMode::Pin(9),
            buffer_sweeps: 3,
            warmup_sweeps: 0,
        });
        DeviceRunner::new(session, BlockCapturer::new(hw), FrameLayout::Timed, Vec::new())
    }

    fn split_status(bytes: &[u8]) -> (Vec<String>, Vec<u8>) {
        // status lines only ever appear outside frames in these tests
        let mut lines = Vec::new();
        let mut rest = bytes;
        while rest.first() == Some(&b'#') {
            let end = rest.iter().position(|&b| b == b'\n').unwrap();
            lines.push(String::from_utf8(rest[..end].to_vec()).unwrap());
            rest = &rest[end + 1..];
        }
        (lines, rest.to_vec())
    }

    #[test]
    fn idle_runner_sends_nothing() {
        let mut runner = runner(SimulatedAdc::new());
        assert!(!runner.step().unwrap());
        assert!(runner.into_wire().is_empty());
    }

    #[test]
    fn one_block_is_one_frame() {
        let mut runner = runner(SimulatedAdc::new());
        runner.handle(DeviceCommand::Run(RunMode::Continuous)).unwrap();
        assert!(runner.step().unwrap());
        let stats = runner.stats();
        assert_eq!(stats.samples_sent, 12);
        assert_eq!(stats.scan_reads, 18);
        let (lines, frame_bytes) = split_status(&runner.into_wire());
        assert_eq!(lines, vec!["# RUNNING"]);
        let codec = FrameCodec::new(FrameLayout::Timed);
        let Decoded::Frame { frame, consumed } = codec.decode(&frame_bytes).unwrap() else {
            panic!("expected a full frame");
        };
        assert_eq!(consumed, frame_bytes.len());
        assert_eq!(frame.samples.len(), 12);
        assert!(frame.timing.is_some());
    }

    #[test]
    fn invalid_run_fails_fast_without_frames() {
        let mut runner = runner(SimulatedAdc::new());
        runner.handle(DeviceCommand::Channels(Vec::new())).unwrap();
        let err = runner.handle(DeviceCommand::Run(RunMode::Continuous)).unwrap_err();
        assert!(matches!(err, StreamError::ConfigRejected { .. }));
        assert!(!runner.is_running());
        assert!(!runner.step().unwrap());
        assert_eq!(runner.capturer().hardware().table_loads(), 0);
        let (lines, rest) = split_status(&runner.into_wire());
        assert!(rest.is_empty());
        assert!(lines.last().unwrap().starts_with("# ERROR: configuration rejected"));
    }

    #[test]
    fn timed_run_stops_at_block_boundary() {
        // 6 reads * 10us = 60us per sweep, 3 sweeps = 180us per block
        let hw = SimulatedAdc::new().with_conversion_micros(10);
        let mut runner = runner(hw);
        runner
            .handle(DeviceCommand::Run(RunMode::Timed(Duration::from_micros(400))))
            .unwrap();
        let mut blocks = 0;
        while runner.step().unwrap() {
            blocks += 1;
        }
        assert_eq!(blocks, 3);
        assert!(!runner.is_running());
        assert_eq!(runner.capturer().state(), CaptureState::Idle);
    }

    #[test]
    fn time_limit_longer_than_the_clock_wrap_is_honoured() {
        // one read per block, 1000 s each; 5000 s spans more than one 2^32 us wrap
        let session = Session::new(AcquisitionSettings {
            channels: vec![0],
            repeat: 1,
            ground: GroundMode::Off,
            buffer_sweeps: 1,
            warmup_sweeps: 0,
        });
        let hw = SimulatedAdc::new().with_conversion_micros(1_000_000_000);
        let mut runner =
            DeviceRunner::new(session, BlockCapturer::new(hw), FrameLayout::Timed, Vec::new());
        runner
            .handle(DeviceCommand::Run(RunMode::Timed(Duration::from_secs(5_000))))
            .unwrap();
        let mut blocks = 0;
        while blocks < 20 && runner.step().unwrap() {
            blocks += 1;
        }
        assert_eq!(blocks, 5);
        assert!(!runner.is_running());
    }

    #[test]
    fn scan_timeout_returns_device_to_idle() {
        let mut runner = runner(SimulatedAdc::new().with_stall_after(20));
        runner.handle(DeviceCommand::Run(RunMode::Continuous)).unwrap();
        assert!(runner.step().unwrap());
        assert!(matches!(
            runner.step(),
            Err(StreamError::ScanTimeout { .. })
        ));
        assert!(!runner.is_running());
        assert_eq!(runner.capturer().state(), CaptureState::Idle);
        assert_eq!(runner.stats().aborted_runs, 1);
        assert_eq!(runner.stats().blocks_sent, 1);
    }

    #[test]
    fn run_loop_serves_commands_until_channel_closes() {
        let (tx, rx) = mpsc::channel();
        let mut runner = runner(SimulatedAdc::new().with_conversion_micros(10));
        tx.send(DeviceCommand::Repeat(1)).unwrap();
        tx.send(DeviceCommand::Run(RunMode::Timed(Duration::from_micros(100))))
            .unwrap();
        drop(tx);
        let stats = runner.run_loop(&rx).unwrap();
        // the channel closes before the first block is taken
        assert_eq!(stats.blocks_sent, 0);
        let (lines, _) = split_status(&runner.into_wire());
        assert_eq!(lines, vec!["# repeatCount: 1", "# RUNNING"]);
    }
}
