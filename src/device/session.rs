//! Device-side acquisition session.
//!
//! All acquisition settings live in one owned [`Session`]. Every mutation puts
//! it back into the dirty state; [`Session::apply`] is the only transition back
//! to configured and the only place the hardware scan table is written.
use log::{debug, info};
use crate::config::StreamerConfig;
use crate::device::capture::ScanHardware;
use crate::device::scan::{limit_sweeps_per_block, scan_plan, GroundMode, ScanPlan};
use crate::error::{Result, StreamError};
use crate::types::DeviceCommand;
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquisitionSettings {
    pub channels: Vec<u8>,
    pub repeat: u16,
    pub ground: GroundMode,
    /// Requested sweeps per block before the device-buffer clamp.
    pub buffer_sweeps: u16,
    pub warmup_sweeps: u16,
}
impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            channels: vec![0],
            repeat: 1,
            ground: GroundMode::Off,
            buffer_sweeps: 1,
            warmup_sweeps: 0,
        }
    }
}
impl From<&StreamerConfig> for AcquisitionSettings {
    fn from(config: &StreamerConfig) -> Self {
        Self {
            channels: config.channels.clone(),
            repeat: config.repeat,
            ground: GroundMode::from(config.ground_pin),
            buffer_sweeps: config.buffer_sweeps,
            warmup_sweeps: config.warmup_sweeps,
        }
    }
}
/// A scan plan that has been written to the hardware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedPlan {
    pub plan: ScanPlan,
    pub sweeps_per_block: usize,
}
impl AppliedPlan {
    pub fn samples_per_block(&self) -> usize {
        self.sweeps_per_block * self.plan.samples_per_sweep()
    }
    pub fn scan_reads_per_block(&self) -> usize {
        self.sweeps_per_block * self.plan.scan_entries_per_sweep()
    }
}
#[derive(Clone, Debug, PartialEq, Eq)]
enum PlanState {
    Dirty,
    Configured(AppliedPlan),
}
#[derive(Clone, Debug)]
pub struct Session {
    settings: AcquisitionSettings,
    state: PlanState,
}
impl Session {
    pub fn new(settings: AcquisitionSettings) -> Self {
        Self {
            settings,
            state: PlanState::Dirty,
        }
    }
    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }
    pub fn is_dirty(&self) -> bool {
        matches!(self.state, PlanState::Dirty)
    }
    /// The plan currently programmed into the hardware, if the session is clean.
    pub fn applied(&self) -> Option<&AppliedPlan> {
        match &self.state {
            PlanState::Configured(applied) => Some(applied),
            PlanState::Dirty => None,
        }
    }
    pub fn set_channels(&mut self, channels: Vec<u8>) {
        self.settings.channels = channels;
        self.mark_dirty();
    }
    pub fn set_repeat(&mut self, repeat: u16) {
        self.settings.repeat = repeat;
        self.mark_dirty();
    }
    pub fn set_ground(&mut self, ground: GroundMode) {
        self.settings.ground = ground;
        self.mark_dirty();
    }
    pub fn set_buffer_sweeps(&mut self, sweeps: u16) {
        self.settings.buffer_sweeps = sweeps;
        self.mark_dirty();
    }
    pub fn set_warmup_sweeps(&mut self, sweeps: u16) {
        self.settings.warmup_sweeps = sweeps;
        self.mark_dirty();
    }
    /// Applies a configuration command. Returns `false` for commands that are
    /// not configuration (run/stop), which are left to the caller.
    pub fn configure(&mut self, command: &DeviceCommand) -> bool {
        match command {
            DeviceCommand::Channels(channels) => self.set_channels(channels.clone()),
            DeviceCommand::Repeat(repeat) => self.set_repeat(*repeat),
            DeviceCommand::Ground(ground) => self.set_ground(*ground),
            DeviceCommand::BufferSweeps(sweeps) => self.set_buffer_sweeps(*sweeps),
            DeviceCommand::WarmupSweeps(sweeps) => self.set_warmup_sweeps(*sweeps),
            DeviceCommand::Run(_) | DeviceCommand::Stop => return false,
        }
        true
    }
    /// Derives the plan from the current settings without touching hardware.
    pub fn validate(&self) -> Result<AppliedPlan> {
        let plan = scan_plan(
            &self.settings.channels,
            self.settings.repeat,
            self.settings.ground,
        )?;
        let sweeps_per_block =
            limit_sweeps_per_block(self.settings.buffer_sweeps as usize, plan.samples_per_sweep());
        Ok(AppliedPlan {
            plan,
            sweeps_per_block,
        })
    }
    /// Dirty -> Configured. Writes the scan table when dirty; a no-op otherwise.
    /// Returns whether the hardware was reprogrammed. On rejection the hardware
    /// is left untouched and the session stays dirty.
    pub fn apply<H: ScanHardware + ?Sized>(&mut self, hw: &mut H) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        let applied = self.validate()?;
        hw.load_scan_table(applied.plan.entries())?;
        info!(
            "scan table applied: {} entries/sweep, {} samples/sweep, {} sweeps/block",
            applied.plan.scan_entries_per_sweep(),
            applied.plan.samples_per_sweep(),
            applied.sweeps_per_block
        );
        if applied.sweeps_per_block != self.settings.buffer_sweeps as usize {
            debug!(
                "buffer sweeps {} clamped to {}",
                self.settings.buffer_sweeps, applied.sweeps_per_block
            );
        }
        self.state = PlanState::Configured(applied);
        Ok(true)
    }
    pub fn require_applied(&self) -> Result<&AppliedPlan> {
        self.applied()
            .ok_or_else(|| StreamError::InvalidState("session has unapplied changes".into()))
    }
    fn mark_dirty(&mut self) {
        self.state = PlanState::Dirty;
    }
}
