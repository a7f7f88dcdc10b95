// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::protocol::FrameLayout;

// ============================================================
// 协议 / 硬件常量
// ============================================================

/// Hardware scan-table slots available per sweep.
pub const SCAN_TABLE_CAPACITY: usize = 16;
/// Device-side sample buffer; one block never carries more samples than this.
pub const MAX_SAMPLES_BUFFER: usize = 32_000;
pub const MAX_CHANNELS: usize = 16;
pub const MAX_REPEAT: u16 = 100;
/// Bound on a single scan-entry wait before the run is aborted.
pub const SCAN_TIMEOUT: Duration = Duration::from_millis(100);
/// History length kept for per-block timing statistics.
pub const MAX_TIMING_SAMPLES: usize = 1000;
pub const DEFAULT_BAUD_RATE: u32 = 460_800;
pub const DEFAULT_RING_CAPACITY: usize = 50_000;
pub const DEFAULT_WINDOW_SIZE: usize = 1000;

/// Host-side settings plus the acquisition defaults pushed to the device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub ring_capacity: usize,
    pub window_size: usize,
    pub frame_layout: FrameLayout,
    pub archive_dir: PathBuf,
    pub archive_flush_every: usize,
    pub channels: Vec<u8>,
    pub repeat: u16,
    pub ground_pin: Option<u8>,
    pub buffer_sweeps: u16,
    pub warmup_sweeps: u16,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 1000,
            ring_capacity: DEFAULT_RING_CAPACITY,
            window_size: DEFAULT_WINDOW_SIZE,
            frame_layout: FrameLayout::Timed,
            archive_dir: PathBuf::from("captures"),
            archive_flush_every: 1000,
            channels: vec![0, 1, 2, 3],
            repeat: 1,
            ground_pin: None,
            buffer_sweeps: 100,
            warmup_sweeps: 0,
        }
    }
}

impl StreamerConfig {
    /// Reads a JSON config file; keys that are absent keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: StreamerConfig = serde_json::from_str(&text)
            .map_err(|e| StreamError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() || self.channels.len() > MAX_CHANNELS {
            return Err(StreamError::Config(format!(
                "channels must have 1..={MAX_CHANNELS} entries, got {}",
                self.channels.len()
            )));
        }
        if self.repeat == 0 || self.repeat > MAX_REPEAT {
            return Err(StreamError::Config(format!(
                "repeat must be in 1..={MAX_REPEAT}, got {}",
                self.repeat
            )));
        }
        if self.ring_capacity == 0 {
            return Err(StreamError::Config("ring_capacity must be > 0".into()));
        }
        if self.baud_rate == 0 {
            return Err(StreamError::Config("baud_rate must be > 0".into()));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn samples_per_sweep(&self) -> usize {
        self.channels.len() * self.repeat as usize
    }
}
