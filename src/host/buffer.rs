//! Fixed-capacity sweep ring shared between the ingest thread and readers.
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::info;
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::host::archive::ArchiveReader;
use crate::host::timestamp::SweepTimestamp;

/// One sweep as buffered and archived.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepRecord {
    pub index: u64,
    pub timestamp: SweepTimestamp,
    pub samples: Vec<u16>,
}

/// Copy of a run of consecutive sweeps, oldest first.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepWindow {
    /// sweeps x samples_per_sweep
    pub samples: Array2<u16>,
    pub timestamps: Vec<SweepTimestamp>,
    pub indices: Vec<u64>,
}

impl SweepWindow {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn samples_per_sweep(&self) -> usize {
        self.samples.ncols()
    }

    pub fn sweep(&self, row: usize) -> ArrayView1<'_, u16> {
        self.samples.index_axis(Axis(0), row)
    }

    /// Values of one sample position across all sweeps in the window.
    pub fn position(&self, col: usize) -> ArrayView1<'_, u16> {
        self.samples.index_axis(Axis(1), col)
    }
}

/// Ring of sweeps stored as one flat sample array.
///
/// Positions count every sweep pushed since the last clear; the sweep at
/// position `p` lives in slot `p % capacity` while it is retained.
#[derive(Debug)]
pub struct SweepRing {
    capacity: usize,
    samples_per_sweep: usize,
    samples: Vec<u16>,
    timestamps: Vec<SweepTimestamp>,
    indices: Vec<u64>,
    written: u64,
    overwritten: u64,
}

impl SweepRing {
    pub fn new(capacity: usize, samples_per_sweep: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples_per_sweep,
            samples: Vec::new(),
            timestamps: Vec::new(),
            indices: Vec::new(),
            written: 0,
            overwritten: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn samples_per_sweep(&self) -> usize {
        self.samples_per_sweep
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Sweeps pushed since the last clear. Acts as the write pointer.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn overwritten(&self) -> u64 {
        self.overwritten
    }

    pub fn push(&mut self, index: u64, timestamp: SweepTimestamp, samples: &[u16]) -> Result<()> {
        if samples.len() != self.samples_per_sweep {
            return Err(StreamError::InvalidState(format!(
                "sweep of {} samples pushed into a ring of {}-sample sweeps",
                samples.len(),
                self.samples_per_sweep
            )));
        }
        let slot = (self.written % self.capacity as u64) as usize;
        if self.indices.len() < self.capacity {
            self.samples.extend_from_slice(samples);
            self.timestamps.push(timestamp);
            self.indices.push(index);
        } else {
            let at = slot * self.samples_per_sweep;
            self.samples[at..at + self.samples_per_sweep].copy_from_slice(samples);
            self.timestamps[slot] = timestamp;
            self.indices[slot] = index;
            self.overwritten += 1;
        }
        self.written += 1;
        Ok(())
    }

    pub fn push_record(&mut self, record: &SweepRecord) -> Result<()> {
        self.push(record.index, record.timestamp, &record.samples)
    }

    /// The last `window` sweeps.
    pub fn latest(&self, window: usize) -> Result<SweepWindow> {
        self.window_ending_at(self.written, window)
    }

    /// Up to `window` sweeps ending just before position `end`, limited to
    /// what is still retained.
    pub fn window_ending_at(&self, end: u64, window: usize) -> Result<SweepWindow> {
        let end = end.min(self.written);
        let oldest = self.written - self.len() as u64;
        let start = end.saturating_sub(window as u64).max(oldest);
        let rows = end.saturating_sub(start) as usize;
        let mut flat = Vec::with_capacity(rows * self.samples_per_sweep);
        let mut timestamps = Vec::with_capacity(rows);
        let mut indices = Vec::with_capacity(rows);
        for pos in start..end {
            let slot = (pos % self.capacity as u64) as usize;
            let at = slot * self.samples_per_sweep;
            flat.extend_from_slice(&self.samples[at..at + self.samples_per_sweep]);
            timestamps.push(self.timestamps[slot]);
            indices.push(self.indices[slot]);
        }
        let samples = Array2::from_shape_vec((rows, self.samples_per_sweep), flat)
            .map_err(|e| StreamError::InvalidState(format!("window shape: {e}")))?;
        Ok(SweepWindow {
            samples,
            timestamps,
            indices,
        })
    }

    /// Sweep with global `index`, if still retained.
    pub fn get(&self, index: u64) -> Option<SweepRecord> {
        let slot = self.indices.iter().position(|&i| i == index)?;
        let at = slot * self.samples_per_sweep;
        Some(SweepRecord {
            index,
            timestamp: self.timestamps[slot],
            samples: self.samples[at..at + self.samples_per_sweep].to_vec(),
        })
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.timestamps.clear();
        self.indices.clear();
        self.written = 0;
        self.overwritten = 0;
    }

    /// Switches to a new sweep width. The stored sweeps no longer fit and are
    /// dropped.
    pub fn reconfigure(&mut self, samples_per_sweep: usize) {
        if samples_per_sweep != self.samples_per_sweep {
            info!(
                "ring re-initialised: {} -> {} samples/sweep, {} sweeps dropped",
                self.samples_per_sweep,
                samples_per_sweep,
                self.len()
            );
            self.samples_per_sweep = samples_per_sweep;
            self.clear();
        }
    }
}

/// Cloneable handle to a [`SweepRing`] behind one mutex.
///
/// Every method holds the lock only for the copy in or out; readers get owned
/// data and never keep the writer waiting while they process it.
#[derive(Clone, Debug)]
pub struct SharedSweepBuffer {
    inner: Arc<Mutex<SweepRing>>,
}

impl SharedSweepBuffer {
    pub fn new(capacity: usize, samples_per_sweep: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SweepRing::new(capacity, samples_per_sweep))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SweepRing> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes a block's sweeps under a single lock.
    pub fn push_block(&self, records: &[SweepRecord]) -> Result<()> {
        let mut ring = self.lock();
        for record in records {
            ring.push_record(record)?;
        }
        Ok(())
    }

    pub fn latest(&self, window: usize) -> Result<SweepWindow> {
        self.lock().latest(window)
    }

    pub fn window_ending_at(&self, end: u64, window: usize) -> Result<SweepWindow> {
        self.lock().window_ending_at(end, window)
    }

    pub fn get(&self, index: u64) -> Option<SweepRecord> {
        self.lock().get(index)
    }

    pub fn written(&self) -> u64 {
        self.lock().written()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn overwritten(&self) -> u64 {
        self.lock().overwritten()
    }

    pub fn samples_per_sweep(&self) -> usize {
        self.lock().samples_per_sweep()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn reconfigure(&self, samples_per_sweep: usize) {
        self.lock().reconfigure(samples_per_sweep);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewMode {
    /// Window follows the write pointer.
    LiveTail,
    /// Window ends at the write pointer as it was when capture stopped.
    PostCapture { frozen_at: u64 },
    /// Reads come from the archive; the ring is left alone.
    Full,
}

/// Reader-side view over a [`SharedSweepBuffer`].
#[derive(Debug)]
pub struct SweepViewer {
    buffer: SharedSweepBuffer,
    mode: ViewMode,
    ring_mode: ViewMode,
    capturing: bool,
}

impl SweepViewer {
    pub fn new(buffer: SharedSweepBuffer) -> Self {
        Self {
            buffer,
            mode: ViewMode::LiveTail,
            ring_mode: ViewMode::LiveTail,
            capturing: false,
        }
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn buffer(&self) -> &SharedSweepBuffer {
        &self.buffer
    }

    pub fn start_capture(&mut self) {
        self.capturing = true;
        self.ring_mode = ViewMode::LiveTail;
        if self.mode != ViewMode::Full {
            self.mode = ViewMode::LiveTail;
        }
    }

    pub fn stop_capture(&mut self) {
        self.capturing = false;
        self.ring_mode = ViewMode::PostCapture {
            frozen_at: self.buffer.written(),
        };
        if self.mode != ViewMode::Full {
            self.mode = self.ring_mode;
        }
    }

    /// Switches to archive replay. Refused while a capture is running.
    pub fn enter_full_view(&mut self, archive: impl AsRef<Path>) -> Result<ArchiveReader> {
        if self.capturing {
            return Err(StreamError::InvalidState(
                "full view is unavailable while capturing".into(),
            ));
        }
        let reader = ArchiveReader::open(archive)?;
        self.mode = ViewMode::Full;
        Ok(reader)
    }

    /// Back to the ring-backed mode that was active before full view.
    pub fn exit_full_view(&mut self) {
        self.mode = self.ring_mode;
    }

    pub fn read(&self, window: usize) -> Result<SweepWindow> {
        match self.mode {
            ViewMode::LiveTail => self.buffer.latest(window),
            ViewMode::PostCapture { frozen_at } => self.buffer.window_ending_at(frozen_at, window),
            ViewMode::Full => Err(StreamError::InvalidState(
                "full view reads from the archive, not the ring".into(),
            )),
        }
    }
}
