//! Append-only sweep archive.
//!
//! File format is JSON lines: one [`ArchiveMetadata`] line, then one
//! [`SweepRecord`] per line in ingest order.
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::host::buffer::SweepRecord;
use crate::protocol::FrameLayout;

/// Receives every ingested sweep, once, in order.
pub trait ArchiveSink {
    fn append(&mut self, record: &SweepRecord) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

impl ArchiveSink for Vec<SweepRecord> {
    fn append(&mut self, record: &SweepRecord) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// `None` discards everything.
impl<A: ArchiveSink> ArchiveSink for Option<A> {
    fn append(&mut self, record: &SweepRecord) -> Result<()> {
        match self {
            Some(sink) => sink.append(record),
            None => Ok(()),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}

impl<A: ArchiveSink + ?Sized> ArchiveSink for Box<A> {
    fn append(&mut self, record: &SweepRecord) -> Result<()> {
        (**self).append(record)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub channels: Vec<u8>,
    pub repeat: u16,
    pub samples_per_sweep: usize,
    pub layout: FrameLayout,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
}

impl ArchiveMetadata {
    pub fn new(channels: Vec<u8>, repeat: u16, samples_per_sweep: usize) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            channels,
            repeat,
            samples_per_sweep,
            layout: FrameLayout::default(),
            created_at,
        }
    }

    pub fn with_layout(mut self, layout: FrameLayout) -> Self {
        self.layout = layout;
        self
    }
}

pub struct JsonlArchive {
    writer: BufWriter<File>,
    path: PathBuf,
    flush_every: usize,
    pending: usize,
    records: u64,
}

impl JsonlArchive {
    pub fn create(path: impl AsRef<Path>, metadata: &ArchiveMetadata) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(&mut writer, metadata)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        info!("archive opened: {}", path.display());
        Ok(Self {
            writer,
            path,
            flush_every: 1,
            pending: 0,
            records: 0,
        })
    }

    /// Creates `capture_<millis>.jsonl` inside `dir`, creating the directory
    /// if needed.
    pub fn create_in(dir: impl AsRef<Path>, metadata: &ArchiveMetadata) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self::create(dir.join(format!("capture_{millis}.jsonl")), metadata)
    }

    /// Flush after this many appended records (at least 1).
    pub fn with_flush_every(mut self, records: usize) -> Self {
        self.flush_every = records.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }
}

impl ArchiveSink for JsonlArchive {
    fn append(&mut self, record: &SweepRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.records += 1;
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for JsonlArchive {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("archive {} not flushed on close: {e}", self.path.display());
        }
        debug!(
            "archive closed: {} ({} sweeps)",
            self.path.display(),
            self.records
        );
    }
}

/// Sequential reader over an archive. Lines that do not parse as a sweep
/// record are skipped and counted.
pub struct ArchiveReader<R: BufRead = BufReader<File>> {
    metadata: ArchiveMetadata,
    lines: Lines<R>,
    skipped: usize,
}

impl ArchiveReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(BufReader::new(file))
    }
}

impl<R: BufRead> ArchiveReader<R> {
    pub fn from_reader(reader: R) -> Result<Self> {
        let mut lines = reader.lines();
        let header = lines
            .next()
            .transpose()?
            .ok_or_else(|| StreamError::InvalidState("archive has no metadata line".into()))?;
        let metadata = serde_json::from_str(&header)?;
        Ok(Self {
            metadata,
            lines,
            skipped: 0,
        })
    }

    pub fn metadata(&self) -> &ArchiveMetadata {
        &self.metadata
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl<R: BufRead> Iterator for ArchiveReader<R> {
    type Item = Result<SweepRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SweepRecord>(&line) {
                Ok(record) => return Some(Ok(record)),
                Err(e) => {
                    self.skipped += 1;
                    debug!("skipping malformed archive line: {e}");
                }
            }
        }
    }
}
