//! Byte stream to sweeps.
//!
//! The device interleaves binary frames with `#`-prefixed text lines. Anything
//! that is neither is skipped byte by byte until the next frame magic or `#`,
//! and the skipped bytes are counted.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::host::archive::ArchiveSink;
use crate::host::buffer::{SharedSweepBuffer, SweepRecord};
use crate::host::timestamp::{TimeSource, TimestampReconstructor};
use crate::protocol::{Decoded, Frame, FrameCodec};

/// Longest status line accepted before the bytes are treated as noise.
pub const MAX_STATUS_LINE: usize = 256;

#[derive(Debug, Default)]
pub struct IngestStats {
    pub bytes_received: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub sweeps_ingested: AtomicU64,
    pub partial_samples: AtomicU64,
    pub resyncs: AtomicU64,
    pub bytes_skipped: AtomicU64,
    pub status_lines: AtomicU64,
    pub archive_errors: AtomicU64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        IngestSnapshot {
            bytes_received: get(&self.bytes_received),
            frames_decoded: get(&self.frames_decoded),
            frames_dropped: get(&self.frames_dropped),
            sweeps_ingested: get(&self.sweeps_ingested),
            partial_samples: get(&self.partial_samples),
            resyncs: get(&self.resyncs),
            bytes_skipped: get(&self.bytes_skipped),
            status_lines: get(&self.status_lines),
            archive_errors: get(&self.archive_errors),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestSnapshot {
    pub bytes_received: u64,
    pub frames_decoded: u64,
    /// Frames that arrived while not capturing.
    pub frames_dropped: u64,
    pub sweeps_ingested: u64,
    /// Trailing samples that did not make up a whole sweep.
    pub partial_samples: u64,
    pub resyncs: u64,
    pub bytes_skipped: u64,
    pub status_lines: u64,
    pub archive_errors: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum IngestEvent {
    Block {
        first_index: u64,
        sweeps: usize,
        source: TimeSource,
    },
    /// A device status line, `#` included, newline stripped.
    Status(String),
    Resync { skipped: usize },
}

pub struct IngestPipeline<A: ArchiveSink> {
    codec: FrameCodec,
    buffer: SharedSweepBuffer,
    archive: A,
    reconstructor: TimestampReconstructor,
    stats: Arc<IngestStats>,
    pending: Vec<u8>,
    samples_per_sweep: usize,
    next_index: u64,
    capturing: bool,
}

impl<A: ArchiveSink> IngestPipeline<A> {
    /// The sweep width is taken from the buffer.
    pub fn new(codec: FrameCodec, buffer: SharedSweepBuffer, archive: A) -> Self {
        let samples_per_sweep = buffer.samples_per_sweep();
        Self {
            codec,
            buffer,
            archive,
            reconstructor: TimestampReconstructor::new(),
            stats: Arc::new(IngestStats::new()),
            pending: Vec::new(),
            samples_per_sweep,
            next_index: 0,
            capturing: false,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    pub fn buffer(&self) -> &SharedSweepBuffer {
        &self.buffer
    }

    pub fn reconstructor(&self) -> &TimestampReconstructor {
        &self.reconstructor
    }

    pub fn archive(&self) -> &A {
        &self.archive
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// Global index the next ingested sweep will get.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Starting a capture begins a fresh timeline; stopping flushes the archive.
    pub fn set_capturing(&mut self, capturing: bool) {
        if capturing && !self.capturing {
            self.reconstructor.reset();
        }
        if !capturing && self.capturing {
            if let Err(e) = self.archive.flush() {
                IngestStats::add(&self.stats.archive_errors, 1);
                warn!("archive flush failed: {e}");
            }
        }
        self.capturing = capturing;
    }

    pub fn set_samples_per_sweep(&mut self, samples_per_sweep: usize) {
        self.samples_per_sweep = samples_per_sweep;
        self.buffer.reconfigure(samples_per_sweep);
    }

    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<IngestEvent> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        self.feed_at(bytes, now)
    }

    /// Like [`feed`](Self::feed) with an explicit host receipt time.
    pub fn feed_at(&mut self, bytes: &[u8], received_micros: u64) -> Vec<IngestEvent> {
        IngestStats::add(&self.stats.bytes_received, bytes.len() as u64);
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();
        let mut pos = 0;
        while pos < self.pending.len() {
            let buf = &self.pending[pos..];
            if buf[0] == b'#' {
                match scan_status_line(buf) {
                    LineScan::Line { len, text } => {
                        pos += len;
                        IngestStats::add(&self.stats.status_lines, 1);
                        debug!("device: {text}");
                        events.push(IngestEvent::Status(text));
                    }
                    LineScan::Noise => pos += self.skip(1, &mut events),
                    LineScan::Incomplete => break,
                }
                continue;
            }
            match self.codec.decode(buf) {
                Ok(Decoded::Frame { frame, consumed }) => {
                    pos += consumed;
                    if let Some(event) = self.ingest_frame(frame, received_micros) {
                        events.push(event);
                    }
                }
                Ok(Decoded::NeedMore { .. }) => break,
                Err(e) => {
                    debug!("framing error: {e}");
                    pos += self.resync_at(pos, &mut events);
                }
            }
        }
        self.pending.drain(..pos);
        events
    }

    /// Bytes to skip from `pos` to the next candidate header or status line.
    fn resync_at(&mut self, pos: usize, events: &mut Vec<IngestEvent>) -> usize {
        let buf = &self.pending[pos..];
        let magic = FrameCodec::find_magic(buf);
        let hash = buf.iter().skip(1).position(|&b| b == b'#').map(|i| i + 1);
        let skipped = match (magic, hash) {
            (Some(m), Some(h)) => m.min(h),
            (Some(m), None) => m,
            (None, Some(h)) => h,
            (None, None) => buf.len(),
        };
        self.skip(skipped, events)
    }

    /// Counts `skipped` noise bytes, folding them into a directly preceding
    /// `Resync` event.
    fn skip(&mut self, skipped: usize, events: &mut Vec<IngestEvent>) -> usize {
        IngestStats::add(&self.stats.bytes_skipped, skipped as u64);
        match events.last_mut() {
            Some(IngestEvent::Resync { skipped: total }) => *total += skipped,
            _ => {
                IngestStats::add(&self.stats.resyncs, 1);
                events.push(IngestEvent::Resync { skipped });
            }
        }
        warn!("resync: skipped {skipped} bytes");
        skipped
    }

    fn ingest_frame(&mut self, frame: Frame, received_micros: u64) -> Option<IngestEvent> {
        IngestStats::add(&self.stats.frames_decoded, 1);
        if !self.capturing {
            IngestStats::add(&self.stats.frames_dropped, 1);
            return None;
        }
        let sps = self.samples_per_sweep;
        if sps == 0 {
            IngestStats::add(&self.stats.frames_dropped, 1);
            warn!("frame dropped: samples per sweep not set");
            return None;
        }
        let sweeps = frame.samples.len() / sps;
        let remainder = frame.samples.len() % sps;
        if remainder != 0 {
            IngestStats::add(&self.stats.partial_samples, remainder as u64);
            warn!(
                "frame of {} samples is not a whole number of {sps}-sample sweeps, {remainder} dropped",
                frame.samples.len()
            );
        }
        if sweeps == 0 {
            return None;
        }
        let stamps = self.reconstructor.sweep_timestamps(
            frame.timing,
            frame.avg_interval_micros,
            sweeps,
            sps,
            received_micros,
        );
        let source = stamps[0].source;
        let first_index = self.next_index;
        let records: Vec<SweepRecord> = frame
            .samples
            .chunks_exact(sps)
            .zip(stamps)
            .zip(first_index..)
            .map(|((samples, timestamp), index)| SweepRecord {
                index,
                timestamp,
                samples: samples.to_vec(),
            })
            .collect();
        self.next_index += sweeps as u64;

        // 先写归档, 再写环形缓冲区
        for record in &records {
            if let Err(e) = self.archive.append(record) {
                IngestStats::add(&self.stats.archive_errors, 1);
                warn!("archive append failed for sweep {}: {e}", record.index);
            }
        }
        if let Err(e) = self.buffer.push_block(&records) {
            warn!("ring write failed: {e}");
        }
        IngestStats::add(&self.stats.sweeps_ingested, sweeps as u64);
        Some(IngestEvent::Block {
            first_index,
            sweeps,
            source,
        })
    }

    /// Flushes the archive and hands it back.
    pub fn finish(mut self) -> A {
        if let Err(e) = self.archive.flush() {
            warn!("archive flush failed: {e}");
        }
        self.archive
    }
}

enum LineScan {
    /// A printable line of `len` bytes including the newline.
    Line { len: usize, text: String },
    /// The leading `#` does not start a status line.
    Noise,
    Incomplete,
}

/// Classifies the bytes after a `#`. A status line is valid UTF-8 without
/// control characters, optionally ending in `\r\n`.
fn scan_status_line(buf: &[u8]) -> LineScan {
    let end = buf
        .iter()
        .position(|&b| b == b'\n' || (b.is_ascii_control() && b != b'\r'));
    if end.is_none() && buf.len() > MAX_STATUS_LINE {
        return LineScan::Noise;
    }
    let text = match std::str::from_utf8(&buf[..end.unwrap_or(buf.len())]) {
        Ok(text) => text,
        // a multi-byte character cut off by the end of the read
        Err(e) if e.error_len().is_none() && end.is_none() => return LineScan::Incomplete,
        Err(_) => return LineScan::Noise,
    };
    match end {
        Some(nl) if buf[nl] == b'\n' => {
            let text = text.strip_suffix('\r').unwrap_or(text);
            if nl > MAX_STATUS_LINE || text.chars().any(char::is_control) {
                LineScan::Noise
            } else {
                LineScan::Line {
                    len: nl + 1,
                    text: text.to_owned(),
                }
            }
        }
        Some(_) => LineScan::Noise,
        None => LineScan::Incomplete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::timestamp::SweepTimestamp;
    use crate::protocol::{BlockTiming, FrameLayout};

    fn pipeline(layout: FrameLayout, sps: usize) -> IngestPipeline<Vec<SweepRecord>> {
        let mut p = IngestPipeline::new(
            FrameCodec::new(layout),
            SharedSweepBuffer::new(100, sps),
            Vec::new(),
        );
        p.set_capturing(true);
        p
    }

    fn frame_bytes(layout: FrameLayout, samples: Vec<u16>, start: u32, end: u32) -> Vec<u8> {
        FrameCodec::new(layout)
            .encode(&Frame {
                samples,
                avg_interval_micros: 13,
                timing: Some(BlockTiming {
                    start_micros: start,
                    end_micros: end,
                }),
            })
            .unwrap()
    }

    #[test]
    fn decoded_frame_becomes_timestamped_sweeps() {
        let mut p = pipeline(FrameLayout::Timed, 2);
        let events = p.feed_at(&frame_bytes(FrameLayout::Timed, vec![10, 20, 30, 40], 1000, 1052), 0);
        assert_eq!(
            events,
            vec![IngestEvent::Block {
                first_index: 0,
                sweeps: 2,
                source: TimeSource::Device
            }]
        );
        let archived = p.archive();
        assert_eq!(archived.len(), 2);
        assert_eq!(archived[0].samples, vec![10, 20]);
        assert_eq!(archived[0].timestamp, SweepTimestamp::device(1000));
        assert_eq!(archived[1].samples, vec![30, 40]);
        assert_eq!(archived[1].timestamp, SweepTimestamp::device(1026));
        let window = p.buffer().latest(10).unwrap();
        assert_eq!(window.indices, vec![0, 1]);
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let mut p = pipeline(FrameLayout::Timed, 1);
        let mut stream = frame_bytes(FrameLayout::Timed, vec![1, 2, 3], 0, 30);
        stream.extend(frame_bytes(FrameLayout::Timed, vec![4, 5], 30, 50));
        let mut blocks = 0;
        for byte in &stream {
            blocks += p
                .feed_at(std::slice::from_ref(byte), 0)
                .iter()
                .filter(|e| matches!(e, IngestEvent::Block { .. }))
                .count();
        }
        assert_eq!(blocks, 2);
        assert_eq!(p.stats().snapshot().sweeps_ingested, 5);
        assert_eq!(p.stats().snapshot().bytes_skipped, 0);
    }

    #[test]
    fn garbage_is_skipped_and_counted() {
        let mut p = pipeline(FrameLayout::Compact, 1);
        let mut stream = vec![0x00, 0x13, 0xAA, 0x00, 0x55];
        stream.extend(frame_bytes(FrameLayout::Compact, vec![7, 8], 0, 0));
        let events = p.feed_at(&stream, 0);
        assert_eq!(events[0], IngestEvent::Resync { skipped: 5 });
        assert!(matches!(events[1], IngestEvent::Block { sweeps: 2, .. }));
        let stats = p.stats().snapshot();
        assert_eq!(stats.bytes_skipped, 5);
        assert_eq!(stats.resyncs, 1);
    }

    #[test]
    fn status_lines_are_passed_through() {
        let mut p = pipeline(FrameLayout::Timed, 2);
        let mut stream = b"# channels: 0,1\r\n".to_vec();
        stream.extend(frame_bytes(FrameLayout::Timed, vec![1, 2], 0, 10));
        stream.extend(b"# RUN");
        let events = p.feed_at(&stream, 0);
        assert_eq!(events[0], IngestEvent::Status("# channels: 0,1".into()));
        assert!(matches!(events[1], IngestEvent::Block { .. }));
        assert_eq!(events.len(), 2);
        let events = p.feed_at(b"NING\n", 0);
        assert_eq!(events, vec![IngestEvent::Status("# RUNNING".into())]);
    }

    #[test]
    fn stray_hash_before_a_frame_costs_one_byte() {
        let mut p = pipeline(FrameLayout::Timed, 2);
        let mut stream = vec![0x00, b'#'];
        stream.extend(frame_bytes(FrameLayout::Timed, vec![10, 20, 30, 40], 1000, 1052));
        let events = p.feed_at(&stream, 0);
        assert_eq!(events[0], IngestEvent::Resync { skipped: 2 });
        assert!(matches!(events[1], IngestEvent::Block { sweeps: 2, .. }));
        assert_eq!(events.len(), 2);
        assert_eq!(p.archive().len(), 2);
        let stats = p.stats().snapshot();
        assert_eq!(stats.bytes_skipped, 2);
        assert_eq!(stats.status_lines, 0);
    }

    #[test]
    fn stray_hash_is_rejected_across_reads() {
        let mut p = pipeline(FrameLayout::Timed, 2);
        let mut stream = vec![b'#'];
        stream.extend(frame_bytes(FrameLayout::Timed, vec![1, 2], 0, 10));
        let mut events = Vec::new();
        for piece in stream.chunks(1) {
            events.extend(p.feed_at(piece, 0));
        }
        assert_eq!(events[0], IngestEvent::Resync { skipped: 1 });
        assert!(matches!(events[1], IngestEvent::Block { sweeps: 1, .. }));
        assert_eq!(p.archive().len(), 1);
    }

    #[test]
    fn status_lines_survive_surrounding_noise() {
        let mut p = pipeline(FrameLayout::Timed, 2);
        let mut stream = vec![0x13, 0x37];
        stream.extend(b"# RUNNING\n");
        stream.extend([0xFE, b'#', 0x01]);
        stream.extend(b"# bufferSweeps: 3\r\n");
        stream.extend(frame_bytes(FrameLayout::Timed, vec![5, 6], 0, 10));
        let events = p.feed_at(&stream, 0);
        assert_eq!(
            events[..4],
            [
                IngestEvent::Resync { skipped: 2 },
                IngestEvent::Status("# RUNNING".into()),
                IngestEvent::Resync { skipped: 3 },
                IngestEvent::Status("# bufferSweeps: 3".into()),
            ]
        );
        assert!(matches!(events[4], IngestEvent::Block { .. }));
        let stats = p.stats().snapshot();
        assert_eq!(stats.status_lines, 2);
        assert_eq!(stats.bytes_skipped, 5);
    }

    #[test]
    fn unterminated_line_past_the_limit_is_noise() {
        let mut p = pipeline(FrameLayout::Timed, 1);
        let mut stream = b"#".to_vec();
        stream.extend(std::iter::repeat(b'x').take(MAX_STATUS_LINE));
        let events = p.feed_at(&stream, 0);
        assert_eq!(events, vec![IngestEvent::Resync { skipped: MAX_STATUS_LINE + 1 }]);
        let events = p.feed_at(&frame_bytes(FrameLayout::Timed, vec![7], 0, 1), 0);
        assert!(matches!(events[0], IngestEvent::Block { sweeps: 1, .. }));
        assert_eq!(p.stats().snapshot().status_lines, 0);
    }

    #[test]
    fn short_line_waits_for_its_newline() {
        let mut p = pipeline(FrameLayout::Timed, 1);
        let line = "# 温度\n".as_bytes();
        let (head, tail) = line.split_at(line.len() - 2);
        assert!(p.feed_at(head, 0).is_empty());
        let events = p.feed_at(tail, 0);
        assert_eq!(events, vec![IngestEvent::Status("# 温度".into())]);
    }

    #[test]
    fn frames_outside_capture_are_dropped() {
        let mut p = pipeline(FrameLayout::Timed, 2);
        p.set_capturing(false);
        let events = p.feed_at(&frame_bytes(FrameLayout::Timed, vec![1, 2], 0, 10), 0);
        assert!(events.is_empty());
        assert!(p.archive().is_empty());
        assert!(p.buffer().is_empty());
        assert_eq!(p.stats().snapshot().frames_dropped, 1);
    }

    #[test]
    fn partial_trailing_sweep_is_trimmed() {
        let mut p = pipeline(FrameLayout::Timed, 3);
        p.feed_at(&frame_bytes(FrameLayout::Timed, vec![1, 2, 3, 4, 5, 6, 7], 0, 70), 0);
        assert_eq!(p.archive().len(), 2);
        assert_eq!(p.stats().snapshot().partial_samples, 1);
    }

    #[test]
    fn oversized_header_is_a_desync() {
        let mut p = pipeline(FrameLayout::Timed, 1);
        let mut stream = vec![0xAA, 0x55, 0xFF, 0xFF];
        stream.extend(frame_bytes(FrameLayout::Timed, vec![9], 0, 1));
        let events = p.feed_at(&stream, 0);
        assert_eq!(events[0], IngestEvent::Resync { skipped: 4 });
        assert_eq!(p.archive()[0].samples, vec![9]);
    }

    #[test]
    fn compact_frames_use_host_time() {
        let mut p = pipeline(FrameLayout::Compact, 2);
        p.feed_at(&frame_bytes(FrameLayout::Compact, vec![1, 2, 3, 4], 0, 0), 9_000);
        let archived = p.archive();
        assert_eq!(archived[0].timestamp, SweepTimestamp::host(9_000));
        assert_eq!(archived[1].timestamp, SweepTimestamp::host(9_026));
    }

    #[test]
    fn compact_frames_in_one_read_keep_time_moving_forward() {
        let mut p = pipeline(FrameLayout::Compact, 2);
        let mut stream = frame_bytes(FrameLayout::Compact, vec![1, 2, 3, 4], 0, 0);
        stream.extend(frame_bytes(FrameLayout::Compact, vec![5, 6, 7, 8], 0, 0));
        p.feed_at(&stream, 9_000);
        let stamps: Vec<u64> = p.archive().iter().map(|r| r.timestamp.micros).collect();
        assert_eq!(stamps, vec![9_000, 9_026, 9_052, 9_078]);
    }

    #[test]
    fn global_index_survives_clear_and_reconfigure() {
        let mut p = pipeline(FrameLayout::Timed, 1);
        p.feed_at(&frame_bytes(FrameLayout::Timed, vec![1, 2], 0, 10), 0);
        p.clear_buffer();
        p.set_samples_per_sweep(2);
        let events = p.feed_at(&frame_bytes(FrameLayout::Timed, vec![3, 4], 10, 20), 0);
        assert_eq!(
            events,
            vec![IngestEvent::Block {
                first_index: 2,
                sweeps: 1,
                source: TimeSource::Device
            }]
        );
        assert_eq!(p.buffer().latest(5).unwrap().indices, vec![2]);
    }
}
