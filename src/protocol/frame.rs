//! Binary block frame shared by the device encoder and the host decoder.
//!
//! Layout (little-endian):
//!
//! ```text
//! 0       2     magic 0xAA 0x55
//! 2       2     sampleCount N
//! 4       2*N   samples (u16)
//! 4+2N    2     avgIntervalMicros (u16, saturating)
//! 6+2N    4     blockStartMicros  (timed layout only)
//! 10+2N   4     blockEndMicros    (timed layout only)
//! ```
//!
//! The layout is not self-describing; both ends agree on [`FrameLayout`] out of band.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::config::MAX_SAMPLES_BUFFER;
pub const MAGIC: [u8; 2] = [0xAA, 0x55];
pub const HEADER_LEN: usize = 4;
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameLayout {
    /// Footer carries only the average interval.
    Compact,
    /// Footer carries the average interval plus device start/end micros.
    #[default]
    Timed,
}
impl FrameLayout {
    pub fn footer_len(self) -> usize {
        match self {
            FrameLayout::Compact => 2,
            FrameLayout::Timed => 10,
        }
    }
    pub fn frame_len(self, sample_count: usize) -> usize {
        HEADER_LEN + 2 * sample_count + self.footer_len()
    }
}
/// Device clock readings bracketing one block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTiming {
    pub start_micros: u32,
    pub end_micros: u32,
}
impl BlockTiming {
    /// Elapsed device time, modulo 2^32.
    pub fn elapsed_micros(&self) -> u32 {
        self.end_micros.wrapping_sub(self.start_micros)
    }
}
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub samples: Vec<u16>,
    pub avg_interval_micros: u16,
    /// `None` when the frame was decoded from the compact layout.
    pub timing: Option<BlockTiming>,
}
impl Frame {
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    Frame { frame: Frame, consumed: usize },
    /// The buffer holds a valid prefix; at least `needed` bytes are required in total.
    NeedMore { needed: usize },
}
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("expected magic AA 55, found {0:02X} {1:02X}")]
    BadMagic(u8, u8),
    #[error("header declares {count} samples, limit is {max}")]
    Oversized { count: usize, max: usize },
    #[error("{0} samples do not fit a u16 sample count")]
    TooManySamples(usize),
}
/// Saturates an interval to the 16-bit footer field.
pub fn clamp_interval(micros: u32) -> u16 {
    micros.min(u16::MAX as u32) as u16
}
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    layout: FrameLayout,
    max_samples: usize,
}
impl FrameCodec {
    pub fn new(layout: FrameLayout) -> Self {
        Self {
            layout,
            max_samples: MAX_SAMPLES_BUFFER,
        }
    }
    /// Overrides the largest sample count a header may declare before it is
    /// treated as corruption.
    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples;
        self
    }
    pub fn layout(&self) -> FrameLayout {
        self.layout
    }
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(self.layout.frame_len(frame.sample_count()));
        self.encode_into(frame, &mut out)?;
        Ok(out)
    }
    pub fn encode_into(&self, frame: &Frame, out: &mut Vec<u8>) -> Result<(), FrameError> {
        let count = u16::try_from(frame.samples.len())
            .map_err(|_| FrameError::TooManySamples(frame.samples.len()))?;
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&count.to_le_bytes());
        for sample in &frame.samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out.extend_from_slice(&frame.avg_interval_micros.to_le_bytes());
        if self.layout == FrameLayout::Timed {
            let timing = frame.timing.unwrap_or_default();
            out.extend_from_slice(&timing.start_micros.to_le_bytes());
            out.extend_from_slice(&timing.end_micros.to_le_bytes());
        }
        Ok(())
    }
    /// Decodes one frame from the front of `buf`.
    ///
    /// `buf` must start at a header; this never scans for the magic itself, see
    /// [`FrameCodec::find_magic`].
    pub fn decode(&self, buf: &[u8]) -> Result<Decoded, FrameError> {
        if buf.len() < 2 {
            if let Some(&first) = buf.first() {
                if first != MAGIC[0] {
                    return Err(FrameError::BadMagic(first, 0));
                }
            }
            return Ok(Decoded::NeedMore { needed: HEADER_LEN });
        }
        if buf[0] != MAGIC[0] || buf[1] != MAGIC[1] {
            return Err(FrameError::BadMagic(buf[0], buf[1]));
        }
        if buf.len() < HEADER_LEN {
            return Ok(Decoded::NeedMore { needed: HEADER_LEN });
        }
        let count = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        if count > self.max_samples {
            return Err(FrameError::Oversized {
                count,
                max: self.max_samples,
            });
        }
        let total = self.layout.frame_len(count);
        if buf.len() < total {
            return Ok(Decoded::NeedMore { needed: total });
        }
        let payload_end = HEADER_LEN + 2 * count;
        let samples = buf[HEADER_LEN..payload_end]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let avg_interval_micros = u16::from_le_bytes([buf[payload_end], buf[payload_end + 1]]);
        let timing = match self.layout {
            FrameLayout::Compact => None,
            FrameLayout::Timed => {
                let ts = payload_end + 2;
                Some(BlockTiming {
                    start_micros: read_u32(&buf[ts..ts + 4]),
                    end_micros: read_u32(&buf[ts + 4..ts + 8]),
                })
            }
        };
        Ok(Decoded::Frame {
            frame: Frame {
                samples,
                avg_interval_micros,
                timing,
            },
            consumed: total,
        })
    }
    /// Resynchronisation scan: offset of the next candidate header after
    /// position 0. A trailing lone `0xAA` is reported so it can be kept for the
    /// next read; `None` means every byte can be discarded.
    pub fn find_magic(buf: &[u8]) -> Option<usize> {
        if buf.len() < 2 {
            return None;
        }
        (1..buf.len()).find(|&i| {
            buf[i] == MAGIC[0] && (i + 1 == buf.len() || buf[i + 1] == MAGIC[1])
        })
    }
}
fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
