//! In-process byte wire between a device runner and the ingest thread.
//!
//! Behaves like a serial port from the reader's side: a read that finds
//! nothing within the timeout fails with `TimedOut`, and a closed writer reads
//! as end of stream. The writer can split every write into random fragments.
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn loopback(read_timeout: Duration) -> (WireWriter, WireReader) {
    let (tx, rx) = mpsc::channel();
    (
        WireWriter {
            tx,
            fragmenter: None,
        },
        WireReader {
            rx,
            timeout: read_timeout,
            chunk: Vec::new(),
            offset: 0,
        },
    )
}

pub struct WireWriter {
    tx: Sender<Vec<u8>>,
    fragmenter: Option<(StdRng, usize)>,
}

impl WireWriter {
    /// Splits each write into chunks of 1..=`max_fragment` bytes.
    pub fn with_fragmentation(mut self, max_fragment: usize, seed: u64) -> Self {
        self.fragmenter = Some((StdRng::seed_from_u64(seed), max_fragment.max(1)));
        self
    }

    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "wire reader dropped"))
    }
}

impl Write for WireWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let chunks: Vec<&[u8]> = match self.fragmenter.as_mut() {
            None => vec![buf],
            Some((rng, max)) => {
                let mut rest = buf;
                let mut chunks = Vec::new();
                while !rest.is_empty() {
                    let n = rng.gen_range(1..=*max).min(rest.len());
                    let (head, tail) = rest.split_at(n);
                    chunks.push(head);
                    rest = tail;
                }
                chunks
            }
        };
        for chunk in chunks {
            self.send(chunk)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct WireReader {
    rx: Receiver<Vec<u8>>,
    timeout: Duration,
    chunk: Vec<u8>,
    offset: usize,
}

impl Read for WireReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.offset == self.chunk.len() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.offset = 0;
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "wire idle"))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.offset);
        buf[..n].copy_from_slice(&self.chunk[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragmented_bytes_arrive_intact() {
        let (writer, mut reader) = loopback(Duration::from_millis(50));
        let mut writer = writer.with_fragmentation(3, 7);
        let payload: Vec<u8> = (0..=255).collect();
        writer.write_all(&payload).unwrap();
        drop(writer);
        let mut received = Vec::new();
        reader.read_to_end(&mut received).unwrap();
        assert_eq!(received, payload);
    }

    #[test]
    fn idle_wire_times_out() {
        let (_writer, mut reader) = loopback(Duration::from_millis(1));
        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn write_after_reader_dropped_fails() {
        let (mut writer, reader) = loopback(Duration::from_millis(1));
        drop(reader);
        assert!(writer.write(b"x").is_err());
    }
}
