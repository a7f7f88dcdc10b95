// src/host/engine.rs
use std::io::{ErrorKind, Read};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};

use log::{error, info};
use serialport::SerialPort;

use crate::config::StreamerConfig;
use crate::error::Result;
use crate::host::archive::ArchiveSink;
use crate::host::ingest::{IngestEvent, IngestPipeline};
use crate::types::{HostCommand, StreamMessage};

const READ_CHUNK: usize = 4096;

impl From<IngestEvent> for StreamMessage {
    fn from(event: IngestEvent) -> Self {
        match event {
            IngestEvent::Block {
                first_index,
                sweeps,
                source,
            } => StreamMessage::Block {
                first_index,
                sweeps,
                source,
            },
            IngestEvent::Status(line) => StreamMessage::DeviceStatus(line),
            IngestEvent::Resync { skipped } => StreamMessage::Resync { skipped },
        }
    }
}

/// Opens the device port with the configured baud rate and read timeout.
pub fn open_serial(port: &str, config: &StreamerConfig) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(port, config.baud_rate)
        .timeout(config.read_timeout())
        .open()?;
    info!("opened {} at {} baud", port.name().unwrap_or_default(), config.baud_rate);
    Ok(port)
}

/// Runs the ingest pipeline on its own thread until the reader reaches end of
/// stream, fails, or a `Shutdown` arrives. The pipeline is handed back on join.
pub fn spawn_ingest<R, A>(
    mut reader: R,
    mut pipeline: IngestPipeline<A>,
    tx: Sender<StreamMessage>,
    rx_cmd: Receiver<HostCommand>,
) -> JoinHandle<IngestPipeline<A>>
where
    R: Read + Send + 'static,
    A: ArchiveSink + Send + 'static,
{
    thread::spawn(move || {
        tx.send(StreamMessage::Log("ingest thread ready".to_owned())).ok();
        let mut buf = vec![0u8; READ_CHUNK];

        'outer: loop {
            // ============================================================
            // 1. 处理控制端命令
            // ============================================================
            loop {
                match rx_cmd.try_recv() {
                    Ok(HostCommand::StartCapture) => {
                        pipeline.set_capturing(true);
                        tx.send(StreamMessage::Capturing(true)).ok();
                    }
                    Ok(HostCommand::StopCapture) => {
                        pipeline.set_capturing(false);
                        tx.send(StreamMessage::Capturing(false)).ok();
                    }
                    Ok(HostCommand::SetSamplesPerSweep(n)) => pipeline.set_samples_per_sweep(n),
                    Ok(HostCommand::ClearBuffer) => pipeline.clear_buffer(),
                    Ok(HostCommand::Shutdown) | Err(TryRecvError::Disconnected) => break 'outer,
                    Err(TryRecvError::Empty) => break,
                }
            }

            // ============================================================
            // 2. 读取字节流
            // ============================================================
            match reader.read(&mut buf) {
                Ok(0) => {
                    tx.send(StreamMessage::Log("end of stream".to_owned())).ok();
                    break;
                }
                Ok(n) => {
                    for event in pipeline.feed(&buf[..n]) {
                        tx.send(event.into()).ok();
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    error!("read failed: {e}");
                    tx.send(StreamMessage::Error(e.to_string())).ok();
                    break;
                }
            }
        }

        let stats = pipeline.stats().snapshot();
        info!(
            "ingest stopped: {} sweeps, {} bytes skipped, {} frames dropped",
            stats.sweeps_ingested, stats.bytes_skipped, stats.frames_dropped
        );
        tx.send(StreamMessage::Stopped).ok();
        pipeline
    })
}
