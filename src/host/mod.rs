// src/host/mod.rs
// 主机端: 接收 / 时间戳重建 / 环形缓冲区 / 归档
pub mod archive;
pub mod buffer;
pub mod engine;
pub mod ingest;
pub mod timestamp;
pub mod wire;
pub use archive::{ArchiveMetadata, ArchiveReader, ArchiveSink, JsonlArchive};
pub use buffer::{SharedSweepBuffer, SweepRecord, SweepRing, SweepViewer, SweepWindow, ViewMode};
pub use engine::{open_serial, spawn_ingest};
pub use ingest::{IngestEvent, IngestPipeline, IngestSnapshot, IngestStats, MAX_STATUS_LINE};
pub use timestamp::{
    wrap_delta, BlockTimingRecord, ClockUnwrapper, SweepTimestamp, TimeSource,
    TimestampReconstructor,
};
pub use wire::{loopback, WireReader, WireWriter};
