// src/types.rs
use std::time::Duration;

use crate::device::GroundMode;
use crate::host::TimeSource;

// 采集运行方式
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum RunMode {
    Continuous,
    /// Stops at the first block boundary after the limit has elapsed.
    Timed(Duration),
}

// 外部命令层发给设备的命令 (已校验过的值)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceCommand {
    Channels(Vec<u8>),
    Repeat(u16),
    Ground(GroundMode),
    BufferSweeps(u16),
    WarmupSweeps(u16),
    Run(RunMode),
    Stop,
}

// 控制端发给接收线程的命令
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostCommand {
    StartCapture,
    StopCapture,
    SetSamplesPerSweep(usize),
    ClearBuffer,
    Shutdown,
}

// 接收线程发回控制端的消息
#[derive(Clone, Debug, PartialEq)]
pub enum StreamMessage {
    Log(String),
    /// A `#` status line from the device, verbatim without the newline.
    DeviceStatus(String),
    Capturing(bool),
    Block {
        first_index: u64,
        sweeps: usize,
        source: TimeSource,
    },
    Resync {
        skipped: usize,
    },
    Error(String),
    Stopped,
}
