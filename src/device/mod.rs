// src/device/mod.rs
// 设备端: 扫描表规划 / 分块采集 / 主循环
pub mod capture;
pub mod runner;
pub mod scan;
pub mod session;
pub mod sim;
pub use capture::{Block, BlockCapturer, CaptureState, ScanHardware};
pub use runner::{DeviceRunner, RunnerStats};
pub use scan::{
    limit_sweeps_per_block, max_sweeps_per_block, plan_entries, scan_entries_per_sweep, scan_plan,
    suggest_sweeps_per_block, BlockCandidate, GroundMode, ScanEntry, ScanPlan,
    DEFAULT_TARGET_LATENCY, USB_PACKET_SIZE,
};
pub use session::{AcquisitionSettings, AppliedPlan, Session};
pub use sim::SimulatedAdc;
