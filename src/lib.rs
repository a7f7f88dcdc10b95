//! Multi-channel ADC streaming: device-side scan planning and block capture,
//! the binary block frame, and host-side ingestion into a sweep ring with
//! wrap-safe timestamps.
pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod protocol;
pub mod types;

pub use config::StreamerConfig;
pub use error::{Result, StreamError};
pub use types::{DeviceCommand, HostCommand, RunMode, StreamMessage};
