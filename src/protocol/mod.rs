// src/protocol/mod.rs
pub mod frame;
pub use frame::{
    clamp_interval, BlockTiming, Decoded, Frame, FrameCodec, FrameError, FrameLayout, HEADER_LEN,
    MAGIC,
};
