//! Encoder invocation for fconv

pub mod ffmpeg;

pub use ffmpeg::{build_encode_command, EncodeCommand, Encoder, INPUT_FLAG, THREAD_FLAG};
