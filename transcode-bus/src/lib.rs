//! Segment-aligned transcoding: demux, decode, transfer off the device,
//! encode and cut the result into keyframe-aligned segments.

pub mod bsf;
pub mod bus;
pub mod codec;
pub mod decoder;
pub mod encoder;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod format;
pub mod frame;
pub mod hw;
pub mod input;
pub mod output;
pub mod packet;
pub mod pipeline;
pub mod playlist;
pub mod rational;
pub mod raw;
pub mod scaler;
pub mod segment;
pub mod stream;
pub mod timestamp;

pub use error::{Error, Result, TrySubmitError};
pub use rational::{Rational, TimeBase};
