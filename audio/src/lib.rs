//! Audio plumbing for the voice-dialog client.
//!
//! This crate provides the realtime audio building blocks:
//!
//! - `queue`: thread-safe byte FIFO between producers and consumers
//! - `convert`: stateful PCM format, channel, and sample-rate conversion
//! - `device`: capture and playback devices with listener fan-out
//!
//! # Example
//!
//! ```rust
//! use voxlink_audio::AudioQueue;
//!
//! let queue = AudioQueue::new();
//! queue.push(&[1, 2, 3, 4]);
//!
//! // Under-run is a normal condition: an empty queue returns no bytes.
//! let head = queue.pop_front(2);
//! assert_eq!(head, vec![1, 2]);
//! ```

pub mod convert;
pub mod device;
pub mod queue;

mod error;

pub use convert::{PcmConverter, SampleFormat};
pub use device::{
    CaptureConfig, CaptureDevice, CaptureSink, ListenerId, PlaybackConfig, PlaybackDevice,
    PlaybackSource,
};
pub use error::{Error, Result};
pub use queue::AudioQueue;
