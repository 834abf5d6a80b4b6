//! # voxgate-audio
//!
//! Session coordinator and audio device backends for voxgate.
//!
//! Features:
//! - One coordinator thread owning the output sink, the input device and the lock between them
//! - Ordered chunk intake with a single in-flight append
//! - Generation-stamped sink events, so stale completions are ignored
//! - symphonia decoding and cpal output/input

pub mod capture;
pub mod chunk_buffer;
pub mod coordinator;
pub mod decode;
pub mod event;
pub mod pcm;
pub mod pending;
pub mod resample;
pub mod sink;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use capture::{CaptureFormat, CaptureSession, CpalInput, InputDevice};
pub use chunk_buffer::ChunkBuffer;
pub use coordinator::{CoordinatorSnapshot, SessionCoordinator};
pub use event::CoordinatorEvent;
pub use pending::Pending;
pub use sink::{CpalSink, MediaSink, SinkBackend, SinkEvent, SinkEvents, SinkSource};
