//! Core domain types for voxgate.

pub mod capture;
pub mod chunk;
pub mod playback;
pub mod session;

pub use capture::{CaptureMetadata, CapturedAudio};
pub use chunk::AudioChunk;
pub use playback::{PlaybackOutcome, PlaybackRequest, StopOutcome};
pub use session::{CaptureState, LockHolder, MediaSinkState, SessionKind, SessionLock};
