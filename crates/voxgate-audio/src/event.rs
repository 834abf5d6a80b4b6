//! Events emitted by the coordinator.

use voxgate_core::{CaptureState, CapturedAudio, LockHolder, MediaSinkState};

/// Observable changes inside the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// The output sink changed state.
    SinkStateChanged(MediaSinkState),
    /// The capture session changed state.
    CaptureStateChanged(CaptureState),
    /// The device lock changed hands.
    LockChanged(LockHolder),
    /// A recording reached the duration cap and was finished without a stop request.
    RecordingComplete(CapturedAudio),
    /// A sink event from a superseded session was dropped.
    StaleEventDiscarded { generation: u64 },
}
