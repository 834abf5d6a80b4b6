//! Capture metadata and finished recordings.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque caller context carried from capture start to capture completion.
///
/// Never inspected or altered by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureMetadata(serde_json::Value);

impl CaptureMetadata {
    pub const fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub const fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for CaptureMetadata {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// A finished recording.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedAudio {
    /// Everything captured since start, in capture order.
    pub audio: Bytes,
    /// MIME type of `audio`.
    pub mime_type: String,
    /// The metadata supplied at start, unchanged.
    pub metadata: CaptureMetadata,
}
