//! Wire messages exchanged with the messaging layer.
//!
//! Requests and responses are JSON objects, one per line. Every request
//! carries an `id` that is echoed on its response so responses can be
//! delivered out of order.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{CaptureMetadata, CapturedAudio, PlaybackOutcome, StopOutcome};

/// A request with its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

impl Envelope {
    /// Parse one line of input.
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::Protocol(format!("Malformed request: {e}")))
    }

    /// Best-effort extraction of the id from a line that failed to parse.
    pub fn salvage_id(line: &str) -> Option<u64> {
        serde_json::from_str::<serde_json::Value>(line)
            .ok()?
            .get("id")?
            .as_u64()
    }
}

/// Requests accepted by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    /// Play one addressable resource.
    PlayUrl { url: String },
    /// Append one base64-encoded chunk to the current stream.
    PlayChunk {
        #[serde(default)]
        data: String,
        #[serde(default)]
        done: bool,
    },
    /// Start recording from the input device.
    StartCapture {
        #[serde(default)]
        metadata: CaptureMetadata,
    },
    /// Stop recording and return the audio.
    StopCapture,
    /// Stop playback immediately.
    StopPlayback,
}

impl Request {
    /// Decode the payload of a `playChunk` request.
    pub fn decode_chunk(data: &str) -> Result<Bytes> {
        if data.is_empty() {
            return Ok(Bytes::new());
        }
        STANDARD
            .decode(data)
            .map(Bytes::from)
            .map_err(|e| Error::Protocol(format!("Invalid chunk encoding: {e}")))
    }

    /// Encode raw bytes as a `playChunk` payload.
    pub fn encode_chunk(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// A response to exactly one request, or an unsolicited notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Recorded audio as a `data:` URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CaptureMetadata>,
}

impl Response {
    pub fn success(id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            id,
            action: None,
            status: Status::Success,
            message: Some(message.into()),
            audio: None,
            metadata: None,
        }
    }

    pub fn error(id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            id,
            action: None,
            status: Status::Error,
            message: Some(message.into()),
            audio: None,
            metadata: None,
        }
    }

    pub fn from_error(id: Option<u64>, err: &Error) -> Self {
        Self::error(id, err.to_string())
    }

    pub fn from_playback(id: u64, result: Result<PlaybackOutcome>) -> Self {
        match result {
            Ok(outcome) => Self::success(Some(id), outcome.message()),
            Err(e) => Self::from_error(Some(id), &e),
        }
    }

    pub fn from_stop(id: u64, result: Result<StopOutcome>) -> Self {
        match result {
            Ok(outcome) => Self::success(Some(id), outcome.message()),
            Err(e) => Self::from_error(Some(id), &e),
        }
    }

    pub fn from_capture_start(id: u64, result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::success(Some(id), "Recording started"),
            Err(e) => Self::from_error(Some(id), &e),
        }
    }

    /// Response to a stop-capture request. `None` means nothing was recording.
    pub fn from_capture_stop(id: u64, result: Result<Option<CapturedAudio>>) -> Self {
        match result {
            Ok(Some(captured)) => Self {
                message: Some("Recording complete".to_string()),
                ..Self::recording(Some(id), &captured)
            },
            Ok(None) => Self::success(Some(id), "Recording stopped"),
            Err(e) => Self::from_error(Some(id), &e),
        }
    }

    /// Unsolicited notification carrying a finished recording.
    pub fn recording_complete(captured: &CapturedAudio) -> Self {
        Self {
            action: Some("recordingComplete".to_string()),
            ..Self::recording(None, captured)
        }
    }

    fn recording(id: Option<u64>, captured: &CapturedAudio) -> Self {
        Self {
            id,
            action: None,
            status: Status::Success,
            message: None,
            audio: Some(data_url(&captured.mime_type, &captured.audio)),
            metadata: Some(captured.metadata.clone()),
        }
    }

    /// Serialize to a single output line.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Encode bytes as a `data:` URL.
pub fn data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(bytes))
}
