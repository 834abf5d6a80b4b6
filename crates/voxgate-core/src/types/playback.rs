//! Playback requests and their outcomes.

use super::AudioChunk;

/// A request to play audio.
#[derive(Debug, PartialEq, Eq)]
pub enum PlaybackRequest {
    /// Play a single addressable resource (URL or local path).
    UrlPlayback { resource_locator: String },
    /// One fragment of a streamed payload. `is_final` closes the stream.
    StreamChunk { chunk: AudioChunk, is_final: bool },
}

impl PlaybackRequest {
    pub fn url(resource_locator: impl Into<String>) -> Self {
        Self::UrlPlayback {
            resource_locator: resource_locator.into(),
        }
    }

    pub fn chunk(chunk: impl Into<AudioChunk>, is_final: bool) -> Self {
        Self::StreamChunk {
            chunk: chunk.into(),
            is_final,
        }
    }

    /// Short label used in logs.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::UrlPlayback { .. } => "url",
            Self::StreamChunk { is_final: true, .. } => "final chunk",
            Self::StreamChunk { .. } => "chunk",
        }
    }
}

/// Successful result of a playback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// The session played to its natural end.
    Ended,
    /// The output reported a pause before the end, which ends the session.
    Paused,
    /// The session was stopped by an explicit stop request.
    Stopped,
    /// The request was queued behind another session and dropped by a stop request.
    Cancelled,
    /// A non-final chunk was accepted into its stream.
    ChunkQueued,
    /// The stream closed without carrying any audio.
    Empty,
}

impl PlaybackOutcome {
    /// Human-readable message for responses.
    pub const fn message(self) -> &'static str {
        match self {
            Self::Ended => "Audio playback ended",
            Self::Paused => "Audio paused",
            Self::Stopped => "Audio stopped",
            Self::Cancelled => "Playback cancelled before it started",
            Self::ChunkQueued => "Chunk queued",
            Self::Empty => "No audio data received",
        }
    }
}

/// Result of a stop-playback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// Whether a session (active or queued) was actually stopped.
    pub was_playing: bool,
}

impl StopOutcome {
    pub const fn message(self) -> &'static str {
        if self.was_playing {
            "Audio stopped"
        } else {
            "No audio playing"
        }
    }
}
