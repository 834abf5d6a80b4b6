//! Session state machines and the exclusivity lock.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// State of the single output sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSinkState {
    #[default]
    Idle,
    Initializing,
    Playing,
    Draining,
    Ended,
    Errored,
}

impl MediaSinkState {
    /// A session is attached and has not reached a terminal state.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Initializing | Self::Playing | Self::Draining)
    }
}

/// State of the single input device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    #[default]
    Idle,
    Recording,
    Stopping,
}

/// Kind of session that can hold the device lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Playback,
    Capture,
}

/// Current holder of the device lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockHolder {
    #[default]
    None,
    Playback,
    Capture,
}

impl From<SessionKind> for LockHolder {
    fn from(kind: SessionKind) -> Self {
        match kind {
            SessionKind::Playback => Self::Playback,
            SessionKind::Capture => Self::Capture,
        }
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "no",
            Self::Playback => "playback",
            Self::Capture => "capture",
        })
    }
}

/// Single-owner token guarding the output sink and the input device.
///
/// At most one session kind holds the lock at any time. A request for either
/// kind while the lock is held is refused rather than interrupting the holder.
#[derive(Debug, Default)]
pub struct SessionLock {
    holder: LockHolder,
}

impl SessionLock {
    pub const fn new() -> Self {
        Self {
            holder: LockHolder::None,
        }
    }

    /// Get the current holder.
    pub const fn holder(&self) -> LockHolder {
        self.holder
    }

    /// Check if no session holds the lock.
    pub const fn is_free(&self) -> bool {
        matches!(self.holder, LockHolder::None)
    }

    /// Acquire the lock for `kind`.
    pub fn acquire(&mut self, kind: SessionKind) -> Result<()> {
        if !self.is_free() {
            return Err(Error::SessionBusy {
                holder: self.holder,
            });
        }
        self.holder = kind.into();
        Ok(())
    }

    /// Release the lock if `kind` holds it. Returns whether anything was released.
    pub fn release(&mut self, kind: SessionKind) -> bool {
        if self.holder == LockHolder::from(kind) {
            self.holder = LockHolder::None;
            true
        } else {
            false
        }
    }
}
