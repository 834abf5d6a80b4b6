//! The output sink and its state machine.
//!
//! [`MediaSink`] owns the single output resource through a [`SinkBackend`].
//! The backend does the actual rendering and reports progress asynchronously
//! through [`SinkEvents`], stamped with the session generation it was opened
//! for so the coordinator can drop events from superseded sessions.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

pub mod device;

pub use device::CpalSink;

use crossbeam_channel::Sender;
use tracing::{debug, error, trace, warn};
use voxgate_core::{AudioChunk, Error, MediaSinkState, PlaybackOutcome, Result};

use crate::event::CoordinatorEvent;

/// What the sink is asked to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkSource {
    /// A complete resource: `http(s)://` URL, `file://` URL, or local path.
    Url(String),
    /// Bytes delivered incrementally through [`SinkBackend::append`].
    Stream,
}

/// Progress reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// The last appended chunk has been taken in; the next one may follow.
    AppendComplete,
    /// Audio is audibly playing.
    Started,
    /// All data has been played.
    Ended,
    /// Playback was paused from outside the coordinator.
    ///
    /// The session ends here: the sink moves to [`MediaSinkState::Ended`] like a
    /// natural end, and only the outcome ([`PlaybackOutcome::Paused`]) tells them apart.
    Paused,
    /// Playback failed.
    Failed(String),
}

/// A backend event tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkEnvelope {
    pub generation: u64,
    pub event: SinkEvent,
}

/// Handle a backend uses to report events for one session.
#[derive(Debug, Clone)]
pub struct SinkEvents {
    generation: u64,
    tx: Sender<SinkEnvelope>,
}

impl SinkEvents {
    pub const fn new(generation: u64, tx: Sender<SinkEnvelope>) -> Self {
        Self { generation, tx }
    }

    /// Session generation these events belong to.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event. Silently dropped once the coordinator is gone.
    pub fn emit(&self, event: SinkEvent) {
        let envelope = SinkEnvelope {
            generation: self.generation,
            event,
        };
        if self.tx.send(envelope).is_err() {
            trace!("Coordinator gone, dropping sink event");
        }
    }
}

/// A playable output resource.
///
/// Calls come only from the coordinator thread. Completion of `append`,
/// the start of audible playback, and the end of playback are reported
/// through the [`SinkEvents`] handed to `open`, never by return value.
pub trait SinkBackend {
    /// Attach the output resource for a new session.
    fn open(&mut self, source: SinkSource, events: SinkEvents) -> Result<()>;
    /// Take in one chunk. Reports [`SinkEvent::AppendComplete`] when done.
    fn append(&mut self, chunk: AudioChunk) -> Result<()>;
    /// Begin playback. Reports [`SinkEvent::Started`] once audio flows.
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self);
    /// No more chunks will be appended.
    fn end_of_stream(&mut self) -> Result<()>;
    /// Detach the output resource. Nothing may be reported afterwards.
    fn release(&mut self);
}

/// How a session ended, as observed by the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Ended,
    Paused,
    Failed(String),
}

impl Terminal {
    pub fn into_outcome(self) -> Result<PlaybackOutcome> {
        match self {
            Self::Ended => Ok(PlaybackOutcome::Ended),
            Self::Paused => Ok(PlaybackOutcome::Paused),
            Self::Failed(message) => Err(Error::SinkFailure(message)),
        }
    }
}

/// State machine around the single output resource.
pub struct MediaSink<B> {
    backend: B,
    state: MediaSinkState,
    /// An append has been issued and its completion not yet observed.
    append_in_flight: bool,
    play_requested: bool,
    /// End of stream arrived before playback started.
    drain_pending: bool,
    attached: bool,
    appended_bytes: u64,
    event_tx: Sender<CoordinatorEvent>,
}

impl<B: SinkBackend> MediaSink<B> {
    pub const fn new(backend: B, event_tx: Sender<CoordinatorEvent>) -> Self {
        Self {
            backend,
            state: MediaSinkState::Idle,
            append_in_flight: false,
            play_requested: false,
            drain_pending: false,
            attached: false,
            appended_bytes: 0,
            event_tx,
        }
    }

    pub const fn state(&self) -> MediaSinkState {
        self.state
    }

    /// True while a previous append has not completed.
    pub const fn is_busy(&self) -> bool {
        self.append_in_flight
    }

    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Bytes handed to the backend during the current session.
    pub const fn appended_bytes(&self) -> u64 {
        self.appended_bytes
    }

    /// Attach the output for a new session. URL sources start playing right away.
    pub fn open(&mut self, source: SinkSource, events: SinkEvents) -> Result<()> {
        if self.state != MediaSinkState::Idle {
            return Err(Error::InvalidTransition(format!(
                "open while sink is {:?}",
                self.state
            )));
        }

        let is_url = matches!(source, SinkSource::Url(_));
        self.set_state(MediaSinkState::Initializing);
        self.attached = true;

        if let Err(e) = self.backend.open(source, events) {
            error!("Failed to open sink: {e}");
            self.set_state(MediaSinkState::Errored);
            return Err(e);
        }

        if is_url {
            self.play()?;
        }
        Ok(())
    }

    /// Hand one chunk to the backend.
    ///
    /// Rejected with [`Error::NotReady`] while the previous append is in flight.
    pub fn append(&mut self, chunk: AudioChunk) -> Result<()> {
        if self.append_in_flight {
            return Err(Error::NotReady);
        }
        if !self.state.is_active() {
            return Err(Error::InvalidTransition(format!(
                "append while sink is {:?}",
                self.state
            )));
        }

        let len = chunk.len();
        self.append_in_flight = true;
        if let Err(e) = self.backend.append(chunk) {
            error!("Append failed: {e}");
            self.append_in_flight = false;
            self.set_state(MediaSinkState::Errored);
            return Err(e);
        }

        self.appended_bytes += len as u64;
        trace!("Appended {len} bytes ({} total)", self.appended_bytes);
        Ok(())
    }

    /// Start playback. Only the first call reaches the backend.
    pub fn play(&mut self) -> Result<()> {
        if self.play_requested {
            return Ok(());
        }
        self.play_requested = true;
        self.backend.play().inspect_err(|e| {
            error!("Playback failed to start: {e}");
            self.set_state(MediaSinkState::Errored);
        })
    }

    pub fn pause(&mut self) {
        if self.state.is_active() {
            self.backend.pause();
        }
    }

    /// Tell the backend no more data will follow.
    pub fn end_of_stream(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(Error::InvalidTransition(format!(
                "end of stream while sink is {:?}",
                self.state
            )));
        }
        self.backend.end_of_stream().inspect_err(|e| {
            error!("Failed to end stream: {e}");
            self.set_state(MediaSinkState::Errored);
        })
    }

    /// The final chunk has been received; drain what is left.
    pub fn mark_final(&mut self) {
        match self.state {
            MediaSinkState::Playing => self.set_state(MediaSinkState::Draining),
            MediaSinkState::Initializing => self.drain_pending = true,
            _ => {}
        }
    }

    /// Drop the session and return to `Idle`. Always permitted.
    pub fn reset(&mut self) {
        if self.attached {
            self.backend.pause();
            self.backend.release();
            self.attached = false;
        }
        self.append_in_flight = false;
        self.play_requested = false;
        self.drain_pending = false;
        self.appended_bytes = 0;
        self.set_state(MediaSinkState::Idle);
    }

    /// Apply a backend event. Returns the terminal result once the session ends.
    pub fn on_event(&mut self, event: SinkEvent) -> Result<Option<Terminal>> {
        match event {
            SinkEvent::AppendComplete => {
                self.append_in_flight = false;
                if self.state == MediaSinkState::Initializing {
                    self.play()?;
                }
                Ok(None)
            }
            SinkEvent::Started => {
                if self.state == MediaSinkState::Initializing {
                    self.set_state(MediaSinkState::Playing);
                    if self.drain_pending {
                        self.drain_pending = false;
                        self.set_state(MediaSinkState::Draining);
                    }
                }
                Ok(None)
            }
            SinkEvent::Ended => Ok(self.finish(MediaSinkState::Ended, Terminal::Ended)),
            SinkEvent::Paused => Ok(self.finish(MediaSinkState::Ended, Terminal::Paused)),
            SinkEvent::Failed(message) => {
                error!("Sink reported failure: {message}");
                Ok(self.finish(MediaSinkState::Errored, Terminal::Failed(message)))
            }
        }
    }

    fn finish(&mut self, state: MediaSinkState, terminal: Terminal) -> Option<Terminal> {
        if !self.state.is_active() {
            warn!("Ignoring {terminal:?} while sink is {:?}", self.state);
            return None;
        }
        self.set_state(state);
        Some(terminal)
    }

    fn set_state(&mut self, new_state: MediaSinkState) {
        let old_state = std::mem::replace(&mut self.state, new_state);
        if old_state != new_state {
            debug!("Sink state changed: {:?} -> {:?}", old_state, new_state);
            let _ = self
                .event_tx
                .send(CoordinatorEvent::SinkStateChanged(new_state));
        }
    }
}
