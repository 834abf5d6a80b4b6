//! Scripted backends for driving the coordinator without audio hardware.
//!
//! Each backend comes with a control handle that stays with the test while
//! the backend itself moves into the coordinator thread.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use voxgate_core::{AudioChunk, Error, Result};

use crate::capture::{CaptureFormat, InputDevice};
use crate::sink::{SinkBackend, SinkEvent, SinkEvents, SinkSource};

#[derive(Default)]
struct SinkScript {
    auto_ack: bool,
    auto_start: bool,
    auto_end: bool,
    fail_open: Option<String>,
    fail_append: Option<String>,
    events: Option<SinkEvents>,
    opened: Vec<SinkSource>,
    appended: Vec<u8>,
    chunks: usize,
    play_calls: usize,
    pauses: usize,
    end_of_streams: usize,
    releases: usize,
}

/// Output backend that records everything and emits events on command.
pub struct ScriptedSink {
    script: Arc<Mutex<SinkScript>>,
}

/// Test-side handle to a [`ScriptedSink`].
#[derive(Clone)]
pub struct SinkControl {
    script: Arc<Mutex<SinkScript>>,
}

impl ScriptedSink {
    pub fn new() -> (Self, SinkControl) {
        let script = Arc::new(Mutex::new(SinkScript::default()));
        (
            Self {
                script: script.clone(),
            },
            SinkControl { script },
        )
    }

    pub fn appended(&self) -> Vec<u8> {
        self.script.lock().appended.clone()
    }

    pub fn play_called(&self) -> bool {
        self.script.lock().play_calls > 0
    }

    pub fn releases(&self) -> usize {
        self.script.lock().releases
    }
}

impl SinkBackend for ScriptedSink {
    fn open(&mut self, source: SinkSource, events: SinkEvents) -> Result<()> {
        let mut script = self.script.lock();
        if let Some(message) = script.fail_open.take() {
            return Err(Error::DeviceUnavailable(message));
        }
        script.opened.push(source);
        script.events = Some(events);
        Ok(())
    }

    fn append(&mut self, chunk: AudioChunk) -> Result<()> {
        let mut script = self.script.lock();
        if let Some(message) = script.fail_append.take() {
            return Err(Error::SinkFailure(message));
        }
        script.appended.extend_from_slice(chunk.as_bytes());
        script.chunks += 1;
        if script.auto_ack {
            if let Some(events) = &script.events {
                events.emit(SinkEvent::AppendComplete);
            }
        }
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        let mut script = self.script.lock();
        script.play_calls += 1;
        if script.auto_start {
            if let Some(events) = &script.events {
                events.emit(SinkEvent::Started);
            }
        }
        Ok(())
    }

    fn pause(&mut self) {
        self.script.lock().pauses += 1;
    }

    fn end_of_stream(&mut self) -> Result<()> {
        let mut script = self.script.lock();
        script.end_of_streams += 1;
        if script.auto_end {
            if let Some(events) = &script.events {
                events.emit(SinkEvent::Ended);
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        let mut script = self.script.lock();
        script.releases += 1;
        script.events = None;
    }
}

impl SinkControl {
    /// Acknowledge every append immediately.
    pub fn auto_ack(&self, on: bool) -> &Self {
        self.script.lock().auto_ack = on;
        self
    }

    /// Report `Started` as soon as playback is requested.
    pub fn auto_start(&self, on: bool) -> &Self {
        self.script.lock().auto_start = on;
        self
    }

    /// Report `Ended` as soon as the stream is closed.
    pub fn auto_end(&self, on: bool) -> &Self {
        self.script.lock().auto_end = on;
        self
    }

    pub fn fail_next_open(&self, message: &str) {
        self.script.lock().fail_open = Some(message.to_string());
    }

    pub fn fail_next_append(&self, message: &str) {
        self.script.lock().fail_append = Some(message.to_string());
    }

    /// Event handle of the currently attached session, if any.
    pub fn session_events(&self) -> Option<SinkEvents> {
        self.script.lock().events.clone()
    }

    /// Emit an event for the currently attached session.
    ///
    /// # Panics
    /// Panics if no session is attached.
    pub fn emit(&self, event: SinkEvent) {
        self.session_events()
            .expect("no sink session attached")
            .emit(event);
    }

    pub fn appended(&self) -> Vec<u8> {
        self.script.lock().appended.clone()
    }

    pub fn chunk_count(&self) -> usize {
        self.script.lock().chunks
    }

    pub fn opened(&self) -> Vec<SinkSource> {
        self.script.lock().opened.clone()
    }

    pub fn play_calls(&self) -> usize {
        self.script.lock().play_calls
    }

    pub fn pauses(&self) -> usize {
        self.script.lock().pauses
    }

    pub fn end_of_streams(&self) -> usize {
        self.script.lock().end_of_streams
    }

    pub fn releases(&self) -> usize {
        self.script.lock().releases
    }
}

struct InputScript {
    fail_start: Option<String>,
    fragments: Option<Sender<Bytes>>,
    format: CaptureFormat,
    starts: usize,
    stops: usize,
}

/// Input device that delivers whatever fragments the test pushes.
pub struct ScriptedInput {
    script: Arc<Mutex<InputScript>>,
}

/// Test-side handle to a [`ScriptedInput`].
#[derive(Clone)]
pub struct InputControl {
    script: Arc<Mutex<InputScript>>,
}

impl ScriptedInput {
    pub fn new() -> (Self, InputControl) {
        let script = Arc::new(Mutex::new(InputScript {
            fail_start: None,
            fragments: None,
            format: CaptureFormat::Encoded {
                mime_type: "audio/webm".to_string(),
            },
            starts: 0,
            stops: 0,
        }));
        (
            Self {
                script: script.clone(),
            },
            InputControl { script },
        )
    }
}

impl InputDevice for ScriptedInput {
    fn start(&mut self, fragments: Sender<Bytes>) -> Result<()> {
        let mut script = self.script.lock();
        if let Some(message) = script.fail_start.take() {
            return Err(Error::DeviceUnavailable(message));
        }
        script.starts += 1;
        script.fragments = Some(fragments);
        Ok(())
    }

    fn stop(&mut self) -> Result<CaptureFormat> {
        let mut script = self.script.lock();
        script.stops += 1;
        script.fragments = None;
        Ok(script.format.clone())
    }
}

impl InputControl {
    /// Deliver a fragment as if the device had captured it.
    ///
    /// # Panics
    /// Panics if the device is not recording.
    pub fn push(&self, fragment: &'static [u8]) {
        self.script
            .lock()
            .fragments
            .as_ref()
            .expect("input device not recording")
            .send(Bytes::from_static(fragment))
            .expect("capture session gone");
    }

    pub fn fail_next_start(&self, message: &str) {
        self.script.lock().fail_start = Some(message.to_string());
    }

    pub fn set_format(&self, format: CaptureFormat) {
        self.script.lock().format = format;
    }

    pub fn starts(&self) -> usize {
        self.script.lock().starts
    }

    pub fn stops(&self) -> usize {
        self.script.lock().stops
    }
}
