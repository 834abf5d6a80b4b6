//! Session coordinator: serializes playback and capture over one audio device.
//!
//! All session state lives on a dedicated worker thread. Callers talk to it
//! through [`SessionCoordinator`], which turns each request into a command and
//! hands back a [`Pending`] outcome. Sink backends report progress on a
//! second channel; events stamped with an older session generation are
//! dropped, so a completion from a stopped session can never end a newer one.

use std::collections::VecDeque;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, never, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use voxgate_core::{
    AudioChunk, CaptureMetadata, CaptureState, CapturedAudio, Config, Error, LockHolder,
    MediaSinkState, PlaybackOutcome, PlaybackRequest, Result, SessionKind, SessionLock,
    StopOutcome,
};

use crate::capture::{CaptureSession, CpalInput, InputDevice};
use crate::chunk_buffer::ChunkBuffer;
use crate::event::CoordinatorEvent;
use crate::pending::{Pending, Reply};
use crate::sink::{CpalSink, MediaSink, SinkBackend, SinkEnvelope, SinkEvents, SinkSource};

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    pub sink_state: MediaSinkState,
    pub capture_state: CaptureState,
    pub lock: LockHolder,
    /// Generation of the most recent playback session.
    pub generation: u64,
    /// Chunks of the active stream not yet handed to the sink.
    pub queued_chunks: usize,
    /// Bytes held by those chunks.
    pub queued_bytes: usize,
    /// Playback requests waiting for the active session to end.
    pub pending_playbacks: usize,
}

enum Command {
    Playback(PlaybackRequest, Reply<PlaybackOutcome>),
    StartCapture(CaptureMetadata, Reply<()>),
    StopCapture(Reply<Option<CapturedAudio>>),
    StopPlayback(Reply<StopOutcome>),
    Snapshot(Reply<CoordinatorSnapshot>),
    Shutdown,
}

/// Handle to the coordinator thread.
///
/// Dropping the handle shuts the coordinator down.
pub struct SessionCoordinator {
    command_tx: Sender<Command>,
    event_rx: Receiver<CoordinatorEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCoordinator {
    /// Start a coordinator on the default audio devices.
    pub fn with_devices(config: Config) -> Result<Self> {
        Self::spawn(
            config,
            |config| Ok(CpalSink::new(config.playback.clone())),
            |_| Ok(CpalInput::new()),
        )
    }

    /// Start a coordinator with custom backends.
    ///
    /// The factories run on the coordinator thread, so backends need not be `Send`.
    pub fn spawn<B, D, FB, FD>(config: Config, make_sink: FB, make_input: FD) -> Result<Self>
    where
        B: SinkBackend + 'static,
        D: InputDevice + 'static,
        FB: FnOnce(&Config) -> Result<B> + Send + 'static,
        FD: FnOnce(&Config) -> Result<D> + Send + 'static,
    {
        config.validate()?;

        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);

        let worker = std::thread::Builder::new()
            .name("session-coordinator".to_string())
            .spawn(move || {
                let backends =
                    make_sink(&config).and_then(|sink| Ok((sink, make_input(&config)?)));
                match backends {
                    Ok((sink, input)) => {
                        let _ = ready_tx.send(Ok(()));
                        CoordinatorWorker::new(config, sink, input, event_tx).run(&command_rx);
                    }
                    Err(e) => {
                        error!("Failed to initialize audio backends: {e}");
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| {
                Error::DeviceUnavailable(format!("Failed to spawn coordinator thread: {e}"))
            })?;

        ready_rx.recv().map_err(|_| Error::Shutdown)??;

        Ok(Self {
            command_tx,
            event_rx,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Pending<T> {
        let (reply, pending) = Pending::channel();
        if self.command_tx.send(command(reply)).is_err() {
            // The reply sender was dropped with the command, so `pending` reports Shutdown.
            warn!("Request sent after coordinator shutdown");
        }
        pending
    }

    /// Play a URL or deliver one chunk of a streamed payload.
    pub fn request_playback(&self, request: PlaybackRequest) -> Pending<PlaybackOutcome> {
        self.request(|reply| Command::Playback(request, reply))
    }

    pub fn request_capture_start(&self, metadata: CaptureMetadata) -> Pending<()> {
        self.request(|reply| Command::StartCapture(metadata, reply))
    }

    /// Stop recording. Resolves to `None` when nothing was being recorded.
    pub fn request_capture_stop(&self) -> Pending<Option<CapturedAudio>> {
        self.request(Command::StopCapture)
    }

    /// Stop the active playback and cancel queued ones.
    pub fn request_stop_playback(&self) -> Pending<StopOutcome> {
        self.request(Command::StopPlayback)
    }

    pub fn snapshot(&self) -> Pending<CoordinatorSnapshot> {
        self.request(Command::Snapshot)
    }

    /// Get a receiver for coordinator events.
    pub fn events(&self) -> Receiver<CoordinatorEvent> {
        self.event_rx.clone()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv_event(&self) -> Option<CoordinatorEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receive an event (blocking). Returns `None` once the coordinator is gone.
    pub fn recv_event(&self) -> Option<CoordinatorEvent> {
        self.event_rx.recv().ok()
    }

    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<CoordinatorEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Reset every session, release the devices and stop the worker thread.
    ///
    /// Outstanding requests resolve to [`Error::Shutdown`].
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("Coordinator thread panicked");
            }
        }
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A playback request, active or waiting its turn.
struct PlaybackSession {
    source: SinkSource,
    buffer: ChunkBuffer,
    final_received: bool,
    /// Receives the terminal outcome. A stream gets one with its final chunk.
    waiter: Option<Reply<PlaybackOutcome>>,
}

impl PlaybackSession {
    fn url(locator: String, reply: Reply<PlaybackOutcome>) -> Self {
        Self {
            source: SinkSource::Url(locator),
            buffer: ChunkBuffer::new(),
            final_received: true,
            waiter: Some(reply),
        }
    }

    fn stream() -> Self {
        Self {
            source: SinkSource::Stream,
            buffer: ChunkBuffer::new(),
            final_received: false,
            waiter: None,
        }
    }

    const fn is_url(&self) -> bool {
        matches!(self.source, SinkSource::Url(_))
    }

    /// A stream that still accepts chunks.
    const fn is_open_stream(&self) -> bool {
        !self.is_url() && !self.final_received
    }

    fn accept(&mut self, chunk: AudioChunk, is_final: bool, reply: Reply<PlaybackOutcome>) {
        if !chunk.is_empty() {
            self.buffer.enqueue(chunk);
        }
        if is_final {
            self.final_received = true;
            self.waiter = Some(reply);
        } else {
            let _ = reply.send(Ok(PlaybackOutcome::ChunkQueued));
        }
    }

    /// Deliver the terminal outcome.
    ///
    /// A stream still waiting for its final chunk has nobody to tell, so a
    /// failure is handed back to be reported when that chunk arrives.
    fn resolve(self, result: Result<PlaybackOutcome>) -> Option<Error> {
        match self.waiter {
            Some(waiter) => {
                let _ = waiter.send(result);
                None
            }
            None => result.err(),
        }
    }
}

struct ActivePlayback {
    generation: u64,
    session: PlaybackSession,
    /// `mark_final` has been applied to the sink.
    final_marked: bool,
    eos_sent: bool,
}

/// State owned by the coordinator thread.
struct CoordinatorWorker<B, D> {
    config: Config,
    lock: SessionLock,
    sink: MediaSink<B>,
    capture: CaptureSession<D>,
    generation: u64,
    playback: Option<ActivePlayback>,
    pending: VecDeque<PlaybackSession>,
    /// Failure of a stream whose final chunk has not arrived yet.
    failed_stream: Option<Error>,
    capture_deadline: Option<Instant>,
    sink_tx: Sender<SinkEnvelope>,
    sink_rx: Receiver<SinkEnvelope>,
    event_tx: Sender<CoordinatorEvent>,
}

impl<B: SinkBackend, D: InputDevice> CoordinatorWorker<B, D> {
    fn new(config: Config, sink: B, input: D, event_tx: Sender<CoordinatorEvent>) -> Self {
        let (sink_tx, sink_rx) = unbounded();
        let capture = CaptureSession::new(input, config.capture.mime_type.clone(), event_tx.clone());
        Self {
            sink: MediaSink::new(sink, event_tx.clone()),
            capture,
            config,
            lock: SessionLock::new(),
            generation: 0,
            playback: None,
            pending: VecDeque::new(),
            failed_stream: None,
            capture_deadline: None,
            sink_tx,
            sink_rx,
            event_tx,
        }
    }

    fn run(mut self, command_rx: &Receiver<Command>) {
        info!("Session coordinator started");
        let sink_rx = self.sink_rx.clone();

        loop {
            let deadline = self.capture_deadline.map_or_else(never, |at| {
                after(at.saturating_duration_since(Instant::now()))
            });

            select! {
                recv(command_rx) -> command => {
                    let Ok(command) = command else {
                        debug!("All coordinator handles dropped");
                        break;
                    };
                    // Apply what the sink reported before acting on the caller.
                    self.drain_sink_events();
                    if !self.handle_command(command) {
                        break;
                    }
                }
                recv(sink_rx) -> envelope => {
                    if let Ok(envelope) = envelope {
                        self.handle_sink_event(envelope);
                    }
                }
                recv(deadline) -> _ => {
                    self.on_capture_deadline();
                }
            }
        }

        self.teardown();
    }

    fn drain_sink_events(&mut self) {
        while let Ok(envelope) = self.sink_rx.try_recv() {
            self.handle_sink_event(envelope);
        }
    }

    /// Returns `false` once the coordinator should stop.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Playback(request, reply) => self.handle_playback(request, reply),
            Command::StartCapture(metadata, reply) => {
                let _ = reply.send(self.start_capture(metadata));
            }
            Command::StopCapture(reply) => {
                let _ = reply.send(self.stop_capture());
            }
            Command::StopPlayback(reply) => {
                let _ = reply.send(Ok(self.stop_playback()));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn handle_playback(&mut self, request: PlaybackRequest, reply: Reply<PlaybackOutcome>) {
        if self.lock.holder() == LockHolder::Capture {
            warn!("Rejecting {} request: capture in progress", request.label());
            let _ = reply.send(Err(Error::SessionBusy {
                holder: LockHolder::Capture,
            }));
            return;
        }

        match request {
            PlaybackRequest::UrlPlayback { resource_locator } => {
                self.submit(PlaybackSession::url(resource_locator, reply));
            }
            PlaybackRequest::StreamChunk { chunk, is_final } => {
                if let Some(session) = self.open_stream_mut() {
                    session.accept(chunk, is_final, reply);
                    self.pump();
                } else if let Some(failure) = self.failed_stream.take() {
                    self.reject_after_failure(&chunk, is_final, failure, reply);
                } else {
                    let mut session = PlaybackSession::stream();
                    session.accept(chunk, is_final, reply);
                    self.submit(session);
                }
            }
        }
    }

    /// Refuse a chunk of a stream that already failed. Its final chunk carries the failure.
    fn reject_after_failure(
        &mut self,
        chunk: &AudioChunk,
        is_final: bool,
        failure: Error,
        reply: Reply<PlaybackOutcome>,
    ) {
        debug!("Dropping {} bytes of a failed stream", chunk.len());
        if is_final {
            let _ = reply.send(Err(failure));
            return;
        }
        let message = match &failure {
            Error::SinkFailure(message) => message.clone(),
            other => other.to_string(),
        };
        let _ = reply.send(Err(Error::SinkFailure(message)));
        self.failed_stream = Some(failure);
    }

    /// The stream currently accepting chunks, whether playing or queued.
    fn open_stream_mut(&mut self) -> Option<&mut PlaybackSession> {
        let active = self.playback.as_mut().map(|active| &mut active.session);
        active
            .into_iter()
            .chain(self.pending.iter_mut())
            .find(|session| session.is_open_stream())
    }

    fn submit(&mut self, session: PlaybackSession) {
        if self.playback.is_some() {
            debug!("Playback busy, queueing request ({} waiting)", self.pending.len() + 1);
            self.pending.push_back(session);
        } else {
            self.start(session);
        }
    }

    fn start_next(&mut self) {
        while self.playback.is_none() {
            let Some(session) = self.pending.pop_front() else {
                return;
            };
            self.start(session);
        }
    }

    fn start(&mut self, session: PlaybackSession) {
        if !session.is_url() && session.final_received && session.buffer.is_empty() {
            info!("Stream closed without audio");
            self.resolve(session, Ok(PlaybackOutcome::Empty));
            return;
        }

        let before = self.lock.holder();
        if let Err(e) = self.lock.acquire(SessionKind::Playback) {
            warn!("Cannot start playback: {e}");
            self.resolve(session, Err(e));
            return;
        }
        self.note_lock(before);

        self.generation += 1;
        let generation = self.generation;
        let events = SinkEvents::new(generation, self.sink_tx.clone());
        match &session.source {
            SinkSource::Url(locator) => info!("Playing {locator} (generation {generation})"),
            SinkSource::Stream => info!("Playing stream (generation {generation})"),
        }

        if let Err(e) = self.sink.open(session.source.clone(), events) {
            self.sink.reset();
            self.release_playback_lock();
            self.resolve(session, Err(e));
            return;
        }

        let settled = session.is_url();
        self.playback = Some(ActivePlayback {
            generation,
            session,
            final_marked: settled,
            eos_sent: settled,
        });
        self.pump();
    }

    /// Move the active stream forward as far as the sink allows.
    fn pump(&mut self) {
        let Some(active) = self.playback.as_mut() else {
            return;
        };

        if let Some(chunk) = active.session.buffer.drain_if_ready(self.sink.is_busy()) {
            if let Err(e) = self.sink.append(chunk) {
                self.finish_playback(Err(e));
                return;
            }
        }

        if !active.session.final_received {
            return;
        }
        if !active.final_marked {
            active.final_marked = true;
            self.sink.mark_final();
        }
        if active.eos_sent || self.sink.is_busy() || !active.session.buffer.is_empty() {
            return;
        }
        if self.sink.appended_bytes() == 0 {
            self.finish_playback(Ok(PlaybackOutcome::Empty));
            return;
        }

        active.eos_sent = true;
        if let Err(e) = self.sink.end_of_stream() {
            self.finish_playback(Err(e));
        }
    }

    /// Fails with [`Error::StaleCompletion`] unless `generation` is the active session.
    fn check_generation(&self, generation: u64) -> Result<()> {
        match &self.playback {
            Some(active) if active.generation == generation => Ok(()),
            _ => Err(Error::StaleCompletion { generation }),
        }
    }

    fn handle_sink_event(&mut self, envelope: SinkEnvelope) {
        if let Err(e) = self.check_generation(envelope.generation) {
            warn!("Discarding {:?}: {e}", envelope.event);
            let _ = self.event_tx.send(CoordinatorEvent::StaleEventDiscarded {
                generation: envelope.generation,
            });
            return;
        }

        match self.sink.on_event(envelope.event) {
            Ok(Some(terminal)) => self.finish_playback(terminal.into_outcome()),
            Ok(None) => self.pump(),
            Err(e) => self.finish_playback(Err(e)),
        }
    }

    fn finish_playback(&mut self, result: Result<PlaybackOutcome>) {
        let Some(active) = self.playback.take() else {
            return;
        };
        match &result {
            Ok(outcome) => info!(
                "Playback finished (generation {}): {}",
                active.generation,
                outcome.message()
            ),
            Err(e) if e.is_device_failure() => {
                error!("Playback failed (generation {}): {e}", active.generation);
            }
            Err(e) => warn!("Playback aborted (generation {}): {e}", active.generation),
        }

        self.sink.reset();
        self.release_playback_lock();
        self.resolve(active.session, result);
        self.start_next();
    }

    fn resolve(&mut self, session: PlaybackSession, result: Result<PlaybackOutcome>) {
        if let Some(e) = session.resolve(result) {
            warn!("Stream failed before its final chunk: {e}");
            self.failed_stream = Some(e);
        }
    }

    fn stop_playback(&mut self) -> StopOutcome {
        // Anything the old session still reports is now stale.
        self.generation += 1;
        let active = self.playback.take();
        self.sink.reset();
        self.release_playback_lock();
        self.failed_stream = None;

        let was_playing = active.is_some() || !self.pending.is_empty();
        if let Some(active) = active {
            let _ = active.session.resolve(Ok(PlaybackOutcome::Stopped));
        }
        for session in self.pending.drain(..) {
            let _ = session.resolve(Ok(PlaybackOutcome::Cancelled));
        }

        if was_playing {
            info!("Playback stopped");
        } else {
            debug!("Stop requested with nothing playing");
        }
        StopOutcome { was_playing }
    }

    fn start_capture(&mut self, metadata: CaptureMetadata) -> Result<()> {
        let before = self.lock.holder();
        let result = self.capture.start(&mut self.lock, metadata);
        self.note_lock(before);
        if let Err(e) = &result {
            warn!("Capture not started: {e}");
        }
        result?;

        // A half-sent stream does not survive a recording.
        self.failed_stream = None;
        self.capture_deadline = self
            .config
            .capture
            .max_duration()
            .map(|cap| Instant::now() + cap);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<Option<CapturedAudio>> {
        self.capture_deadline = None;
        let before = self.lock.holder();
        let result = self.capture.stop(&mut self.lock);
        self.note_lock(before);
        result
    }

    fn on_capture_deadline(&mut self) {
        info!("Recording reached its duration cap");
        match self.stop_capture() {
            Ok(Some(captured)) => {
                let _ = self
                    .event_tx
                    .send(CoordinatorEvent::RecordingComplete(captured));
            }
            Ok(None) => {}
            Err(e) => error!("Failed to finish capped recording: {e}"),
        }
    }

    fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            sink_state: self.sink.state(),
            capture_state: self.capture.state(),
            lock: self.lock.holder(),
            generation: self.generation,
            queued_chunks: self
                .playback
                .as_ref()
                .map_or(0, |active| active.session.buffer.len()),
            queued_bytes: self
                .playback
                .as_ref()
                .map_or(0, |active| active.session.buffer.queued_bytes()),
            pending_playbacks: self.pending.len(),
        }
    }

    fn release_playback_lock(&mut self) {
        let before = self.lock.holder();
        self.lock.release(SessionKind::Playback);
        self.note_lock(before);
    }

    fn note_lock(&self, before: LockHolder) {
        let holder = self.lock.holder();
        if holder != before {
            debug!("Lock changed: {before} -> {holder}");
            let _ = self.event_tx.send(CoordinatorEvent::LockChanged(holder));
        }
    }

    fn teardown(&mut self) {
        self.generation += 1;
        if let Some(active) = self.playback.take() {
            let _ = active.session.resolve(Err(Error::Shutdown));
        }
        for session in self.pending.drain(..) {
            let _ = session.resolve(Err(Error::Shutdown));
        }
        self.failed_stream = None;
        self.sink.reset();
        self.release_playback_lock();

        let before = self.lock.holder();
        self.capture.abort(&mut self.lock);
        self.note_lock(before);
        self.capture_deadline = None;

        info!("Session coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)] // Tests use unwrap for brevity

    use super::*;
    use crate::sink::SinkEvent;
    use crate::testing::{InputControl, ScriptedInput, ScriptedSink, SinkControl};
    use proptest::prelude::*;
    use serde_json::json;

    const SETTLE: Duration = Duration::from_secs(2);

    struct Harness {
        coordinator: SessionCoordinator,
        sink: SinkControl,
        input: InputControl,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            let (sink, sink_control) = ScriptedSink::new();
            let (input, input_control) = ScriptedInput::new();
            let coordinator =
                SessionCoordinator::spawn(config, move |_| Ok(sink), move |_| Ok(input)).unwrap();
            Self {
                coordinator,
                sink: sink_control,
                input: input_control,
            }
        }

        /// Round-trip through the worker so every earlier command and sink event is applied.
        fn snapshot(&self) -> CoordinatorSnapshot {
            self.coordinator.snapshot().wait().unwrap()
        }

        fn play(&self, request: PlaybackRequest) -> Pending<PlaybackOutcome> {
            self.coordinator.request_playback(request)
        }

        fn events(&self) -> Vec<CoordinatorEvent> {
            std::iter::from_fn(|| self.coordinator.try_recv_event()).collect()
        }

        fn sink_states(&self) -> Vec<MediaSinkState> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    CoordinatorEvent::SinkStateChanged(s) => Some(s),
                    _ => None,
                })
                .collect()
        }
    }

    fn settle<T>(pending: &mut Pending<T>) -> Result<T> {
        pending
            .wait_timeout(SETTLE)
            .expect("request was never resolved")
    }

    #[test]
    fn test_url_playback_lifecycle() {
        let h = Harness::new(Config::default());
        let mut outcome = h.play(PlaybackRequest::url("a.mp3"));
        let snapshot = h.snapshot();
        assert_eq!(snapshot.lock, LockHolder::Playback);
        assert_eq!(h.sink.opened(), vec![SinkSource::Url("a.mp3".into())]);
        assert_eq!(h.sink.play_calls(), 1);

        h.sink.emit(SinkEvent::Started);
        h.sink.emit(SinkEvent::Ended);
        assert_eq!(settle(&mut outcome).unwrap(), PlaybackOutcome::Ended);

        assert_eq!(
            h.sink_states(),
            vec![
                MediaSinkState::Initializing,
                MediaSinkState::Playing,
                MediaSinkState::Ended,
                MediaSinkState::Idle
            ]
        );
        assert_eq!(h.snapshot().lock, LockHolder::None);
        assert_eq!(h.sink.releases(), 1);
    }

    #[test]
    fn test_streamed_chunks_wait_for_busy_sink() {
        let h = Harness::new(Config::default());

        let mut first = h.play(PlaybackRequest::chunk(b"bytes1".to_vec(), false));
        assert_eq!(settle(&mut first).unwrap(), PlaybackOutcome::ChunkQueued);
        let mut last = h.play(PlaybackRequest::chunk(b"bytes2".to_vec(), true));

        // The first append has not completed, so the second chunk waits.
        let snapshot = h.snapshot();
        assert_eq!(snapshot.queued_chunks, 1);
        assert_eq!(snapshot.queued_bytes, 6);
        assert_eq!(h.sink.appended(), b"bytes1");
        assert!(last.try_take().is_none());

        h.sink.emit(SinkEvent::AppendComplete);
        assert_eq!(h.snapshot().queued_chunks, 0);
        assert_eq!(h.sink.appended(), b"bytes1bytes2");
        assert_eq!(h.sink.play_calls(), 1);
        assert_eq!(h.sink.end_of_streams(), 0);

        h.sink.emit(SinkEvent::Started);
        h.sink.emit(SinkEvent::AppendComplete);
        assert_eq!(h.snapshot().sink_state, MediaSinkState::Draining);
        assert_eq!(h.sink.end_of_streams(), 1);

        h.sink.emit(SinkEvent::Ended);
        assert_eq!(settle(&mut last).unwrap(), PlaybackOutcome::Ended);
        assert_eq!(
            h.sink_states(),
            vec![
                MediaSinkState::Initializing,
                MediaSinkState::Playing,
                MediaSinkState::Draining,
                MediaSinkState::Ended,
                MediaSinkState::Idle
            ]
        );
    }

    #[test]
    fn test_capture_blocks_playback() {
        let h = Harness::new(Config::default());
        let metadata = CaptureMetadata::new(json!({"button_id": "mic"}));
        h.coordinator
            .request_capture_start(metadata.clone())
            .wait()
            .unwrap();

        let err = h
            .play(PlaybackRequest::url("https://cdn.example/reply.mp3"))
            .wait()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::SessionBusy {
                holder: LockHolder::Capture
            }
        ));
        let err = h
            .play(PlaybackRequest::chunk(b"x".to_vec(), false))
            .wait()
            .unwrap_err();
        assert!(err.is_busy());

        assert_eq!(h.snapshot().capture_state, CaptureState::Recording);
        assert!(h.sink.opened().is_empty());

        h.input.push(b"voice");
        let captured = h
            .coordinator
            .request_capture_stop()
            .wait()
            .unwrap()
            .unwrap();
        assert_eq!(captured.audio.as_ref(), b"voice");
        assert_eq!(captured.metadata, metadata);
        assert_eq!(h.snapshot().lock, LockHolder::None);
    }

    #[test]
    fn test_playback_blocks_capture() {
        let h = Harness::new(Config::default());
        let _outcome = h.play(PlaybackRequest::url("a.mp3"));

        let err = h
            .coordinator
            .request_capture_start(CaptureMetadata::default())
            .wait()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::SessionBusy {
                holder: LockHolder::Playback
            }
        ));
        assert_eq!(h.input.starts(), 0);
    }

    #[test]
    fn test_stop_capture_while_idle() {
        let h = Harness::new(Config::default());
        let result = h.coordinator.request_capture_stop().wait().unwrap();
        assert!(result.is_none());
        assert_eq!(h.input.stops(), 0);
    }

    #[test]
    fn test_stop_playback_resolves_session() {
        let h = Harness::new(Config::default());
        let mut outcome = h.play(PlaybackRequest::url("a.mp3"));
        h.snapshot();
        h.sink.emit(SinkEvent::Started);

        let stop = h.coordinator.request_stop_playback().wait().unwrap();
        assert!(stop.was_playing);
        assert_eq!(settle(&mut outcome).unwrap(), PlaybackOutcome::Stopped);
        assert_eq!(h.sink.pauses(), 1);
        assert_eq!(h.sink.releases(), 1);

        let snapshot = h.snapshot();
        assert_eq!(snapshot.sink_state, MediaSinkState::Idle);
        assert_eq!(snapshot.lock, LockHolder::None);

        let again = h.coordinator.request_stop_playback().wait().unwrap();
        assert!(!again.was_playing);
    }

    #[test]
    fn test_stop_during_initializing_stream() {
        let h = Harness::new(Config::default());
        let _ack = h.play(PlaybackRequest::chunk(b"abc".to_vec(), false));
        let mut last = h.play(PlaybackRequest::chunk(b"def".to_vec(), true));
        assert_eq!(h.snapshot().sink_state, MediaSinkState::Initializing);

        assert!(h.coordinator.request_stop_playback().wait().unwrap().was_playing);
        assert_eq!(settle(&mut last).unwrap(), PlaybackOutcome::Stopped);
        let snapshot = h.snapshot();
        assert_eq!(snapshot.sink_state, MediaSinkState::Idle);
        assert_eq!(snapshot.queued_chunks, 0);
    }

    #[test]
    fn test_sink_failure_releases_everything() {
        let h = Harness::new(Config::default());
        let mut outcome = h.play(PlaybackRequest::url("a.mp3"));
        h.snapshot();
        h.sink.emit(SinkEvent::Failed("decoder died".into()));

        assert!(matches!(settle(&mut outcome), Err(Error::SinkFailure(_))));
        let states = h.sink_states();
        assert_eq!(
            &states[states.len() - 2..],
            &[MediaSinkState::Errored, MediaSinkState::Idle]
        );

        // Stop is always accepted, even right after a failure.
        assert!(!h.coordinator.request_stop_playback().wait().unwrap().was_playing);
        assert_eq!(h.snapshot().lock, LockHolder::None);
    }

    #[test]
    fn test_stale_completion_ignored() {
        let h = Harness::new(Config::default());
        let mut first = h.play(PlaybackRequest::url("first.mp3"));
        h.snapshot();
        let old_events = h.sink.session_events().unwrap();

        h.coordinator.request_stop_playback().wait().unwrap();
        assert_eq!(settle(&mut first).unwrap(), PlaybackOutcome::Stopped);

        let mut second = h.play(PlaybackRequest::url("second.mp3"));
        h.snapshot();
        h.events();

        old_events.emit(SinkEvent::Ended);
        let snapshot = h.snapshot();
        assert_eq!(snapshot.sink_state, MediaSinkState::Initializing);
        assert_eq!(snapshot.lock, LockHolder::Playback);
        assert!(second.try_take().is_none());
        assert!(h.events().contains(&CoordinatorEvent::StaleEventDiscarded {
            generation: old_events.generation()
        }));

        h.sink.emit(SinkEvent::Ended);
        assert_eq!(settle(&mut second).unwrap(), PlaybackOutcome::Ended);
    }

    #[test]
    fn test_queued_url_starts_after_active_ends() {
        let h = Harness::new(Config::default());
        let mut first = h.play(PlaybackRequest::url("one.mp3"));
        let mut second = h.play(PlaybackRequest::url("two.mp3"));
        assert_eq!(h.snapshot().pending_playbacks, 1);
        assert_eq!(h.sink.opened().len(), 1);

        h.sink.emit(SinkEvent::Ended);
        assert_eq!(settle(&mut first).unwrap(), PlaybackOutcome::Ended);

        let snapshot = h.snapshot();
        assert_eq!(snapshot.pending_playbacks, 0);
        assert_eq!(snapshot.lock, LockHolder::Playback);
        assert_eq!(
            h.sink.opened(),
            vec![
                SinkSource::Url("one.mp3".into()),
                SinkSource::Url("two.mp3".into())
            ]
        );

        h.sink.emit(SinkEvent::Paused);
        assert_eq!(settle(&mut second).unwrap(), PlaybackOutcome::Paused);
    }

    #[test]
    fn test_stop_cancels_queued_requests() {
        let h = Harness::new(Config::default());
        let mut first = h.play(PlaybackRequest::url("one.mp3"));
        let mut second = h.play(PlaybackRequest::url("two.mp3"));
        let _ack = h.play(PlaybackRequest::chunk(b"tail".to_vec(), false));
        assert_eq!(h.snapshot().pending_playbacks, 2);

        assert!(h.coordinator.request_stop_playback().wait().unwrap().was_playing);
        assert_eq!(settle(&mut first).unwrap(), PlaybackOutcome::Stopped);
        assert_eq!(settle(&mut second).unwrap(), PlaybackOutcome::Cancelled);
        assert_eq!(h.snapshot().pending_playbacks, 0);
        assert_eq!(h.sink.opened().len(), 1);
    }

    #[test]
    fn test_empty_stream_never_opens_sink() {
        let h = Harness::new(Config::default());
        let mut outcome = h.play(PlaybackRequest::chunk(Vec::new(), true));
        assert_eq!(settle(&mut outcome).unwrap(), PlaybackOutcome::Empty);
        assert!(h.sink.opened().is_empty());
        assert_eq!(h.snapshot().lock, LockHolder::None);
    }

    #[test]
    fn test_open_failure_releases_lock() {
        let h = Harness::new(Config::default());
        h.sink.fail_next_open("no output device");
        let mut outcome = h.play(PlaybackRequest::url("a.mp3"));
        assert!(matches!(
            settle(&mut outcome),
            Err(Error::DeviceUnavailable(_))
        ));

        let snapshot = h.snapshot();
        assert_eq!(snapshot.lock, LockHolder::None);
        assert_eq!(snapshot.sink_state, MediaSinkState::Idle);
    }

    #[test]
    fn test_append_failure_fails_stream() {
        let h = Harness::new(Config::default());
        h.sink.fail_next_append("device unplugged");
        let mut outcome = h.play(PlaybackRequest::chunk(b"abc".to_vec(), true));
        assert!(matches!(settle(&mut outcome), Err(Error::SinkFailure(_))));
        assert_eq!(h.snapshot().lock, LockHolder::None);
    }

    #[test]
    fn test_append_failure_before_final_chunk() {
        let h = Harness::new(Config::default());
        h.sink.fail_next_append("device unplugged");
        let mut head = h.play(PlaybackRequest::chunk(b"HEAD".to_vec(), false));
        assert_eq!(settle(&mut head).unwrap(), PlaybackOutcome::ChunkQueued);

        let mut tail = h.play(PlaybackRequest::chunk(b"TAIL".to_vec(), true));
        match settle(&mut tail) {
            Err(Error::SinkFailure(message)) => assert_eq!(message, "device unplugged"),
            other => panic!("expected the stream's failure, got {other:?}"),
        }
        assert_eq!(h.sink.opened(), vec![SinkSource::Stream]);
        assert!(h.sink.appended().is_empty());
        assert_eq!(h.snapshot().lock, LockHolder::None);

        // The failure was reported, so the next chunk starts a fresh stream.
        let _next = h.play(PlaybackRequest::chunk(b"NEXT".to_vec(), false));
        assert_eq!(h.snapshot().lock, LockHolder::Playback);
        assert_eq!(h.sink.opened().len(), 2);
        assert_eq!(h.sink.appended(), b"NEXT");
    }

    #[test]
    fn test_sink_failure_mid_stream_reaches_final_chunk() {
        let h = Harness::new(Config::default());
        let mut head = h.play(PlaybackRequest::chunk(b"HEAD".to_vec(), false));
        assert_eq!(settle(&mut head).unwrap(), PlaybackOutcome::ChunkQueued);
        h.snapshot();
        h.sink.emit(SinkEvent::AppendComplete);
        h.sink.emit(SinkEvent::Started);
        h.sink.emit(SinkEvent::Failed("decoder died".into()));

        let snapshot = h.snapshot();
        assert_eq!(snapshot.sink_state, MediaSinkState::Idle);
        assert_eq!(snapshot.lock, LockHolder::None);

        let mut middle = h.play(PlaybackRequest::chunk(b"MID".to_vec(), false));
        assert!(matches!(settle(&mut middle), Err(Error::SinkFailure(m)) if m == "decoder died"));
        let mut tail = h.play(PlaybackRequest::chunk(b"TAIL".to_vec(), true));
        assert!(matches!(settle(&mut tail), Err(Error::SinkFailure(m)) if m == "decoder died"));

        assert_eq!(h.sink.opened(), vec![SinkSource::Stream]);
        assert_eq!(h.sink.appended(), b"HEAD");
    }

    #[test]
    fn test_stop_forgets_failed_stream() {
        let h = Harness::new(Config::default());
        h.sink.fail_next_append("device unplugged");
        let _head = h.play(PlaybackRequest::chunk(b"HEAD".to_vec(), false));
        h.snapshot();

        assert!(!h.coordinator.request_stop_playback().wait().unwrap().was_playing);
        let _fresh = h.play(PlaybackRequest::chunk(b"FRESH".to_vec(), false));
        assert_eq!(h.snapshot().lock, LockHolder::Playback);
        assert_eq!(h.sink.appended(), b"FRESH");
    }

    #[test]
    fn test_stream_queues_behind_url() {
        let h = Harness::new(Config::default());
        let mut url = h.play(PlaybackRequest::url("a.mp3"));
        let mut ack = h.play(PlaybackRequest::chunk(b"abc".to_vec(), false));
        assert_eq!(settle(&mut ack).unwrap(), PlaybackOutcome::ChunkQueued);
        let mut last = h.play(PlaybackRequest::chunk(b"def".to_vec(), true));

        let snapshot = h.snapshot();
        assert_eq!(snapshot.pending_playbacks, 1);
        assert_eq!(h.sink.opened(), vec![SinkSource::Url("a.mp3".into())]);
        assert!(h.sink.appended().is_empty());

        h.sink.emit(SinkEvent::Started);
        h.sink.emit(SinkEvent::Ended);
        assert_eq!(settle(&mut url).unwrap(), PlaybackOutcome::Ended);

        let snapshot = h.snapshot();
        assert_eq!(snapshot.pending_playbacks, 0);
        assert_eq!(snapshot.lock, LockHolder::Playback);
        assert_eq!(
            h.sink.opened(),
            vec![SinkSource::Url("a.mp3".into()), SinkSource::Stream]
        );
        assert_eq!(h.sink.appended(), b"abc");

        h.sink.emit(SinkEvent::AppendComplete);
        h.sink.emit(SinkEvent::Started);
        h.sink.emit(SinkEvent::AppendComplete);
        assert_eq!(h.snapshot().sink_state, MediaSinkState::Draining);
        assert_eq!(h.sink.appended(), b"abcdef");
        assert_eq!(h.sink.end_of_streams(), 1);
        h.sink.emit(SinkEvent::Ended);
        assert_eq!(settle(&mut last).unwrap(), PlaybackOutcome::Ended);
    }

    #[test]
    fn test_capture_duration_cap() {
        let config = Config::from_json(r#"{"capture": {"max_duration_secs": 1}}"#).unwrap();
        let h = Harness::new(config);
        h.coordinator
            .request_capture_start(CaptureMetadata::default())
            .wait()
            .unwrap();
        h.input.push(b"hello");

        let captured = std::iter::from_fn(|| h.coordinator.recv_event_timeout(SETTLE))
            .find_map(|event| match event {
                CoordinatorEvent::RecordingComplete(captured) => Some(captured),
                _ => None,
            })
            .expect("recording was not capped");
        assert_eq!(captured.audio.as_ref(), b"hello");

        let snapshot = h.snapshot();
        assert_eq!(snapshot.capture_state, CaptureState::Idle);
        assert_eq!(snapshot.lock, LockHolder::None);
        assert!(h.coordinator.request_capture_stop().wait().unwrap().is_none());
    }

    #[test]
    fn test_shutdown_resolves_outstanding_requests() {
        let h = Harness::new(Config::default());
        let mut active = h.play(PlaybackRequest::url("one.mp3"));
        let mut queued = h.play(PlaybackRequest::url("two.mp3"));
        h.snapshot();

        h.coordinator.shutdown();
        assert!(matches!(settle(&mut active), Err(Error::Shutdown)));
        assert!(matches!(settle(&mut queued), Err(Error::Shutdown)));
        assert!(matches!(
            h.coordinator.snapshot().wait(),
            Err(Error::Shutdown)
        ));
        assert_eq!(h.sink.releases(), 1);
    }

    #[test]
    fn test_backend_init_failure() {
        let (input, _control) = ScriptedInput::new();
        let result = SessionCoordinator::spawn(
            Config::default(),
            |_| -> Result<ScriptedSink> {
                Err(Error::DeviceUnavailable("no output".into()))
            },
            move |_| Ok(input),
        );
        assert!(matches!(result, Err(Error::DeviceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_pending_resolves_as_future() {
        let h = Harness::new(Config::default());
        let outcome = h.play(PlaybackRequest::url("a.mp3"));
        h.coordinator.snapshot().await.unwrap();

        h.sink.emit(SinkEvent::Started);
        h.sink.emit(SinkEvent::Ended);
        assert_eq!(outcome.await.unwrap(), PlaybackOutcome::Ended);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_stream_reaches_sink_in_order(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 1..12)
        ) {
            let h = Harness::new(Config::default());
            h.sink.auto_ack(true).auto_start(true).auto_end(true);

            let mut outcomes: Vec<_> = chunks
                .iter()
                .enumerate()
                .map(|(i, chunk)| {
                    h.play(PlaybackRequest::chunk(chunk.clone(), i + 1 == chunks.len()))
                })
                .collect();

            let mut last = outcomes.pop().unwrap();
            prop_assert_eq!(settle(&mut last).unwrap(), PlaybackOutcome::Ended);
            for mut ack in outcomes {
                prop_assert_eq!(settle(&mut ack).unwrap(), PlaybackOutcome::ChunkQueued);
            }
            prop_assert_eq!(h.sink.appended(), chunks.concat());
            prop_assert_eq!(h.sink.chunk_count(), chunks.len());
        }
    }
}
