//! Routing between wire messages and the session coordinator.

use std::sync::Arc;

use tracing::{debug, warn};
use voxgate_audio::{CoordinatorEvent, Pending, SessionCoordinator};
use voxgate_core::message::{Envelope, Request, Response};
use voxgate_core::{CapturedAudio, PlaybackOutcome, PlaybackRequest, StopOutcome};

/// Dispatches parsed requests to the coordinator.
#[derive(Clone)]
pub struct Bridge {
    coordinator: Arc<SessionCoordinator>,
}

/// A dispatched request whose response may not be known yet.
pub struct InFlight(Outcome);

enum Outcome {
    Ready(Response),
    Playback(u64, Pending<PlaybackOutcome>),
    CaptureStart(u64, Pending<()>),
    CaptureStop(u64, Pending<Option<CapturedAudio>>),
    StopPlayback(u64, Pending<StopOutcome>),
}

impl Bridge {
    pub const fn new(coordinator: Arc<SessionCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Parse one input line and hand it to the coordinator.
    ///
    /// The request is submitted before this returns, so lines are applied in input order.
    pub fn handle_line(&self, line: &str) -> InFlight {
        match Envelope::parse(line) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) => {
                warn!("{e}");
                let id = Envelope::salvage_id(line);
                InFlight(Outcome::Ready(Response::from_error(id, &e)))
            }
        }
    }

    pub fn dispatch(&self, Envelope { id, request }: Envelope) -> InFlight {
        debug!("Request {id}: {request:?}");
        let outcome = match request {
            Request::PlayUrl { url } => Outcome::Playback(
                id,
                self.coordinator.request_playback(PlaybackRequest::url(url)),
            ),
            Request::PlayChunk { data, done } => match Request::decode_chunk(&data) {
                Ok(bytes) => Outcome::Playback(
                    id,
                    self.coordinator
                        .request_playback(PlaybackRequest::chunk(bytes, done)),
                ),
                Err(e) => {
                    warn!("Request {id}: {e}");
                    Outcome::Ready(Response::from_error(Some(id), &e))
                }
            },
            Request::StartCapture { metadata } => {
                Outcome::CaptureStart(id, self.coordinator.request_capture_start(metadata))
            }
            Request::StopCapture => {
                Outcome::CaptureStop(id, self.coordinator.request_capture_stop())
            }
            Request::StopPlayback => {
                Outcome::StopPlayback(id, self.coordinator.request_stop_playback())
            }
        };
        InFlight(outcome)
    }
}

impl InFlight {
    /// Wait for the outcome and build the response line.
    pub async fn response(self) -> Response {
        match self.0 {
            Outcome::Ready(response) => response,
            Outcome::Playback(id, pending) => Response::from_playback(id, pending.await),
            Outcome::CaptureStart(id, pending) => Response::from_capture_start(id, pending.await),
            Outcome::CaptureStop(id, pending) => Response::from_capture_stop(id, pending.await),
            Outcome::StopPlayback(id, pending) => Response::from_stop(id, pending.await),
        }
    }
}

/// Unsolicited message for a coordinator event, if it warrants one.
pub fn notification(event: CoordinatorEvent) -> Option<Response> {
    match event {
        CoordinatorEvent::RecordingComplete(captured) => {
            Some(Response::recording_complete(&captured))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;
    use serde_json::json;
    use voxgate_audio::testing::{InputControl, ScriptedInput, ScriptedSink, SinkControl};
    use voxgate_core::message::Status;
    use voxgate_core::{CaptureMetadata, Config};

    fn bridge() -> (Bridge, SinkControl, InputControl) {
        let (sink, sink_control) = ScriptedSink::new();
        let (input, input_control) = ScriptedInput::new();
        let coordinator =
            SessionCoordinator::spawn(Config::default(), move |_| Ok(sink), move |_| Ok(input))
                .unwrap();
        (Bridge::new(Arc::new(coordinator)), sink_control, input_control)
    }

    #[tokio::test]
    async fn test_malformed_line_keeps_id() {
        let (bridge, _, _) = bridge();
        let response = bridge
            .handle_line(r#"{"id": 9, "action": "rewind"}"#)
            .response()
            .await;
        assert_eq!(response.id, Some(9));
        assert_eq!(response.status, Status::Error);

        let response = bridge.handle_line("not json").response().await;
        assert_eq!(response.id, None);
        assert_eq!(response.status, Status::Error);
    }

    #[tokio::test]
    async fn test_bad_chunk_encoding() {
        let (bridge, sink, _) = bridge();
        let response = bridge
            .handle_line(r#"{"id": 1, "action": "playChunk", "data": "%%%", "done": true}"#)
            .response()
            .await;
        assert_eq!(response.status, Status::Error);
        assert!(sink.opened().is_empty());
    }

    #[tokio::test]
    async fn test_chunk_acknowledged() {
        let (bridge, sink, _) = bridge();
        let line = json!({
            "id": 2,
            "action": "playChunk",
            "data": Request::encode_chunk(b"ID3-frame"),
            "done": false,
        })
        .to_string();

        let response = bridge.handle_line(&line).response().await;
        assert_eq!(response.status, Status::Success);
        assert_eq!(response.message.as_deref(), Some("Chunk queued"));

        // The ack can arrive before the chunk reaches the sink.
        bridge.coordinator.snapshot().await.unwrap();
        assert_eq!(sink.appended(), b"ID3-frame");
    }

    #[tokio::test]
    async fn test_stop_playback_when_idle() {
        let (bridge, _, _) = bridge();
        let response = bridge
            .handle_line(r#"{"id": 3, "action": "stopPlayback"}"#)
            .response()
            .await;
        assert_eq!(response.status, Status::Success);
        assert_eq!(response.message.as_deref(), Some("No audio playing"));
    }

    #[tokio::test]
    async fn test_capture_round_trip() {
        let (bridge, _, input) = bridge();
        let start = bridge
            .handle_line(
                r#"{"id": 4, "action": "startCapture", "metadata": {"button_id": "mic", "bgptIndex": 0}}"#,
            )
            .response()
            .await;
        assert_eq!(start.message.as_deref(), Some("Recording started"));

        let busy = bridge
            .handle_line(r#"{"id": 5, "action": "playUrl", "url": "a.mp3"}"#)
            .response()
            .await;
        assert_eq!(busy.status, Status::Error);
        assert_eq!(
            busy.message.as_deref(),
            Some("Session busy: capture session in progress")
        );

        input.push(b"abc");
        let stop = bridge
            .handle_line(r#"{"id": 6, "action": "stopCapture"}"#)
            .response()
            .await;
        assert_eq!(stop.id, Some(6));
        assert_eq!(stop.audio.as_deref(), Some("data:audio/webm;base64,YWJj"));
        assert_eq!(
            stop.metadata,
            Some(CaptureMetadata::new(json!({"button_id": "mic", "bgptIndex": 0})))
        );
    }

    #[test]
    fn test_notification_only_for_recordings() {
        assert!(notification(CoordinatorEvent::StaleEventDiscarded { generation: 1 }).is_none());

        let captured = CapturedAudio {
            audio: b"abc".to_vec().into(),
            mime_type: "audio/wav".into(),
            metadata: CaptureMetadata::default(),
        };
        let response = notification(CoordinatorEvent::RecordingComplete(captured)).unwrap();
        assert_eq!(response.action.as_deref(), Some("recordingComplete"));
        assert_eq!(response.id, None);
        assert_eq!(response.audio.as_deref(), Some("data:audio/wav;base64,YWJj"));
    }
}
