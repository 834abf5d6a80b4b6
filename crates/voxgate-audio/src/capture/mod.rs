//! Audio capture session.
//!
//! A [`CaptureSession`] records from one [`InputDevice`] while holding the
//! device lock. Fragments arrive from the device thread over a channel and
//! are assembled, in capture order, into one blob when recording stops.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

pub mod device;

pub use device::CpalInput;

use std::io::Cursor;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};
use voxgate_core::{
    CaptureMetadata, CaptureState, CapturedAudio, Error, Result, SessionKind, SessionLock,
};

use crate::event::CoordinatorEvent;

/// Layout of the fragments a device delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureFormat {
    /// Interleaved signed 16-bit little-endian PCM.
    Pcm16 { sample_rate: u32, channels: u16 },
    /// Already-encoded container bytes.
    Encoded { mime_type: String },
}

/// An audio input resource.
pub trait InputDevice {
    /// Acquire the device and start delivering fragments.
    fn start(&mut self, fragments: Sender<Bytes>) -> Result<()>;
    /// Flush outstanding fragments and release the device.
    fn stop(&mut self) -> Result<CaptureFormat>;
}

struct Recording {
    metadata: CaptureMetadata,
    fragments: Receiver<Bytes>,
    started_at: Instant,
}

/// Recording state machine around the single input device.
pub struct CaptureSession<D> {
    device: D,
    state: CaptureState,
    recording: Option<Recording>,
    /// MIME type reported for PCM recordings once wrapped.
    pcm_mime: String,
    event_tx: Sender<CoordinatorEvent>,
}

impl<D: InputDevice> CaptureSession<D> {
    pub fn new(device: D, pcm_mime: impl Into<String>, event_tx: Sender<CoordinatorEvent>) -> Self {
        Self {
            device,
            state: CaptureState::Idle,
            recording: None,
            pcm_mime: pcm_mime.into(),
            event_tx,
        }
    }

    pub const fn state(&self) -> CaptureState {
        self.state
    }

    /// Start recording. Fails if any session holds `lock` or the device cannot be acquired.
    pub fn start(&mut self, lock: &mut SessionLock, metadata: CaptureMetadata) -> Result<()> {
        if self.state != CaptureState::Idle {
            return Err(Error::SessionBusy {
                holder: lock.holder(),
            });
        }
        lock.acquire(SessionKind::Capture)?;

        let (tx, rx) = unbounded();
        if let Err(e) = self.device.start(tx) {
            warn!("Failed to acquire input device: {e}");
            lock.release(SessionKind::Capture);
            return Err(e);
        }

        self.recording = Some(Recording {
            metadata,
            fragments: rx,
            started_at: Instant::now(),
        });
        self.set_state(CaptureState::Recording);
        info!("Recording started");
        Ok(())
    }

    /// Stop recording and return everything captured since `start`.
    ///
    /// Stopping while idle is a no-op that returns `None`.
    pub fn stop(&mut self, lock: &mut SessionLock) -> Result<Option<CapturedAudio>> {
        let Some(recording) = self.recording.take() else {
            debug!("Stop requested while not recording");
            return Ok(None);
        };

        self.set_state(CaptureState::Stopping);
        let format = self.device.stop();
        let elapsed = recording.started_at.elapsed();

        // The device has flushed, so every fragment is already queued.
        let mut audio = BytesMut::new();
        for fragment in recording.fragments.try_iter() {
            audio.extend_from_slice(&fragment);
        }

        self.set_state(CaptureState::Idle);
        lock.release(SessionKind::Capture);

        let (audio, mime_type) = match format? {
            CaptureFormat::Pcm16 {
                sample_rate,
                channels,
            } => (
                encode_wav(&audio, sample_rate, channels)?,
                self.pcm_mime.clone(),
            ),
            CaptureFormat::Encoded { mime_type } => (audio.freeze(), mime_type),
        };

        info!(
            "Recording complete: {} bytes over {:.1}s",
            audio.len(),
            elapsed.as_secs_f64()
        );

        Ok(Some(CapturedAudio {
            audio,
            mime_type,
            metadata: recording.metadata,
        }))
    }

    /// Drop any recording in progress without assembling it.
    pub fn abort(&mut self, lock: &mut SessionLock) {
        if self.recording.take().is_some() {
            if let Err(e) = self.device.stop() {
                warn!("Failed to stop input device: {e}");
            }
            lock.release(SessionKind::Capture);
            self.set_state(CaptureState::Idle);
        }
    }

    fn set_state(&mut self, new_state: CaptureState) {
        let old_state = std::mem::replace(&mut self.state, new_state);
        if old_state != new_state {
            debug!("Capture state changed: {:?} -> {:?}", old_state, new_state);
            let _ = self
                .event_tx
                .send(CoordinatorEvent::CaptureStateChanged(new_state));
        }
    }
}

/// Wrap raw PCM16 LE samples in a WAV container.
fn encode_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Bytes> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    let mut writer = hound::WavWriter::new(&mut cursor, spec)
        .map_err(|e| Error::DeviceUnavailable(format!("Failed to start WAV encoding: {e}")))?;
    for pair in pcm.chunks_exact(2) {
        writer
            .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
            .map_err(|e| Error::DeviceUnavailable(format!("Failed to encode WAV: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| Error::DeviceUnavailable(format!("Failed to finish WAV: {e}")))?;

    Ok(Bytes::from(cursor.into_inner()))
}
