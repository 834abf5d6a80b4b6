//! Microphone capture using cpal.

use bytes::Bytes;
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use crossbeam_channel::Sender;
use tracing::{debug, error, info};
use voxgate_core::{Error, Result};

use super::{CaptureFormat, InputDevice};

/// Default system input device.
///
/// Samples are delivered as PCM16 LE fragments, one per device callback.
/// The cpal stream is not `Send`, so this must live on the coordinator thread.
#[derive(Default)]
pub struct CpalInput {
    stream: Option<Stream>,
    format: Option<CaptureFormat>,
}

impl CpalInput {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_stream<T>(
        device: &Device,
        config: &StreamConfig,
        fragments: Sender<Bytes>,
    ) -> Result<Stream>
    where
        T: SizedSample,
        i16: FromSample<T>,
    {
        let err_fn = |err| {
            error!("Input stream error: {err}");
        };

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let mut fragment = Vec::with_capacity(data.len() * 2);
                    for &sample in data {
                        fragment.extend_from_slice(&sample.to_sample::<i16>().to_le_bytes());
                    }
                    // Receiver gone means the session was aborted
                    let _ = fragments.send(Bytes::from(fragment));
                },
                err_fn,
                None,
            )
            .map_err(|e| Error::DeviceUnavailable(format!("Failed to build input stream: {e}")))
    }
}

impl InputDevice for CpalInput {
    fn start(&mut self, fragments: Sender<Bytes>) -> Result<()> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("No input device found".to_string()))?;

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let supported = device
            .default_input_config()
            .map_err(|e| Error::DeviceUnavailable(format!("Failed to get input config: {e}")))?;

        debug!("Supported input config: {:?}", supported);

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        let stream = match sample_format {
            SampleFormat::F32 => Self::build_stream::<f32>(&device, &config, fragments)?,
            SampleFormat::I16 => Self::build_stream::<i16>(&device, &config, fragments)?,
            SampleFormat::U16 => Self::build_stream::<u16>(&device, &config, fragments)?,
            _ => {
                return Err(Error::DeviceUnavailable(format!(
                    "Unsupported input sample format: {sample_format:?}"
                )));
            }
        };

        stream
            .play()
            .map_err(|e| Error::DeviceUnavailable(format!("Failed to start input stream: {e}")))?;

        info!(
            "Capturing from {device_name}: {} Hz, {} channels",
            config.sample_rate.0, config.channels
        );

        self.format = Some(CaptureFormat::Pcm16 {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        });
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) -> Result<CaptureFormat> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| Error::InvalidTransition("input device not started".to_string()))?;

        if let Err(e) = stream.pause() {
            debug!("Failed to pause input stream: {e}");
        }
        // Dropping the stream joins the callback thread, so no fragment follows.
        drop(stream);

        self.format
            .take()
            .ok_or_else(|| Error::InvalidTransition("input format unknown".to_string()))
    }
}
