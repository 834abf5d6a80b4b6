//! Output backend using cpal, with decoding delegated to symphonia.
//!
//! Each session gets its own output stream, decode thread and sample queue.
//! Appended bytes (or fetched URL bytes) flow through a [`StreamFeed`] into
//! the decoder, then through a [`PcmQueue`] into the device callback.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use symphonia::core::probe::Hint;
use tracing::{debug, error, info, warn};
use voxgate_core::{AudioChunk, Error, PlaybackConfig, Result};

use super::{SinkBackend, SinkEvent, SinkEvents, SinkSource};
use crate::decode::{decode_stream, hint_for, StreamFeed, StreamReader};
use crate::pcm::{PcmQueue, SharedPcmQueue};
use crate::resample::{remix, Resampler};

/// Seconds of decoded audio buffered ahead of the device.
const QUEUE_SECONDS: usize = 2;

/// Read size when fetching remote resources.
const FETCH_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
struct OutputLayout {
    sample_rate: u32,
    channels: usize,
}

struct OutputSession {
    feed: StreamFeed,
    queue: SharedPcmQueue,
    playing: Arc<AtomicBool>,
    events: SinkEvents,
    /// Keep the stream alive for the duration of the session.
    _stream: Stream,
}

/// Default system output device.
///
/// Holds a cpal stream, which is not `Send`; create it on the coordinator thread.
pub struct CpalSink {
    config: PlaybackConfig,
    session: Option<OutputSession>,
}

impl CpalSink {
    pub const fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    fn session(&self) -> Result<&OutputSession> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::SinkFailure("output not open".to_string()))
    }

    fn build_stream<T: SizedSample + FromSample<f32>>(
        device: &Device,
        config: &StreamConfig,
        mut callback: OutputCallback,
    ) -> Result<Stream> {
        let error_events = callback.events.clone();
        let err_fn = move |err| {
            error!("Audio stream error: {err}");
            error_events.emit(SinkEvent::Failed(format!("Output stream error: {err}")));
        };

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| callback.fill(data),
                err_fn,
                None,
            )
            .map_err(|e| Error::DeviceUnavailable(format!("Failed to build output stream: {e}")))
    }
}

impl SinkBackend for CpalSink {
    fn open(&mut self, source: SinkSource, events: SinkEvents) -> Result<()> {
        self.release();

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::DeviceUnavailable("No output device found".to_string()))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device
            .default_output_config()
            .map_err(|e| Error::DeviceUnavailable(format!("Failed to get output config: {e}")))?;
        debug!("Supported output config: {:?}", supported);

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let layout = OutputLayout {
            sample_rate: config.sample_rate.0,
            channels: usize::from(config.channels),
        };

        let queue = PcmQueue::shared(layout.sample_rate as usize * layout.channels * QUEUE_SECONDS);
        let playing = Arc::new(AtomicBool::new(false));
        let callback = OutputCallback {
            queue: queue.clone(),
            playing: playing.clone(),
            volume: self.config.volume,
            started: false,
            ended: false,
            scratch: Vec::new(),
            events: events.clone(),
        };

        let stream = match sample_format {
            SampleFormat::F32 => Self::build_stream::<f32>(&device, &config, callback)?,
            SampleFormat::I16 => Self::build_stream::<i16>(&device, &config, callback)?,
            SampleFormat::U16 => Self::build_stream::<u16>(&device, &config, callback)?,
            _ => {
                return Err(Error::DeviceUnavailable(format!(
                    "Unsupported sample format: {sample_format:?}"
                )));
            }
        };
        stream
            .play()
            .map_err(|e| Error::DeviceUnavailable(format!("Failed to start stream: {e}")))?;

        info!(
            "Output opened on {device_name}: {} Hz, {} channels",
            layout.sample_rate, layout.channels
        );

        let feed = StreamFeed::new();
        let hint = match &source {
            SinkSource::Url(locator) => hint_for(extension_of(locator)),
            SinkSource::Stream => hint_for(Some(self.config.stream_mime.as_str())),
        };
        spawn_decoder(feed.clone(), hint, queue.clone(), layout, events.clone())?;

        if let SinkSource::Url(locator) = source {
            spawn_fetch(
                locator,
                feed.clone(),
                self.config.fetch_timeout(),
                events.clone(),
            )?;
        }

        self.session = Some(OutputSession {
            feed,
            queue,
            playing,
            events,
            _stream: stream,
        });
        Ok(())
    }

    fn append(&mut self, chunk: AudioChunk) -> Result<()> {
        let session = self.session()?;
        session.feed.push(chunk.as_bytes());
        session.events.emit(SinkEvent::AppendComplete);
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        self.session()?.playing.store(true, Ordering::Release);
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(session) = &self.session {
            session.playing.store(false, Ordering::Release);
        }
    }

    fn end_of_stream(&mut self) -> Result<()> {
        self.session()?.feed.finish();
        Ok(())
    }

    fn release(&mut self) {
        if let Some(session) = self.session.take() {
            session.playing.store(false, Ordering::Release);
            session.feed.cancel();
            session.queue.close();
            debug!("Output session released");
        }
    }
}

/// State owned by the device callback.
struct OutputCallback {
    queue: SharedPcmQueue,
    playing: Arc<AtomicBool>,
    volume: f32,
    started: bool,
    ended: bool,
    scratch: Vec<f32>,
    events: SinkEvents,
}

impl OutputCallback {
    fn fill<T: SizedSample + FromSample<f32>>(&mut self, data: &mut [T]) {
        if !self.playing.load(Ordering::Acquire) {
            data.fill(T::from_sample(0.0f32));
            return;
        }

        self.scratch.resize(data.len(), 0.0);
        let read = self.queue.pop_into(&mut self.scratch);

        for (i, sample) in data.iter_mut().enumerate() {
            *sample = if i < read {
                let s = self.scratch[i] * self.volume;
                // Soft clipping near full scale
                T::from_sample(if s.abs() > 0.9 { s.tanh() } else { s })
            } else {
                T::from_sample(0.0f32)
            };
        }

        if read > 0 && !self.started {
            self.started = true;
            self.events.emit(SinkEvent::Started);
        }
        if read < data.len() && !self.ended && self.queue.is_drained() {
            self.ended = true;
            self.events.emit(SinkEvent::Ended);
        }
    }
}

fn spawn_decoder(
    feed: StreamFeed,
    hint: Hint,
    queue: SharedPcmQueue,
    layout: OutputLayout,
    events: SinkEvents,
) -> Result<()> {
    let reader = feed.reader();
    std::thread::Builder::new()
        .name(format!("sink-decoder-{}", events.generation()))
        .spawn(move || match run_decoder(reader, &hint, &queue, layout) {
            Ok(()) => queue.finish(),
            Err(e) if feed.is_cancelled() => debug!("Decoder stopped after release: {e}"),
            Err(e) => {
                error!("Decoder failed: {e}");
                events.emit(SinkEvent::Failed(e.to_string()));
            }
        })
        .map(|_| ())
        .map_err(|e| Error::SinkFailure(format!("Failed to spawn decoder thread: {e}")))
}

fn run_decoder(
    reader: StreamReader,
    hint: &Hint,
    queue: &PcmQueue,
    layout: OutputLayout,
) -> Result<()> {
    let mut resampler: Option<Resampler> = None;
    let mut decoded_channels = layout.channels;
    let mut failure = None;

    decode_stream(reader, hint, |spec, samples| {
        if resampler.is_none() {
            match Resampler::new(spec.sample_rate, layout.sample_rate, spec.channels) {
                Ok(r) => {
                    decoded_channels = spec.channels;
                    resampler = Some(r);
                }
                Err(e) => {
                    failure = Some(e);
                    return false;
                }
            }
        }
        let Some(r) = resampler.as_mut() else {
            return false;
        };
        match r.process(samples) {
            Ok(converted) => queue.push(&remix(&converted, spec.channels, layout.channels)),
            Err(e) => {
                failure = Some(e);
                false
            }
        }
    })?;

    if let Some(e) = failure {
        return Err(e);
    }
    if let Some(mut r) = resampler {
        let tail = r.flush()?;
        queue.push(&remix(&tail, decoded_channels, layout.channels));
    }
    Ok(())
}

fn spawn_fetch(
    locator: String,
    feed: StreamFeed,
    timeout: Duration,
    events: SinkEvents,
) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("sink-fetch-{}", events.generation()))
        .spawn(move || {
            match fetch_into(&locator, &feed, timeout) {
                Ok(bytes) => debug!("Fetched {bytes} bytes from {locator}"),
                Err(e) if feed.is_cancelled() => debug!("Fetch abandoned: {e}"),
                Err(e) => {
                    error!("Failed to fetch {locator}: {e}");
                    events.emit(SinkEvent::Failed(e.to_string()));
                }
            }
            feed.finish();
        })
        .map(|_| ())
        .map_err(|e| Error::SinkFailure(format!("Failed to spawn fetch thread: {e}")))
}

/// Copy a resource into `feed`. `http(s)` URLs are downloaded; anything else is a file.
fn fetch_into(locator: &str, feed: &StreamFeed, timeout: Duration) -> Result<usize> {
    let mut reader: Box<dyn Read> = match url::Url::parse(locator) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            let config = ureq::Agent::config_builder()
                .timeout_global(Some(timeout))
                .build();
            let agent = ureq::Agent::new_with_config(config);
            let response = agent
                .get(locator)
                .call()
                .map_err(|e| Error::Network(format!("HTTP request failed: {e}")))?;
            Box::new(response.into_body().into_reader())
        }
        Ok(url) if url.scheme() == "file" => {
            let path = url
                .to_file_path()
                .map_err(|()| Error::Network(format!("Invalid file URL: {locator}")))?;
            Box::new(std::fs::File::open(path)?)
        }
        _ => Box::new(std::fs::File::open(locator)?),
    };

    let mut buf = vec![0u8; FETCH_CHUNK];
    let mut total = 0;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if feed.is_cancelled() {
            warn!("Fetch cancelled after {total} bytes");
            break;
        }
        feed.push(&buf[..n]);
        total += n;
    }
    Ok(total)
}

/// File extension of a locator, ignoring any query or fragment.
fn extension_of(locator: &str) -> Option<&str> {
    let path = locator.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    name.rsplit_once('.').map(|(_, ext)| ext)
}
