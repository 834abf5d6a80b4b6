//! Incremental decoding of streamed bytes using symphonia.
//!
//! Appended bytes land in a [`StreamFeed`]; the decode thread reads them back
//! through a [`StreamReader`] that blocks until more data arrives or the feed
//! is finished, so symphonia sees one continuous, non-seekable source.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::{debug, warn};
use voxgate_core::{Error, Result};

#[derive(Default)]
struct FeedState {
    data: Vec<u8>,
    finished: bool,
    cancelled: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<FeedState>,
    more: Condvar,
}

/// Writer side of a growing byte source.
#[derive(Clone, Default)]
pub struct StreamFeed {
    shared: Arc<Shared>,
}

impl StreamFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and wake the reader.
    pub fn push(&self, bytes: &[u8]) {
        let mut state = self.shared.state.lock();
        if state.finished || state.cancelled {
            warn!("Dropping {} bytes pushed after end of stream", bytes.len());
            return;
        }
        state.data.extend_from_slice(bytes);
        self.shared.more.notify_all();
    }

    /// No more bytes will follow; the reader sees EOF once it catches up.
    pub fn finish(&self) {
        self.shared.state.lock().finished = true;
        self.shared.more.notify_all();
    }

    /// Abandon the stream; the reader sees EOF immediately.
    pub fn cancel(&self) {
        self.shared.state.lock().cancelled = true;
        self.shared.more.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }

    /// Create a reader starting at the first byte.
    pub fn reader(&self) -> StreamReader {
        StreamReader {
            shared: self.shared.clone(),
            pos: 0,
        }
    }
}

/// Blocking reader side of a [`StreamFeed`].
pub struct StreamReader {
    shared: Arc<Shared>,
    pos: usize,
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            if state.cancelled {
                return Ok(0);
            }
            let available = state.data.len() - self.pos;
            if available > 0 {
                let n = available.min(buf.len());
                buf[..n].copy_from_slice(&state.data[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if state.finished {
                return Ok(0);
            }
            self.shared.more.wait(&mut state);
        }
    }
}

impl Seek for StreamReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.pos as u64),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream source is not seekable",
            )),
        }
    }
}

impl MediaSource for StreamReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Build a probe hint from a MIME type or a file extension.
pub fn hint_for(mime_or_ext: Option<&str>) -> Hint {
    let mut hint = Hint::new();
    let Some(value) = mime_or_ext else {
        return hint;
    };
    let value = value.to_lowercase();

    if value.contains('/') {
        hint.mime_type(&value);
    }
    let extension = if value.contains("webm") || value.contains("opus") {
        Some("webm")
    } else if value.contains("mp4") || value.contains("m4a") || value.contains("aac") {
        Some("m4a")
    } else if value.contains("mp3") || value.contains("mpeg") {
        Some("mp3")
    } else if value.contains("ogg") || value.contains("vorbis") {
        Some("ogg")
    } else if value.contains("flac") {
        Some("flac")
    } else if value.contains("wav") {
        Some("wav")
    } else {
        None
    };
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }
    hint
}

/// Decoded PCM format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmSpec {
    pub sample_rate: u32,
    pub channels: usize,
}

/// Decode `reader` to interleaved f32, handing each packet's samples to `on_samples`.
///
/// Returns once the source is exhausted. `on_samples` returning `false` stops
/// decoding early (the session was torn down).
pub fn decode_stream<F>(reader: StreamReader, hint: &Hint, mut on_samples: F) -> Result<()>
where
    F: FnMut(PcmSpec, &[f32]) -> bool,
{
    let mss = MediaSourceStream::new(Box::new(reader), MediaSourceStreamOptions::default());

    let probed = symphonia::default::get_probe()
        .format(
            hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| Error::AudioDecode(format!("Failed to probe format: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| Error::AudioDecode("No audio tracks found".to_string()))?;
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| Error::AudioDecode(format!("Failed to create decoder: {e}")))?;

    let mut samples: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("Decoder reached end of stream");
                return Ok(());
            }
            Err(e) => return Err(Error::AudioDecode(format!("Failed to read packet: {e}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Skipping corrupt frame: {e}");
                continue;
            }
            Err(e) => return Err(Error::AudioDecode(format!("Decode failed: {e}"))),
        };

        let spec = *decoded.spec();
        let frames = decoded.capacity();
        if samples
            .as_ref()
            .map_or(true, |b| b.capacity() < frames * spec.channels.count())
        {
            samples = None;
        }
        let buffer = samples.get_or_insert_with(|| SampleBuffer::new(frames as u64, spec));
        buffer.copy_interleaved_ref(decoded);

        let pcm = PcmSpec {
            sample_rate: spec.rate,
            channels: spec.channels.count(),
        };
        if !on_samples(pcm, buffer.samples()) {
            debug!("Decoding stopped by consumer");
            return Ok(());
        }
    }
}
