//! Streaming audio decoding
//!
//! Uses symphonia for decoding multiple formats:
//! - WAV, AIFF (PCM)
//! - FLAC (lossless)
//! - MP3, OGG Vorbis, AAC (lossy)
//!
//! Unlike an offline loader, this decoder is a lazy, restartable, finite
//! source: the pump pulls one frame's worth of samples at a time and the
//! whole file is never resident.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use dp_core::{Sample, ValidationError};

use crate::{PlaybackError, PlaybackResult};

/// File extensions the engine accepts.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["wav", "flac", "mp3", "ogg", "m4a", "aiff"];

/// A restartable, finite source of interleaved f32 frames in [-1, 1].
///
/// The trait seam exists so tests can substitute synthetic or misbehaving
/// sources for the file-backed decoder.
pub trait AudioSource: Send {
    /// Read up to `max_frames` frames into `dest` (interleaved by source
    /// channel), decoding as many codec packets as it takes to fill the
    /// request. May block on source I/O for those packets, but never
    /// waits for samples the source cannot currently yield: that is a
    /// short read (the pump zero-pads and records an underflow), and
    /// zero frames means end of stream.
    fn read_into(&mut self, dest: &mut [Sample], max_frames: usize) -> PlaybackResult<usize>;

    /// Position the next read at `sample`, within one codec frame.
    fn seek_to_sample(&mut self, sample: u64) -> PlaybackResult<()>;

    fn total_samples(&self) -> u64;
    fn sample_rate_hz(&self) -> u32;
    fn channel_count(&self) -> usize;
    fn bit_depth(&self) -> u32;
}

/// Symphonia-backed implementation of [`AudioSource`].
pub struct AudioDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate_hz: u32,
    channel_count: usize,
    bit_depth: u32,
    total_samples: u64,
    /// Decoded samples not yet handed out, interleaved.
    pending: Vec<Sample>,
    pending_offset: usize,
    /// Frames to discard after a coarse seek landed early.
    skip_frames: u64,
    eof: bool,
}

impl std::fmt::Debug for AudioDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioDecoder")
            .field("track_id", &self.track_id)
            .field("sample_rate_hz", &self.sample_rate_hz)
            .field("channel_count", &self.channel_count)
            .field("bit_depth", &self.bit_depth)
            .field("total_samples", &self.total_samples)
            .field("pending_offset", &self.pending_offset)
            .field("skip_frames", &self.skip_frames)
            .field("eof", &self.eof)
            .finish()
    }
}

impl AudioDecoder {
    /// Open an audio file and prepare the first track for streaming.
    pub fn open(path: &Path) -> PlaybackResult<Self> {
        if !path.exists() {
            return Err(ValidationError::FileNotFound(path.display().to_string()).into());
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(ValidationError::UnsupportedFormat(ext).into());
        }

        let file = File::open(path)
            .map_err(|e| PlaybackError::Decoder(format!("Failed to open file: {}", e)))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        hint.with_extension(&ext);

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| PlaybackError::Decoder(format!("Failed to probe format: {}", e)))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| PlaybackError::Decoder("No audio track found".to_string()))?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate_hz = codec_params.sample_rate.unwrap_or(44100);
        let channel_count = codec_params.channels.map(|c| c.count()).unwrap_or(2);
        let bit_depth = codec_params.bits_per_sample.unwrap_or(16);
        let total_samples = codec_params.n_frames.unwrap_or(0);

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| PlaybackError::Decoder(format!("Failed to create decoder: {}", e)))?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate_hz,
            channel_count,
            bit_depth,
            total_samples,
            pending: Vec::new(),
            pending_offset: 0,
            skip_frames: 0,
            eof: false,
        })
    }

    /// Decode packets until at least one frame is pending or the stream
    /// ends. Packets that fail to decode are skipped.
    fn refill(&mut self) -> PlaybackResult<()> {
        while self.pending_offset >= self.pending.len() && !self.eof {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.eof = true;
                    return Ok(());
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.eof = true;
                    return Ok(());
                }
                Err(e) => {
                    return Err(PlaybackError::Decoder(format!("Packet read error: {}", e)));
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut buffer =
                        SampleBuffer::<Sample>::new(decoded.capacity() as u64, spec);
                    buffer.copy_interleaved_ref(decoded);

                    self.pending.clear();
                    self.pending.extend_from_slice(buffer.samples());
                    self.pending_offset = 0;

                    if self.skip_frames > 0 {
                        let skip =
                            (self.skip_frames as usize * self.channel_count).min(self.pending.len());
                        self.pending_offset = skip;
                        self.skip_frames -= (skip / self.channel_count) as u64;
                    }
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    log::warn!("Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => {
                    return Err(PlaybackError::Decoder(format!("Decode error: {}", e)));
                }
            }
        }
        Ok(())
    }
}

impl AudioSource for AudioDecoder {
    fn read_into(&mut self, dest: &mut [Sample], max_frames: usize) -> PlaybackResult<usize> {
        let channels = self.channel_count;
        let mut produced = 0;

        while produced < max_frames {
            if self.pending_offset >= self.pending.len() {
                self.refill()?;
                if self.pending_offset >= self.pending.len() {
                    break; // end of stream
                }
            }

            let available = (self.pending.len() - self.pending_offset) / channels;
            let take = available.min(max_frames - produced);
            let src = &self.pending[self.pending_offset..self.pending_offset + take * channels];
            dest[produced * channels..(produced + take) * channels].copy_from_slice(src);

            self.pending_offset += take * channels;
            produced += take;
        }

        Ok(produced)
    }

    fn seek_to_sample(&mut self, sample: u64) -> PlaybackResult<()> {
        let target = sample.min(self.total_samples);
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: target,
                    track_id: self.track_id,
                },
            )
            .map_err(|e| PlaybackError::Decoder(format!("Seek failed: {}", e)))?;

        self.decoder.reset();
        self.pending.clear();
        self.pending_offset = 0;
        self.eof = false;
        // Accurate seeks land on a packet boundary at or before the target;
        // discard the residual so the next read starts exactly there.
        self.skip_frames = target.saturating_sub(seeked.actual_ts);
        Ok(())
    }

    fn total_samples(&self) -> u64 {
        self.total_samples
    }

    fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn bit_depth(&self) -> u32 {
        self.bit_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_extension_rejected() {
        let err = AudioDecoder::open(Path::new("/tmp/notes.txt")).unwrap_err();
        assert!(matches!(
            err,
            PlaybackError::Validation(ValidationError::FileNotFound(_))
                | PlaybackError::Validation(ValidationError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_missing_file_rejected() {
        let err = AudioDecoder::open(Path::new("/nonexistent/take.wav")).unwrap_err();
        assert!(matches!(
            err,
            PlaybackError::Validation(ValidationError::FileNotFound(_))
        ));
    }
}
