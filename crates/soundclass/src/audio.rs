//! Audio utilities.
//!
//! - container decode (WAV, FLAC, OGG/Vorbis, MP3) to mono `f32`
//! - channel downmix
//! - linear resampling

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Linearly resample `input` from `src_hz` to `dst_hz`.
#[must_use]
pub fn resample_linear_mono_f32(input: &[f32], src_hz: u32, dst_hz: u32) -> Vec<f32> {
    if src_hz == dst_hz || input.is_empty() || src_hz == 0 {
        return input.to_vec();
    }

    let new_n = ((input.len() as u64) * u64::from(dst_hz) / u64::from(src_hz)) as usize;
    let mut out = vec![0.0f32; new_n];
    let step = f64::from(src_hz) / f64::from(dst_hz);

    for (i, y) in out.iter_mut().enumerate() {
        let src_pos = (i as f64) * step;
        let idx = src_pos.floor() as usize;
        let frac = (src_pos - idx as f64) as f32;

        let a = input.get(idx).copied().unwrap_or(0.0);
        let b = input.get(idx + 1).copied().unwrap_or(a);
        *y = a * (1.0 - frac) + b * frac;
    }

    out
}

/// Average interleaved frames down to a single channel.
#[must_use]
pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let scale = 1.0 / channels as f32;
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub samples_mono: Vec<f32>,
}

impl DecodedAudio {
    #[must_use]
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate_hz == 0 {
            return 0.0;
        }
        self.samples_mono.len() as f32 / self.sample_rate_hz as f32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("empty audio payload")]
    Empty,
    #[error("unrecognized audio container: {0}")]
    Probe(String),
    #[error("no decodable audio track")]
    NoTrack,
    #[error("audio track does not declare a sample rate")]
    UnknownSampleRate,
    #[error("audio decode failed: {0}")]
    Decode(String),
    #[error("audio stream contained no samples")]
    NoSamples,
    #[error("audio is longer than {max_seconds} s")]
    TooLong { max_seconds: f32 },
}

/// Decode an in-memory audio file and return mono `f32` samples at the file's sample rate.
///
/// The container is detected by probing, so any format compiled into symphonia is accepted.
/// Corrupt packets are skipped; a stream that yields nothing is an error.
pub fn decode_audio_bytes(data: &[u8]) -> Result<DecodedAudio, AudioError> {
    decode_audio_bytes_limited(data, f32::INFINITY)
}

/// Like [`decode_audio_bytes`], but stops with [`AudioError::TooLong`] as soon as the
/// decoded duration exceeds `max_seconds`.
pub fn decode_audio_bytes_limited(
    data: &[u8],
    max_seconds: f32,
) -> Result<DecodedAudio, AudioError> {
    if data.is_empty() {
        return Err(AudioError::Empty);
    }

    let mss = MediaSourceStream::new(Box::new(Cursor::new(data.to_vec())), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AudioError::Probe(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(AudioError::NoTrack)?;
    let track_id = track.id;
    let sample_rate_hz = track
        .codec_params
        .sample_rate
        .ok_or(AudioError::UnknownSampleRate)?;
    let mut channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::Decode(e.to_string()))?;

    let mut interleaved = Vec::<f32>::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(AudioError::Decode(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!("skipping corrupt audio packet: {e}");
                continue;
            }
            Err(e) => return Err(AudioError::Decode(e.to_string())),
        };

        let spec = *decoded.spec();
        channels = spec.channels.count() as u16;
        let needs_alloc = sample_buf
            .as_ref()
            .map_or(true, |b| b.capacity() < decoded.capacity() * spec.channels.count());
        if needs_alloc {
            sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }
        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            interleaved.extend_from_slice(buf.samples());
        }

        let frames = interleaved.len() / usize::from(channels.max(1));
        if frames as f64 > f64::from(max_seconds) * f64::from(sample_rate_hz) {
            return Err(AudioError::TooLong { max_seconds });
        }
    }

    if interleaved.is_empty() {
        return Err(AudioError::NoSamples);
    }

    let samples_mono = downmix_to_mono(&interleaved, usize::from(channels.max(1)));
    Ok(DecodedAudio {
        sample_rate_hz,
        channels,
        samples_mono,
    })
}
