//! Request-level inference over a loaded checkpoint, and the host that owns its lifecycle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use serde::Serialize;
use thiserror::Error;

use crate::audio::{decode_audio_bytes_limited, downmix_to_mono, resample_linear_mono_f32, AudioError};
use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::constants::{
    DEFAULT_TOP_K, MAX_CLIP_SECONDS, MAX_WAVEFORM_POINTS, MIN_SOURCE_SAMPLE_RATE_HZ,
    TARGET_SAMPLE_RATE_HZ,
};
use crate::math::{softmax_inplace, top_k_indices};
use crate::mel::{Preprocessor, Spectrogram};
use crate::ops::zero_non_finite;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error("audio must have at least one channel")]
    NoChannels,
    #[error("sample rate {0} Hz is below the supported minimum of {min} Hz", min = MIN_SOURCE_SAMPLE_RATE_HZ)]
    UnsupportedSampleRate(u32),
    #[error("clip is {seconds:.1} s long, the limit is {max} s", max = MAX_CLIP_SECONDS)]
    ClipTooLong { seconds: f32 },
    #[error("model is not ready (state: {0})")]
    NotReady(ServiceState),
    #[error("model loading was already started")]
    AlreadyStarted,
    #[error("model load failed: {0}")]
    Load(#[from] CheckpointError),
}

/// One labelled entry of a ranked prediction list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub class: String,
    pub confidence: f32,
}

/// A 2-D row-major plane.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plane {
    pub shape: [usize; 2],
    pub values: Vec<f32>,
}

impl Plane {
    fn sanitized(shape: [usize; 2], mut values: Vec<f32>) -> Self {
        zero_non_finite(&mut values);
        Self { shape, values }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Waveform {
    pub values: Vec<f32>,
    pub sample_rate: u32,
    pub duration: f32,
}

/// Predictions plus everything needed to plot how the network saw the input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub predictions: Vec<Prediction>,
    /// Channel-averaged activation per captured layer.
    pub visualization: BTreeMap<String, Plane>,
    pub input_spectrogram: Plane,
    pub waveform: Waveform,
}

/// Keep at most `max_points` samples by taking every `ceil(len / max_points)`-th one.
#[must_use]
pub fn downsample_for_display(samples: &[f32], max_points: usize) -> Vec<f32> {
    if max_points == 0 {
        return Vec::new();
    }
    if samples.len() <= max_points {
        return samples.to_vec();
    }
    let step = samples.len().div_ceil(max_points);
    samples.iter().step_by(step).copied().collect()
}

/// Loaded checkpoint plus preprocessing, answering classification requests.
///
/// All methods take `&self`; nothing here mutates after construction.
#[derive(Debug)]
pub struct InferenceService {
    checkpoint: Checkpoint,
    preprocessor: Preprocessor,
    top_k: usize,
}

impl InferenceService {
    #[must_use]
    pub fn new(checkpoint: Checkpoint, top_k: usize) -> Self {
        Self {
            checkpoint,
            preprocessor: Preprocessor::new(),
            top_k,
        }
    }

    #[must_use]
    pub fn with_default_top_k(checkpoint: Checkpoint) -> Self {
        Self::new(checkpoint, DEFAULT_TOP_K)
    }

    #[must_use]
    pub fn classes(&self) -> &[String] {
        self.checkpoint.classes()
    }

    #[must_use]
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Decode an audio file and classify it.
    pub fn classify_bytes(&self, bytes: &[u8]) -> Result<Vec<Prediction>, InferenceError> {
        let audio = decode_audio_bytes_limited(bytes, MAX_CLIP_SECONDS)?;
        self.classify_samples(&audio.samples_mono, 1, audio.sample_rate_hz)
    }

    /// Classify interleaved PCM with `channels` channels at `sample_rate_hz`.
    pub fn classify_samples(
        &self,
        interleaved: &[f32],
        channels: usize,
        sample_rate_hz: u32,
    ) -> Result<Vec<Prediction>, InferenceError> {
        let samples = prepare_waveform(interleaved, channels, sample_rate_hz)?;
        let spec = self.preprocessor.compute(&samples);
        let logits = self.checkpoint.network().forward(&spec.to_feature_map());
        let predictions = self.predictions_from_logits(logits);
        tracing::info!(
            frames = spec.n_frames,
            top = predictions.first().map_or("", |p| p.class.as_str()),
            "classified request"
        );
        Ok(predictions)
    }

    /// Sanitize, normalize and rank raw class scores.
    ///
    /// Non-finite logits count as zero. Returns at most `top_k` entries in descending
    /// confidence, equal confidences in class-index order.
    #[must_use]
    pub fn predictions_from_logits(&self, mut logits: Vec<f32>) -> Vec<Prediction> {
        let replaced = zero_non_finite(&mut logits);
        if replaced > 0 {
            tracing::warn!(replaced, "non-finite logits replaced with zero");
        }
        softmax_inplace(&mut logits);
        top_k_indices(&logits, self.top_k)
            .into_iter()
            .filter_map(|i| {
                self.classes().get(i).map(|label| Prediction {
                    class: label.clone(),
                    confidence: logits[i],
                })
            })
            .collect()
    }

    /// Decode and classify, also returning feature maps, spectrogram and waveform.
    pub fn analyze_bytes(&self, bytes: &[u8]) -> Result<Analysis, InferenceError> {
        let audio = decode_audio_bytes_limited(bytes, MAX_CLIP_SECONDS)?;
        self.analyze_samples(&audio.samples_mono, 1, audio.sample_rate_hz)
    }

    pub fn analyze_samples(
        &self,
        interleaved: &[f32],
        channels: usize,
        sample_rate_hz: u32,
    ) -> Result<Analysis, InferenceError> {
        let samples = prepare_waveform(interleaved, channels, sample_rate_hz)?;
        let spec: Spectrogram = self.preprocessor.compute(&samples);
        let (logits, maps) = self
            .checkpoint
            .network()
            .forward_with_feature_maps(&spec.to_feature_map());

        let visualization = maps
            .iter()
            .map(|(name, map)| {
                (
                    name.to_string(),
                    Plane::sanitized([map.height, map.width], map.channel_mean()),
                )
            })
            .collect();
        tracing::debug!(layers = maps.len(), frames = spec.n_frames, "captured feature maps");

        let duration = samples.len() as f32 / TARGET_SAMPLE_RATE_HZ as f32;

        Ok(Analysis {
            predictions: self.predictions_from_logits(logits),
            visualization,
            input_spectrogram: Plane::sanitized(spec.shape(), spec.data.clone()),
            waveform: Waveform {
                values: downsample_for_display(&samples, MAX_WAVEFORM_POINTS),
                sample_rate: TARGET_SAMPLE_RATE_HZ,
                duration,
            },
        })
    }
}

/// Mono at [`TARGET_SAMPLE_RATE_HZ`].
///
/// Rates below [`MIN_SOURCE_SAMPLE_RATE_HZ`] and clips over [`MAX_CLIP_SECONDS`] are rejected
/// before anything is resampled, so the output never exceeds the clip limit at 44.1 kHz.
fn prepare_waveform(
    interleaved: &[f32],
    channels: usize,
    sample_rate_hz: u32,
) -> Result<Vec<f32>, InferenceError> {
    if channels == 0 {
        return Err(InferenceError::NoChannels);
    }
    if sample_rate_hz < MIN_SOURCE_SAMPLE_RATE_HZ {
        return Err(InferenceError::UnsupportedSampleRate(sample_rate_hz));
    }
    let seconds = (interleaved.len() / channels) as f32 / sample_rate_hz as f32;
    if seconds > MAX_CLIP_SECONDS {
        return Err(InferenceError::ClipTooLong { seconds });
    }
    let mono = downmix_to_mono(interleaved, channels);
    Ok(resample_linear_mono_f32(&mono, sample_rate_hz, TARGET_SAMPLE_RATE_HZ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Unloaded,
    Loading,
    Ready,
}

const STATE_UNLOADED: u8 = 0;
const STATE_LOADING: u8 = 1;
const STATE_READY: u8 = 2;

impl ServiceState {
    const fn from_u8(v: u8) -> Self {
        match v {
            STATE_UNLOADED => Self::Unloaded,
            STATE_LOADING => Self::Loading,
            _ => Self::Ready,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resets a `Loading` host to `Unloaded` on drop unless it has been marked ready.
struct LoadingGuard<'a> {
    state: &'a AtomicU8,
    ready: bool,
}

impl LoadingGuard<'_> {
    fn mark_ready(mut self) {
        self.state.store(STATE_READY, Ordering::Release);
        self.ready = true;
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if !self.ready {
            self.state.store(STATE_UNLOADED, Ordering::Release);
        }
    }
}

/// Owns the single loaded [`InferenceService`] and its `Unloaded -> Loading -> Ready` state.
///
/// Loading happens at most once. A failed load returns to `Unloaded`; `Ready` is final.
#[derive(Debug, Default)]
pub struct ModelHost {
    state: AtomicU8,
    service: OnceLock<InferenceService>,
}

impl ModelHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Run `load` and, on success, make its checkpoint available for requests.
    ///
    /// If `load` fails or panics the host goes back to `Unloaded`.
    pub fn start<F>(&self, top_k: usize, load: F) -> Result<&InferenceService, InferenceError>
    where
        F: FnOnce() -> Result<Checkpoint, CheckpointError>,
    {
        if self
            .state
            .compare_exchange(STATE_UNLOADED, STATE_LOADING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(InferenceError::AlreadyStarted);
        }
        let guard = LoadingGuard {
            state: &self.state,
            ready: false,
        };
        tracing::info!("loading model");

        let checkpoint = load().inspect_err(|e| tracing::error!(error = %e, "model load failed"))?;
        let service = self.service.get_or_init(|| InferenceService::new(checkpoint, top_k));
        guard.mark_ready();
        tracing::info!(classes = service.classes().len(), top_k, "model ready");
        Ok(service)
    }

    /// The loaded service, or `NotReady` before a successful [`ModelHost::start`].
    pub fn service(&self) -> Result<&InferenceService, InferenceError> {
        match self.state() {
            ServiceState::Ready => self
                .service
                .get()
                .ok_or(InferenceError::NotReady(ServiceState::Ready)),
            other => Err(InferenceError::NotReady(other)),
        }
    }
}
