//! Log-mel spectrogram front-end.
//!
//! Literal torchaudio-style pipeline (`MelSpectrogram` followed by `AmplitudeToDB`):
//! - periodic Hann window, centered frames with reflect padding
//! - power spectrum via real FFT
//! - HTK mel scale, triangular filters without area normalization
//! - `10*log10(max(x, 1e-10))`

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::constants::{
    ANALYSIS_SAMPLE_RATE_HZ, DB_AMIN, F_MAX_HZ, F_MIN_HZ, HOP_LENGTH, MEL_BINS, N_FFT, N_FREQ,
};
use crate::tensor::FeatureMap;

#[inline]
fn hertz_to_mel(freq: f32) -> f32 {
    2595.0 * (1.0 + freq / 700.0).log10()
}

#[inline]
fn mel_to_hertz(mels: f32) -> f32 {
    700.0 * (10f32.powf(mels / 2595.0) - 1.0)
}

/// Row-major `[MEL_BINS, N_FREQ]` triangular filterbank.
fn build_mel_filters() -> Vec<f32> {
    let nyquist = (ANALYSIS_SAMPLE_RATE_HZ / 2) as f32;
    let fft_freqs: Vec<f32> = (0..N_FREQ)
        .map(|f| nyquist * (f as f32) / ((N_FREQ - 1) as f32))
        .collect();

    let mel_min = hertz_to_mel(F_MIN_HZ);
    let mel_max = hertz_to_mel(F_MAX_HZ);
    let filter_freqs: Vec<f32> = (0..MEL_BINS + 2)
        .map(|i| mel_to_hertz(mel_min + (mel_max - mel_min) * (i as f32) / ((MEL_BINS + 1) as f32)))
        .collect();

    let mut filters = vec![0.0f32; MEL_BINS * N_FREQ];
    for m in 0..MEL_BINS {
        let lower = filter_freqs[m + 1] - filter_freqs[m];
        let upper = filter_freqs[m + 2] - filter_freqs[m + 1];
        let row = &mut filters[m * N_FREQ..(m + 1) * N_FREQ];
        for (f, out) in row.iter_mut().enumerate() {
            let down = (fft_freqs[f] - filter_freqs[m]) / lower;
            let up = (filter_freqs[m + 2] - fft_freqs[f]) / upper;
            *out = down.min(up).max(0.0);
        }
    }
    filters
}

fn build_hann_window() -> Vec<f32> {
    (0..N_FFT)
        .map(|i| {
            let angle = 2.0 * std::f32::consts::PI * (i as f32) / (N_FFT as f32);
            0.5 * (1.0 - angle.cos())
        })
        .collect()
}

/// Mirror index `i` (which may lie outside `[0, len)`) back into range, excluding the edge sample.
fn reflect_index(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let mut r = i.rem_euclid(period);
    if r >= len as isize {
        r = period - r;
    }
    r as usize
}

/// Number of centered STFT frames for a waveform of `n_samples`.
#[must_use]
pub fn frame_count(n_samples: usize) -> usize {
    1 + n_samples / HOP_LENGTH
}

/// A `[MEL_BINS, n_frames]` row-major log-mel spectrogram in dB.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    pub data: Vec<f32>,
    pub n_frames: usize,
}

impl Spectrogram {
    #[must_use]
    pub fn n_mels(&self) -> usize {
        MEL_BINS
    }

    #[must_use]
    pub fn shape(&self) -> [usize; 2] {
        [MEL_BINS, self.n_frames]
    }

    #[must_use]
    pub fn row(&self, mel: usize) -> &[f32] {
        &self.data[mel * self.n_frames..(mel + 1) * self.n_frames]
    }

    /// Single-channel network input `[1, MEL_BINS, n_frames]`.
    #[must_use]
    pub fn to_feature_map(&self) -> FeatureMap {
        FeatureMap::from_vec(1, MEL_BINS, self.n_frames, self.data.clone())
    }
}

/// Deterministic waveform -> log-mel transform with fixed hyperparameters.
///
/// Holds only immutable tables, so one instance can be shared across threads.
pub struct Preprocessor {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    mel_filters: Vec<f32>, // [MEL_BINS * N_FREQ]
}

impl std::fmt::Debug for Preprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preprocessor")
            .field("n_fft", &N_FFT)
            .field("hop_length", &HOP_LENGTH)
            .field("n_mels", &MEL_BINS)
            .finish()
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Preprocessor {
    #[must_use]
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        Self {
            fft: planner.plan_fft_forward(N_FFT),
            window: build_hann_window(),
            mel_filters: build_mel_filters(),
        }
    }

    /// Compute the log-mel spectrogram of mono `samples`.
    #[must_use]
    pub fn compute(&self, samples: &[f32]) -> Spectrogram {
        let n_frames = frame_count(samples.len());
        let pad = (N_FFT / 2) as isize;
        let mut out = vec![0.0f32; MEL_BINS * n_frames];

        let mut buf = vec![Complex::new(0.0f32, 0.0); N_FFT];
        let mut scratch = vec![Complex::new(0.0f32, 0.0); self.fft.get_inplace_scratch_len()];
        let mut power = vec![0.0f32; N_FREQ];

        for t in 0..n_frames {
            let start = (t * HOP_LENGTH) as isize - pad;
            for (n, slot) in buf.iter_mut().enumerate() {
                let v = if samples.is_empty() {
                    0.0
                } else {
                    samples[reflect_index(start + n as isize, samples.len())]
                };
                *slot = Complex::new(v * self.window[n], 0.0);
            }

            self.fft.process_with_scratch(&mut buf, &mut scratch);
            for (p, c) in power.iter_mut().zip(buf.iter()) {
                *p = c.norm_sqr();
            }

            for m in 0..MEL_BINS {
                let filt = &self.mel_filters[m * N_FREQ..(m + 1) * N_FREQ];
                let energy: f32 = filt.iter().zip(power.iter()).map(|(w, p)| w * p).sum();
                out[m * n_frames + t] = power_to_db(energy);
            }
        }

        Spectrogram {
            data: out,
            n_frames,
        }
    }
}

#[inline]
fn power_to_db(power: f32) -> f32 {
    // NaN compares false against the floor, so route it to the floor too.
    let clamped = if power >= DB_AMIN { power } else { DB_AMIN };
    10.0 * clamped.log10()
}
