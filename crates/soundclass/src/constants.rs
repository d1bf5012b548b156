//! Model and signal-processing constants.

// Rate the service resamples decoded audio to (the rate the ESC-50 clips
// and the shipped checkpoints were produced at).
pub const TARGET_SAMPLE_RATE_HZ: u32 = 44_100;

// Mel analysis. The filterbank is laid out for 22.05 kHz even though the
// waveform arrives at 44.1 kHz; trained checkpoints depend on that layout.
pub const ANALYSIS_SAMPLE_RATE_HZ: u32 = 22_050;
pub const N_FFT: usize = 1024;
pub const HOP_LENGTH: usize = 512;
pub const N_FREQ: usize = N_FFT / 2 + 1; // 513
pub const MEL_BINS: usize = 128;
pub const F_MIN_HZ: f32 = 0.0;
pub const F_MAX_HZ: f32 = 11_025.0;

// Power -> dB conversion floor (10*log10(1e-10) = -100 dB).
pub const DB_AMIN: f32 = 1e-10;

// Network.
pub const BATCH_NORM_EPS: f32 = 1e-5;
pub const DROPOUT_P: f32 = 0.5;
pub const ESC50_CLASSES: usize = 50;

// Serving.
pub const DEFAULT_TOP_K: usize = 3;
pub const MAX_WAVEFORM_POINTS: usize = 8_000;

// Per-request bounds. Decoded audio is rejected past these, before any
// resampling or spectrogram buffers are allocated.
pub const MIN_SOURCE_SAMPLE_RATE_HZ: u32 = 4_000;
pub const MAX_CLIP_SECONDS: f32 = 60.0;
