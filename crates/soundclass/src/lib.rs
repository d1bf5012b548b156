//! Environmental sound classification (Rust) core library.
//!
//! This crate provides:
//! - Audio frontend (decode + resample + log-mel)
//! - Residual CNN classifier loaded from safetensors
//! - Ranked top-k inference service with an explicit load lifecycle

pub mod audio;
pub mod block;
pub mod checkpoint;
pub mod constants;
pub mod conv;
pub mod math;
pub mod mel;
pub mod network;
pub mod ops;
pub mod service;
pub mod tensor;
#[doc(hidden)]
pub mod testing;
pub mod weights;

pub use checkpoint::{Checkpoint, CheckpointError};
pub use mel::{Preprocessor, Spectrogram};
pub use network::{ClassifierNetwork, FeatureMaps};
pub use service::{Analysis, InferenceError, InferenceService, ModelHost, Prediction, ServiceState};
