//! Biometric scoring utility.
//!
//! Trains a per-user diagonal Mahalanobis model from feature vectors and
//! scores new vectors against it. Independent of the connection engine.

pub mod frame;
pub mod model;

pub use frame::{analyze_frame, FrameAnalysis, MIN_LANDMARKS};
pub use model::{confidence_score, mahalanobis_distance, train_model, BiometricModel};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("no training samples")]
    NoSamples,
    #[error("feature vectors must have at least one dimension")]
    ZeroDimensions,
    #[error("{len} values do not form rows of {dims}")]
    RaggedSamples { len: usize, dims: usize },
    #[error("vector has {vector} dimensions, model has {model}")]
    DimensionMismatch { vector: usize, model: usize },
    #[error("frame has {got} landmarks, need at least {need}")]
    TooFewLandmarks { got: usize, need: usize },
}
