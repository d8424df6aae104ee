//! Diagonal Mahalanobis model over fixed-length feature vectors.

use super::ModelError;
use serde::Serialize;

/// Added to every variance so constant features do not divide by zero.
pub const VARIANCE_SMOOTHING: f32 = 1e-5;

/// Decay applied to the penalised distance in `confidence_score`.
pub const SCORE_DECAY: f32 = 0.00015;

/// Exponent applied to the distance in `confidence_score`.
pub const SCORE_EXPONENT: f32 = 1.8;

/// Enrolled model for one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BiometricModel {
    pub mean: Vec<f32>,
    /// Reciprocal of the smoothed per-dimension variance.
    pub inv_variance: Vec<f32>,
    pub user_id: String,
}

impl BiometricModel {
    pub fn dims(&self) -> usize {
        self.mean.len()
    }

    /// Distance of `vector` from this model.
    pub fn distance(&self, vector: &[f32]) -> Result<f32, ModelError> {
        mahalanobis_distance(vector, &self.mean, &self.inv_variance)
    }

    /// Confidence in `[0, 100]` that `vector` belongs to this user.
    pub fn score(&self, vector: &[f32]) -> Result<f32, ModelError> {
        self.distance(vector).map(confidence_score)
    }
}

/// Train a model from `samples`, a row-major matrix of `dims` columns.
///
/// Uses the population variance of each dimension.
pub fn train_model(
    samples: &[f32],
    dims: usize,
    user_id: impl Into<String>,
) -> Result<BiometricModel, ModelError> {
    if dims == 0 {
        return Err(ModelError::ZeroDimensions);
    }
    if samples.is_empty() {
        return Err(ModelError::NoSamples);
    }
    if samples.len() % dims != 0 {
        return Err(ModelError::RaggedSamples {
            len: samples.len(),
            dims,
        });
    }

    let count = (samples.len() / dims) as f32;

    let mut mean = vec![0.0f32; dims];
    for row in samples.chunks_exact(dims) {
        for (m, x) in mean.iter_mut().zip(row) {
            *m += x;
        }
    }
    mean.iter_mut().for_each(|m| *m /= count);

    let mut variance = vec![0.0f32; dims];
    for row in samples.chunks_exact(dims) {
        for ((v, x), m) in variance.iter_mut().zip(row).zip(&mean) {
            let diff = x - m;
            *v += diff * diff;
        }
    }

    let inv_variance = variance
        .into_iter()
        .map(|v| 1.0 / (v / count + VARIANCE_SMOOTHING))
        .collect();

    Ok(BiometricModel {
        mean,
        inv_variance,
        user_id: user_id.into(),
    })
}

/// `sqrt(sum((v - mean)^2 * inv_variance))`.
pub fn mahalanobis_distance(
    vector: &[f32],
    mean: &[f32],
    inv_variance: &[f32],
) -> Result<f32, ModelError> {
    if vector.len() != mean.len() || mean.len() != inv_variance.len() {
        return Err(ModelError::DimensionMismatch {
            vector: vector.len(),
            model: mean.len().min(inv_variance.len()),
        });
    }

    let sum: f32 = vector
        .iter()
        .zip(mean)
        .zip(inv_variance)
        .map(|((x, m), inv)| {
            let diff = x - m;
            diff * diff * inv
        })
        .sum();
    Ok(sum.sqrt())
}

/// Map a distance to a confidence in `[0, 100]`.
pub fn confidence_score(distance: f32) -> f32 {
    let score = (-distance.powf(SCORE_EXPONENT) * SCORE_DECAY).exp() * 100.0;
    score.clamp(0.0, 100.0)
}
