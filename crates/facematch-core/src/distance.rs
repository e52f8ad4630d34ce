//! Descriptor distances and threshold matching.

use crate::types::{Descriptor, IdentityId, IdentityMatch};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default match threshold. Calibrated for euclidean distance on FaceNet-scale
/// descriptors; other models need their own value.
pub const DEFAULT_THRESHOLD: f32 = 9.0;

#[derive(Error, Debug, PartialEq)]
pub enum DistanceError {
    #[error("unknown distance metric {0:?}: choose \"euclidean\" or \"cosine\"")]
    UnknownMetric(String),
    #[error("descriptor length mismatch: target has {expected} values, candidate {index} has {actual}")]
    DimensionMismatch {
        expected: usize,
        actual: usize,
        index: usize,
    },
}

/// Distance metric between two descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    #[serde(alias = "euclidian")]
    Euclidean,
    Cosine,
}

impl Metric {
    /// Distance between two equal-length vectors.
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Euclidean => euclidean(a, b),
            Metric::Cosine => cosine_distance(a, b),
        }
    }
}

impl FromStr for Metric {
    type Err = DistanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" | "euclidian" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            _ => Err(DistanceError::UnknownMetric(s.to_string())),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Metric::Euclidean => "euclidean",
            Metric::Cosine => "cosine",
        })
    }
}

/// L2 norm of `b - a`.
pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (y - x).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// `1 - cos(a, b)`. A zero-length vector has no direction; its distance to
/// anything is 1.0 (similarity 0).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        1.0 - dot / denom
    } else {
        1.0
    }
}

/// Distance from `target` to each candidate, in candidate order.
pub fn distances(
    target: &Descriptor,
    candidates: &[Descriptor],
    metric: Metric,
) -> Result<Vec<f32>, DistanceError> {
    candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| {
            if candidate.len() != target.len() {
                return Err(DistanceError::DimensionMismatch {
                    expected: target.len(),
                    actual: candidate.len(),
                    index,
                });
            }
            Ok(metric.distance(target.as_slice(), candidate.as_slice()))
        })
        .collect()
}

/// A distance matches when it is at or below `threshold`.
pub fn within_threshold(distances: &[f32], threshold: f32) -> Vec<bool> {
    distances.iter().map(|&d| d <= threshold).collect()
}

/// Match `target` against `candidates`.
///
/// When `precomputed` is given those distances are used as-is and
/// `candidates` is not read.
pub fn compare(
    target: &Descriptor,
    candidates: &[Descriptor],
    metric: Metric,
    precomputed: Option<&[f32]>,
    threshold: f32,
) -> Result<Vec<bool>, DistanceError> {
    match precomputed {
        Some(d) => Ok(within_threshold(d, threshold)),
        None => Ok(within_threshold(&distances(target, candidates, metric)?, threshold)),
    }
}

/// Metric plus threshold, the pair every matching call needs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceMatcher {
    pub metric: Metric,
    pub threshold: f32,
}

impl Default for DistanceMatcher {
    fn default() -> Self {
        Self {
            metric: Metric::Euclidean,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl DistanceMatcher {
    pub fn new(metric: Metric, threshold: f32) -> Self {
        Self { metric, threshold }
    }

    /// Per-candidate match flags.
    pub fn matches(
        &self,
        target: &Descriptor,
        candidates: &[Descriptor],
    ) -> Result<Vec<bool>, DistanceError> {
        compare(target, candidates, self.metric, None, self.threshold)
    }

    /// Closest candidate within the threshold.
    ///
    /// `labels[i]` is the identity owning `candidates[i]`; `name_of` resolves
    /// display names.
    pub fn best_match<'a>(
        &self,
        target: &Descriptor,
        candidates: &[Descriptor],
        labels: &[IdentityId],
        name_of: impl Fn(IdentityId) -> Option<&'a str>,
    ) -> Result<Option<IdentityMatch>, DistanceError> {
        let dists = distances(target, candidates, self.metric)?;
        let flags = within_threshold(&dists, self.threshold);

        let mut best: Option<(IdentityId, f32)> = None;
        for ((&distance, &matched), &id) in dists.iter().zip(&flags).zip(labels) {
            if !matched {
                continue;
            }
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((id, distance));
            }
        }

        Ok(best.map(|(id, distance)| IdentityMatch {
            id,
            name: name_of(id).unwrap_or_default().to_string(),
            distance,
        }))
    }
}
