use serde::{Deserialize, Serialize};
use std::fmt;

/// Face rectangle in pixel coordinates, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Box covering the whole image. Used when a caller supplies no region.
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
        }
    }
}

/// A 2D point in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Facial keypoints reported by a detector.
///
/// Only the eyes drive alignment; `nose` is carried through for callers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose: Point,
}

/// One face found by a [`Detector`](crate::detector::Detector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub landmarks: Landmarks,
    pub confidence: f32,
}

/// Face descriptor produced by an embedding model.
///
/// The length is whatever the model emits; nothing here assumes a dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// Registered identity key. Positive, assigned in increasing order, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub u32);

impl IdentityId {
    /// Id handed out by an empty registry.
    pub const FIRST: IdentityId = IdentityId(1);

    /// Following id, or `None` once the id space is exhausted.
    pub fn next(self) -> Option<IdentityId> {
        self.0.checked_add(1).map(IdentityId)
    }

    /// Ids start at 1; zero is never assigned.
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Best registered identity for a query descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMatch {
    pub id: IdentityId,
    pub name: String,
    pub distance: f32,
}
