//! Descriptor extraction: the [`EmbeddingModel`] seam and an ONNX Runtime backend.

use crate::types::Descriptor;
use ndarray::{Array4, ArrayView4, Axis};
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Per-channel means (B, G, R) subtracted by Caffe-style ImageNet preprocessing.
const CAFFE_BGR_MEAN: [f32; 3] = [103.939, 116.779, 123.68];

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a batch of aligned face crops to descriptors.
///
/// The batch is `(N, H, W, 3)`; the result has N descriptors in batch order.
pub trait EmbeddingModel {
    fn predict(&mut self, batch: ArrayView4<'_, f32>) -> Result<Vec<Descriptor>, RecognizerError>;

    /// Model-specific scaling for crops still in the 0–255 range.
    ///
    /// Defaults to Caffe-style ImageNet preprocessing: RGB → BGR, then
    /// per-channel mean subtraction.
    fn preprocess_raw(&self, batch: &mut Array4<f32>) {
        caffe_preprocess(batch);
    }
}

/// RGB → BGR and subtract the ImageNet channel means, in place.
pub fn caffe_preprocess(batch: &mut Array4<f32>) {
    for mut px in batch.lanes_mut(Axis(3)) {
        let (r, g, b) = (px[0], px[1], px[2]);
        px[0] = b - CAFFE_BGR_MEAN[0];
        px[1] = g - CAFFE_BGR_MEAN[1];
        px[2] = r - CAFFE_BGR_MEAN[2];
    }
}

/// Memory layout the ONNX graph expects on its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// Channels last; Keras exports.
    #[default]
    Nhwc,
    /// Channels first; PyTorch exports.
    Nchw,
}

/// Embedding network loaded from an ONNX file (FaceNet, VGGFace, ...).
pub struct OnnxEmbedder {
    session: Session,
    layout: TensorLayout,
}

impl OnnxEmbedder {
    pub fn load(model_path: &Path, layout: TensorLayout) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            ?layout,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session, layout })
    }
}

impl EmbeddingModel for OnnxEmbedder {
    fn predict(&mut self, batch: ArrayView4<'_, f32>) -> Result<Vec<Descriptor>, RecognizerError> {
        let count = batch.len_of(Axis(0));
        if count == 0 {
            return Ok(Vec::new());
        }

        let permuted;
        let input = match self.layout {
            TensorLayout::Nhwc => batch.as_standard_layout(),
            TensorLayout::Nchw => {
                permuted = batch.permuted_axes([0, 3, 1, 2]);
                permuted.as_standard_layout()
            }
        };
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        split_rows(raw, count)
    }
}

/// Split a flat `(count, dim)` output into descriptors.
fn split_rows(raw: &[f32], count: usize) -> Result<Vec<Descriptor>, RecognizerError> {
    if raw.is_empty() || raw.len() % count != 0 {
        return Err(RecognizerError::InferenceFailed(format!(
            "output of {} values cannot be split into {count} descriptors",
            raw.len()
        )));
    }
    let dim = raw.len() / count;
    Ok(raw
        .chunks_exact(dim)
        .map(|row| Descriptor::new(row.to_vec()))
        .collect())
}
