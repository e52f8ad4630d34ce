//! Detection → alignment → embedding orchestration, plus the registration and
//! identification flows built on it.

use crate::alignment::{self, AlignmentError};
use crate::capture::{CaptureError, CaptureEvent, CaptureSession, CaptureSource};
use crate::detector::{Detector, DetectorError};
use crate::distance::{DistanceError, DistanceMatcher};
use crate::recognizer::{EmbeddingModel, RecognizerError};
use crate::store::{IdentityStore, StoreError};
use crate::types::{BoundingBox, DetectedFace, Descriptor, IdentityId, IdentityMatch};
use image::RgbImage;
use ndarray::{s, Array3, Array4};
use thiserror::Error;

/// Most captures a single live registration may take.
pub const MAX_CAPTURES: usize = 5;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unsupported face size {0}: choose 160 or 224")]
    UnsupportedFaceSize(u32),
    #[error("capture count {0} out of range 1..=5")]
    InvalidCaptureCount(usize),
    #[error("embedding model returned {actual} descriptors for {expected} faces")]
    DescriptorCountMismatch { expected: usize, actual: usize },
    #[error("alignment: {0}")]
    Alignment(#[from] AlignmentError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("distance: {0}")]
    Distance(#[from] DistanceError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("capture: {0}")]
    Capture(#[from] CaptureError),
}

/// Aligned crop size, which also selects per-crop normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceSize {
    /// 160×160, z-scored per crop (FaceNet).
    Facenet160,
    /// 224×224, 0–255 crops handed to the model's own preprocessing (VGGFace).
    VggFace224,
}

impl FaceSize {
    pub fn pixels(self) -> u32 {
        match self {
            FaceSize::Facenet160 => 160,
            FaceSize::VggFace224 => 224,
        }
    }
}

impl TryFrom<u32> for FaceSize {
    type Error = PipelineError;

    fn try_from(size: u32) -> Result<Self, Self::Error> {
        match size {
            160 => Ok(FaceSize::Facenet160),
            224 => Ok(FaceSize::VggFace224),
            other => Err(PipelineError::UnsupportedFaceSize(other)),
        }
    }
}

/// Outcome of registering one image.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// Descriptor appended in memory; flush the store to keep it.
    Added { id: IdentityId, descriptor: Descriptor },
    NoFaceDetected,
}

/// Outcome of a live-capture registration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureRegistration {
    pub id: Option<IdentityId>,
    /// Descriptors appended in memory; flush the store when non-zero.
    pub added: usize,
    /// Submitted frames in which no face was found.
    pub no_face: usize,
    pub cancelled: bool,
}

/// Identification result for one detected face.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceIdentification {
    pub bbox: BoundingBox,
    /// Per stored descriptor, in [`IdentityStore::flatten`] order.
    pub matches: Vec<bool>,
    pub best: Option<IdentityMatch>,
}

/// Outcome of identifying the faces in one image.
#[derive(Debug, Clone, PartialEq)]
pub enum Identification {
    Faces(Vec<FaceIdentification>),
    NoFaceDetected,
}

/// Detector + embedding model + crop size.
pub struct RecognitionPipeline<D, M> {
    detector: D,
    model: M,
    face_size: FaceSize,
}

impl<D: Detector, M: EmbeddingModel> RecognitionPipeline<D, M> {
    /// Fails with [`PipelineError::UnsupportedFaceSize`] for anything but 160 or 224.
    pub fn new(detector: D, model: M, face_size: u32) -> Result<Self, PipelineError> {
        let face_size = FaceSize::try_from(face_size)?;
        Ok(Self {
            detector,
            model,
            face_size,
        })
    }

    pub fn face_size(&self) -> FaceSize {
        self.face_size
    }

    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, PipelineError> {
        Ok(self.detector.detect(image)?)
    }

    /// One descriptor per face, in face order.
    ///
    /// Runs the detector when `faces` is `None`. All crops go to the model in
    /// a single batch. No faces means no model call and an empty result.
    pub fn extract_descriptors(
        &mut self,
        image: &RgbImage,
        faces: Option<&[DetectedFace]>,
    ) -> Result<Vec<Descriptor>, PipelineError> {
        let detected;
        let faces = match faces {
            Some(faces) => faces,
            None => {
                detected = self.detector.detect(image)?;
                detected.as_slice()
            }
        };
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let size = self.face_size.pixels();
        let side = size as usize;
        let mut batch = Array4::<f32>::zeros((faces.len(), side, side, 3));
        for (i, face) in faces.iter().enumerate() {
            let crop = alignment::normalize_face(image, size, Some(&face.bbox), &face.landmarks)?;
            let mut gray = gray_replicated(&crop);
            if self.face_size == FaceSize::Facenet160 {
                standardize(&mut gray);
            }
            batch.slice_mut(s![i, .., .., ..]).assign(&gray);
        }
        if self.face_size == FaceSize::VggFace224 {
            self.model.preprocess_raw(&mut batch);
        }

        let descriptors = self.model.predict(batch.view())?;
        if descriptors.len() != faces.len() {
            return Err(PipelineError::DescriptorCountMismatch {
                expected: faces.len(),
                actual: descriptors.len(),
            });
        }
        tracing::debug!(faces = faces.len(), "descriptors extracted");
        Ok(descriptors)
    }

    /// Register the first face in `image` under `name`.
    ///
    /// The name is only created once a descriptor has been extracted, so a
    /// failed alignment leaves the store untouched.
    ///
    /// The name map is persisted by the store; the descriptor is only appended
    /// in memory. Call [`IdentityStore::flush_descriptors`] afterwards.
    pub fn register_image(
        &mut self,
        image: &RgbImage,
        name: &str,
        store: &mut IdentityStore,
    ) -> Result<Registration, PipelineError> {
        let faces = self.detector.detect(image)?;
        let Some(first) = faces.first() else {
            tracing::info!(name, "no face detected; nothing registered");
            return Ok(Registration::NoFaceDetected);
        };

        let descriptor = self
            .extract_descriptors(image, Some(std::slice::from_ref(first)))?
            .swap_remove(0);
        let id = store.lookup_or_create(name)?;
        store.append_descriptor(id, descriptor.clone());
        tracing::info!(%id, name, faces = faces.len(), "face registered");

        Ok(Registration::Added { id, descriptor })
    }

    /// Register up to `count` captures from a live source under `name`.
    ///
    /// Each capture opens the source and polls until the operator submits a
    /// frame, cancels, or the device closes; the device is released before the
    /// next capture starts and on every error. A submitted frame without a face
    /// ends that capture. Cancel ends the whole registration.
    pub fn register_capture<C: CaptureSource + ?Sized>(
        &mut self,
        source: &mut C,
        name: &str,
        count: usize,
        store: &mut IdentityStore,
    ) -> Result<CaptureRegistration, PipelineError> {
        if !(1..=MAX_CAPTURES).contains(&count) {
            return Err(PipelineError::InvalidCaptureCount(count));
        }

        let mut outcome = CaptureRegistration::default();
        for attempt in 1..=count {
            let mut session = CaptureSession::open(&mut *source)?;
            loop {
                match session.poll()? {
                    CaptureEvent::Preview => continue,
                    CaptureEvent::Submit(frame) => {
                        match self.register_image(&frame, name, store)? {
                            Registration::Added { id, .. } => {
                                outcome.id = Some(id);
                                outcome.added += 1;
                            }
                            Registration::NoFaceDetected => {
                                tracing::info!(attempt, "no face in submitted frame");
                                outcome.no_face += 1;
                            }
                        }
                        break;
                    }
                    CaptureEvent::Cancel => {
                        outcome.cancelled = true;
                        break;
                    }
                    CaptureEvent::Closed => {
                        tracing::warn!(attempt, "capture device closed");
                        break;
                    }
                }
            }
            drop(session);

            if outcome.cancelled {
                tracing::info!(name, added = outcome.added, "capture registration cancelled");
                break;
            }
        }

        Ok(outcome)
    }

    /// Match every face in `image` against the registry.
    pub fn identify(
        &mut self,
        image: &RgbImage,
        store: &IdentityStore,
        matcher: &DistanceMatcher,
    ) -> Result<Identification, PipelineError> {
        let faces = self.detector.detect(image)?;
        if faces.is_empty() {
            tracing::info!("no face detected; nothing to match");
            return Ok(Identification::NoFaceDetected);
        }

        let descriptors = self.extract_descriptors(image, Some(faces.as_slice()))?;
        let (gallery, labels) = store.flatten();

        let mut results = Vec::with_capacity(faces.len());
        for (face, descriptor) in faces.iter().zip(&descriptors) {
            let matches = matcher.matches(descriptor, &gallery)?;
            let best = matcher.best_match(descriptor, &gallery, &labels, |id| store.name_of(id))?;
            tracing::debug!(best = ?best.as_ref().map(|m| m.id), "face identified");
            results.push(FaceIdentification {
                bbox: face.bbox,
                matches,
                best,
            });
        }

        Ok(Identification::Faces(results))
    }
}

/// BT.601 luma of each pixel, replicated into three channels, as `(H, W, 3)`.
fn gray_replicated(crop: &RgbImage) -> Array3<f32> {
    let (w, h) = crop.dimensions();
    let mut out = Array3::<f32>::zeros((h as usize, w as usize, 3));
    for (x, y, p) in crop.enumerate_pixels() {
        let luma = (0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32).round();
        out.slice_mut(s![y as usize, x as usize, ..]).fill(luma);
    }
    out
}

/// Subtract the crop mean and divide by its standard deviation.
/// A flat crop is only centred.
fn standardize(crop: &mut Array3<f32>) {
    let mean = crop.mean().unwrap_or(0.0);
    let std = crop.std(0.0);
    if std > f32::EPSILON {
        crop.mapv_inplace(|v| (v - mean) / std);
    } else {
        crop.mapv_inplace(|v| v - mean);
    }
}
