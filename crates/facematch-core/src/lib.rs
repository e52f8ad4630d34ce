//! facematch-core: face registration and identification engine.
//!
//! Faces are found by a [`Detector`], aligned on the eye line by
//! [`alignment::normalize_face`], and turned into descriptors by an
//! [`EmbeddingModel`]. Descriptors are grouped per identity in an
//! [`IdentityStore`] and compared with a [`DistanceMatcher`].

pub mod alignment;
pub mod capture;
pub mod classifier;
pub mod detector;
pub mod distance;
pub mod pipeline;
pub mod recognizer;
pub mod store;
pub mod types;

pub use capture::{CaptureEvent, CaptureSource};
pub use classifier::{Classifier, ClassifierCache, ClassifierTrainer, SoftmaxTrainer};
pub use detector::{Detector, ScrfdDetector};
pub use distance::{DistanceMatcher, Metric, DEFAULT_THRESHOLD};
pub use pipeline::{FaceSize, Identification, RecognitionPipeline, Registration};
pub use recognizer::{EmbeddingModel, OnnxEmbedder, TensorLayout};
pub use store::{CorruptStorePolicy, IdentityStore};
pub use types::{BoundingBox, Descriptor, DetectedFace, IdentityId, IdentityMatch, Landmarks};
