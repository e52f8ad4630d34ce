use anyhow::bail;
use facematch_core::distance::{Metric, DEFAULT_THRESHOLD};
use facematch_core::pipeline::FaceSize;
use facematch_core::recognizer::TensorLayout;
use facematch_core::store::{CorruptStorePolicy, DEFAULT_DESCRIPTORS_FILE, DEFAULT_NAMES_FILE};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// CLI configuration, from a TOML file or `FACEMATCH_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity name map (id → name).
    pub names_path: PathBuf,
    /// Descriptor lists (id → descriptors).
    pub descriptors_path: PathBuf,
    /// Cached classifier model.
    pub classifier_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Detector file name inside `model_dir`.
    pub detector_model: String,
    /// Embedding model file name inside `model_dir`. Defaults by face size.
    pub embedder_model: Option<String>,
    pub embedder_layout: TensorLayout,
    /// Aligned crop size: 160 (FaceNet) or 224 (VGGFace).
    pub face_size: u32,
    pub metric: Metric,
    /// Largest distance still counted as a match.
    pub threshold: f32,
    pub detector_confidence: f32,
    pub corrupt_policy: CorruptStorePolicy,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            names_path: data_dir.join(DEFAULT_NAMES_FILE),
            descriptors_path: data_dir.join(DEFAULT_DESCRIPTORS_FILE),
            classifier_path: data_dir.join("classifier.json"),
            model_dir: data_dir.join("models"),
            detector_model: "det_10g.onnx".to_string(),
            embedder_model: None,
            embedder_layout: TensorLayout::Nhwc,
            face_size: 160,
            metric: Metric::Euclidean,
            threshold: DEFAULT_THRESHOLD,
            detector_confidence: 0.5,
            corrupt_policy: CorruptStorePolicy::Fail,
        }
    }
}

impl Config {
    /// Load configuration from `FACEMATCH_*` environment variables with defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    /// Unset keys keep their defaults; a set key that does not parse is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let data_dir = lookup("FACEMATCH_DATA_DIR").map(PathBuf::from);
        let in_data = |file: &str, fallback: PathBuf| {
            data_dir.as_ref().map(|d| d.join(file)).unwrap_or(fallback)
        };
        let path = |key: &str, fallback: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(fallback);

        let config = Self {
            names_path: path(
                "FACEMATCH_NAMES_PATH",
                in_data(DEFAULT_NAMES_FILE, defaults.names_path),
            ),
            descriptors_path: path(
                "FACEMATCH_DESCRIPTORS_PATH",
                in_data(DEFAULT_DESCRIPTORS_FILE, defaults.descriptors_path),
            ),
            classifier_path: path(
                "FACEMATCH_CLASSIFIER_PATH",
                in_data("classifier.json", defaults.classifier_path),
            ),
            model_dir: path("FACEMATCH_MODEL_DIR", in_data("models", defaults.model_dir)),
            detector_model: lookup("FACEMATCH_DETECTOR_MODEL").unwrap_or(defaults.detector_model),
            embedder_model: lookup("FACEMATCH_EMBEDDER_MODEL").or(defaults.embedder_model),
            embedder_layout: match lookup("FACEMATCH_EMBEDDER_LAYOUT").as_deref() {
                None => defaults.embedder_layout,
                Some("nchw") => TensorLayout::Nchw,
                Some("nhwc") => TensorLayout::Nhwc,
                Some(other) => bail!("FACEMATCH_EMBEDDER_LAYOUT={other:?}: expected nhwc or nchw"),
            },
            face_size: parsed(&lookup, "FACEMATCH_FACE_SIZE")?.unwrap_or(defaults.face_size),
            metric: parsed(&lookup, "FACEMATCH_METRIC")?.unwrap_or(defaults.metric),
            threshold: parsed(&lookup, "FACEMATCH_THRESHOLD")?.unwrap_or(defaults.threshold),
            detector_confidence: parsed(&lookup, "FACEMATCH_DETECTOR_CONFIDENCE")?
                .unwrap_or(defaults.detector_confidence),
            corrupt_policy: match lookup("FACEMATCH_CORRUPT_POLICY").as_deref() {
                None => defaults.corrupt_policy,
                Some("recover") => CorruptStorePolicy::Recover,
                Some("fail") => CorruptStorePolicy::Fail,
                Some(other) => bail!("FACEMATCH_CORRUPT_POLICY={other:?}: expected recover or fail"),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject settings the pipeline cannot run with.
    fn validate(&self) -> anyhow::Result<()> {
        FaceSize::try_from(self.face_size)?;
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    /// Path to the embedding model; FaceNet for 160, VGGFace otherwise.
    pub fn embedder_model_path(&self) -> PathBuf {
        let file = match (&self.embedder_model, self.face_size) {
            (Some(file), _) => file.as_str(),
            (None, 160) => "facenet.onnx",
            (None, _) => "vggface.onnx",
        };
        self.model_dir.join(file)
    }
}

/// `Ok(None)` when `key` is unset.
fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => match value.parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => bail!("{key}={value:?}: {e}"),
        },
    }
}

/// `$XDG_DATA_HOME/facematch`, falling back to `~/.local/share/facematch`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facematch")
}
