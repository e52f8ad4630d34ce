//! Optional multiclass classifier over registered descriptors, cached on disk.

use crate::store::IdentityStore;
use crate::types::{Descriptor, IdentityId};
use ndarray::{Array1, Array2, Axis};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("no registered descriptors to train on")]
    EmptyTrainingSet,
    #[error("{features} feature rows but {labels} labels")]
    LabelCountMismatch { features: usize, labels: usize },
    #[error("descriptor {index} has {actual} values, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("classifier cache {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("classifier cache {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("classifier cache {path}: model fields are inconsistent")]
    Inconsistent { path: PathBuf },
}

/// Predicts the identity a descriptor belongs to.
pub trait Classifier {
    fn predict(&self, descriptor: &Descriptor) -> Option<IdentityId>;

    /// Whether a deserialized model is internally coherent enough to use.
    fn is_consistent(&self) -> bool {
        true
    }
}

/// Fits a [`Classifier`] from flattened (descriptor, identity) rows.
pub trait ClassifierTrainer {
    type Model: Classifier + Serialize + DeserializeOwned;

    fn fit(&self, features: &[Descriptor], labels: &[IdentityId])
        -> Result<Self::Model, ClassifierError>;
}

/// Loads a trained classifier from `path`, or trains and writes one.
#[derive(Debug, Clone)]
pub struct ClassifierCache {
    path: PathBuf,
}

impl ClassifierCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached model if it loads; otherwise train on `store` and overwrite the cache.
    pub fn get_or_train<T: ClassifierTrainer>(
        &self,
        store: &IdentityStore,
        trainer: &T,
    ) -> Result<T::Model, ClassifierError> {
        match self.load::<T::Model>() {
            Ok(model) => {
                tracing::debug!(path = %self.path.display(), "classifier loaded from cache");
                return Ok(model);
            }
            Err(err) => tracing::info!(error = %err, "classifier cache unusable; training"),
        }

        let (features, labels) = store.flatten();
        let model = trainer.fit(&features, &labels)?;
        self.save(&model)?;
        tracing::info!(
            rows = features.len(),
            path = %self.path.display(),
            "classifier trained and cached"
        );
        Ok(model)
    }

    /// Drop the cached model so the next call retrains.
    pub fn invalidate(&self) -> Result<(), ClassifierError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ClassifierError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn load<M: Classifier + DeserializeOwned>(&self) -> Result<M, ClassifierError> {
        let bytes = std::fs::read(&self.path).map_err(|source| ClassifierError::Io {
            path: self.path.clone(),
            source,
        })?;
        let model: M = serde_json::from_slice(&bytes).map_err(|source| ClassifierError::Encode {
            path: self.path.clone(),
            source,
        })?;
        if !model.is_consistent() {
            return Err(ClassifierError::Inconsistent {
                path: self.path.clone(),
            });
        }
        Ok(model)
    }

    fn save<M: Serialize>(&self, model: &M) -> Result<(), ClassifierError> {
        let io_err = |source: std::io::Error| ClassifierError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let bytes = serde_json::to_vec(model).map_err(|source| ClassifierError::Encode {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, bytes).map_err(io_err)
    }
}

/// Multinomial logistic regression trained by batch gradient descent on
/// standardized features.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftmaxTrainer {
    pub epochs: usize,
    pub learning_rate: f32,
    pub l2: f32,
}

impl Default for SoftmaxTrainer {
    fn default() -> Self {
        Self {
            epochs: 300,
            learning_rate: 0.5,
            l2: 1e-3,
        }
    }
}

/// Trained softmax model. Weights are `classes × dim`, row-major.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftmaxClassifier {
    classes: Vec<IdentityId>,
    dim: usize,
    mean: Vec<f32>,
    scale: Vec<f32>,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl SoftmaxClassifier {
    pub fn classes(&self) -> &[IdentityId] {
        &self.classes
    }

    /// Class probabilities in [`classes`](Self::classes) order.
    pub fn probabilities(&self, descriptor: &Descriptor) -> Option<Vec<f32>> {
        if descriptor.len() != self.dim {
            return None;
        }
        let logits = (0..self.classes.len())
            .map(|k| {
                let row = self.weights.get(k * self.dim..(k + 1) * self.dim)?;
                let bias = self.bias.get(k)?;
                let dot: f32 = descriptor
                    .as_slice()
                    .iter()
                    .zip(&self.mean)
                    .zip(&self.scale)
                    .zip(row)
                    .map(|(((v, m), s), w)| (v - m) / s * w)
                    .sum();
                Some(dot + bias)
            })
            .collect::<Option<Vec<f32>>>()?;
        Some(softmax(&logits))
    }
}

impl Classifier for SoftmaxClassifier {
    fn predict(&self, descriptor: &Descriptor) -> Option<IdentityId> {
        let probs = self.probabilities(descriptor)?;
        probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .and_then(|(k, _)| self.classes.get(k).copied())
    }

    fn is_consistent(&self) -> bool {
        !self.classes.is_empty()
            && self.weights.len() == self.classes.len() * self.dim
            && self.bias.len() == self.classes.len()
            && self.mean.len() == self.dim
            && self.scale.len() == self.dim
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

impl ClassifierTrainer for SoftmaxTrainer {
    type Model = SoftmaxClassifier;

    fn fit(
        &self,
        features: &[Descriptor],
        labels: &[IdentityId],
    ) -> Result<SoftmaxClassifier, ClassifierError> {
        if features.len() != labels.len() {
            return Err(ClassifierError::LabelCountMismatch {
                features: features.len(),
                labels: labels.len(),
            });
        }
        let Some(first) = features.first() else {
            return Err(ClassifierError::EmptyTrainingSet);
        };
        let dim = first.len();
        if let Some((index, bad)) = features.iter().enumerate().find(|(_, f)| f.len() != dim) {
            return Err(ClassifierError::DimensionMismatch {
                index,
                expected: dim,
                actual: bad.len(),
            });
        }

        let mut classes = labels.to_vec();
        classes.sort();
        classes.dedup();

        let n = features.len();
        let x = Array2::from_shape_fn((n, dim), |(i, j)| features[i].values[j]);
        let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(dim));
        let scale = x.std_axis(Axis(0), 0.0).mapv(|s| if s > 1e-6 { s } else { 1.0 });
        let xs = (&x - &mean) / &scale;

        let mut y = Array2::<f32>::zeros((n, classes.len()));
        for (i, label) in labels.iter().enumerate() {
            if let Ok(k) = classes.binary_search(label) {
                y[[i, k]] = 1.0;
            }
        }

        let mut w = Array2::<f32>::zeros((dim, classes.len()));
        let mut b = Array1::<f32>::zeros(classes.len());
        for _ in 0..self.epochs {
            let mut p = xs.dot(&w) + &b;
            for mut row in p.rows_mut() {
                let probs = softmax(row.as_slice().unwrap_or(&[]));
                row.iter_mut().zip(probs).for_each(|(v, pr)| *v = pr);
            }
            let grad = (p - &y) / n as f32;
            let dw = xs.t().dot(&grad) + &w * self.l2;
            let db = grad.sum_axis(Axis(0));
            w = w - dw * self.learning_rate;
            b = b - db * self.learning_rate;
        }

        Ok(SoftmaxClassifier {
            classes,
            dim,
            mean: mean.to_vec(),
            scale: scale.to_vec(),
            weights: w.t().iter().copied().collect(),
            bias: b.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CorruptStorePolicy;

    fn d(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec())
    }

    fn two_cluster_store(dir: &Path) -> IdentityStore {
        let mut store = IdentityStore::open_in_dir(dir, CorruptStorePolicy::Fail).unwrap();
        let alice = store.lookup_or_create("Alice").unwrap();
        let bob = store.lookup_or_create("Bob").unwrap();
        for v in [d(&[1.0, 1.0]), d(&[1.2, 0.9]), d(&[0.8, 1.1])] {
            store.append_descriptor(alice, v);
        }
        for v in [d(&[-1.0, -1.0]), d(&[-0.9, -1.2])] {
            store.append_descriptor(bob, v);
        }
        store
    }

    #[test]
    fn test_separates_two_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let store = two_cluster_store(dir.path());
        let (features, labels) = store.flatten();
        let model = SoftmaxTrainer::default().fit(&features, &labels).unwrap();

        assert_eq!(model.predict(&d(&[1.1, 1.0])), Some(IdentityId(1)));
        assert_eq!(model.predict(&d(&[-1.1, -0.8])), Some(IdentityId(2)));
        assert_eq!(model.predict(&d(&[1.0])), None);

        let probs = model.probabilities(&d(&[1.0, 1.0])).unwrap();
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_single_identity_single_row() {
        let model = SoftmaxTrainer::default()
            .fit(&[d(&[0.3, 0.4])], &[IdentityId(7)])
            .unwrap();
        assert_eq!(model.classes(), &[IdentityId(7)]);
        assert_eq!(model.predict(&d(&[5.0, -5.0])), Some(IdentityId(7)));
    }

    #[test]
    fn test_empty_training_set() {
        let err = SoftmaxTrainer::default().fit(&[], &[]).unwrap_err();
        assert!(matches!(err, ClassifierError::EmptyTrainingSet));
    }

    #[test]
    fn test_cache_trains_once_then_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = two_cluster_store(dir.path());
        let cache = ClassifierCache::new(dir.path().join("cache").join("classifier.json"));

        let trained = cache.get_or_train(&store, &SoftmaxTrainer::default()).unwrap();
        assert!(cache.path().exists());

        // A trainer that cannot run proves the second call reads the cache.
        let no_epochs = SoftmaxTrainer {
            epochs: 0,
            ..SoftmaxTrainer::default()
        };
        let cached = cache.get_or_train(&store, &no_epochs).unwrap();
        assert_eq!(cached.weights, trained.weights);
    }

    #[test]
    fn test_inconsistent_cache_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let store = two_cluster_store(dir.path());
        let cache = ClassifierCache::new(dir.path().join("classifier.json"));
        std::fs::write(
            cache.path(),
            br#"{"classes":[1,2],"dim":2,"mean":[0,0],"scale":[1,1],"weights":[0.1],"bias":[0]}"#,
        )
        .unwrap();

        let model = cache.get_or_train(&store, &SoftmaxTrainer::default()).unwrap();
        assert!(model.is_consistent());
        assert_eq!(model.predict(&d(&[1.0, 1.0])), Some(IdentityId(1)));
    }

    #[test]
    fn test_short_weights_predict_none() {
        let model = SoftmaxClassifier {
            classes: vec![IdentityId(1), IdentityId(2)],
            dim: 2,
            mean: vec![0.0; 2],
            scale: vec![1.0; 2],
            weights: vec![0.1],
            bias: vec![0.0],
        };
        assert!(!model.is_consistent());
        assert_eq!(model.predict(&d(&[1.0, 1.0])), None);
    }

    #[test]
    fn test_corrupt_cache_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let store = two_cluster_store(dir.path());
        let cache = ClassifierCache::new(dir.path().join("classifier.json"));
        std::fs::write(cache.path(), b"garbage").unwrap();

        let model = cache.get_or_train(&store, &SoftmaxTrainer::default()).unwrap();
        assert_eq!(model.classes().len(), 2);

        cache.invalidate().unwrap();
        assert!(!cache.path().exists());
        cache.invalidate().unwrap();
    }
}
