//! Persistent identity registry.
//!
//! Two JSON blobs back the store: identity → display name, and identity →
//! ordered descriptors. The name blob is rewritten on every
//! [`IdentityStore::lookup_or_create`] call. The descriptor blob is written
//! only by [`IdentityStore::flush_descriptors`], so callers can batch several
//! appends into a single write.
//!
//! There is no locking. Two processes calling `lookup_or_create` for the same
//! new name can both assign an id; guard the store externally if it is shared.

use crate::types::{Descriptor, IdentityId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_NAMES_FILE: &str = "names.json";
pub const DEFAULT_DESCRIPTORS_FILE: &str = "descriptors.json";

pub type NameMap = BTreeMap<IdentityId, String>;
pub type DescriptorMap = BTreeMap<IdentityId, Vec<Descriptor>>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store file {path} is unreadable or corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("failed to write store file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode store file {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("identity id space exhausted after {last}")]
    IdsExhausted { last: IdentityId },
}

/// What to do when a store blob exists but cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptStorePolicy {
    /// Refuse to open; existing registrations stay on disk untouched.
    #[default]
    Fail,
    /// Log a warning and start over with an empty registry.
    Recover,
}

/// Identity registry backed by two JSON files.
#[derive(Debug)]
pub struct IdentityStore {
    names_path: PathBuf,
    descriptors_path: PathBuf,
    names: NameMap,
    descriptors: DescriptorMap,
}

impl IdentityStore {
    /// Load both blobs.
    ///
    /// If either file is missing, both maps start empty and both files are
    /// rewritten. If either file exists but cannot be decoded, `policy`
    /// decides between failing and the same reset.
    pub fn open(
        names_path: impl Into<PathBuf>,
        descriptors_path: impl Into<PathBuf>,
        policy: CorruptStorePolicy,
    ) -> Result<Self, StoreError> {
        let mut store = Self {
            names_path: names_path.into(),
            descriptors_path: descriptors_path.into(),
            names: NameMap::new(),
            descriptors: DescriptorMap::new(),
        };

        let names = read_blob::<NameMap>(&store.names_path)
            .and_then(|blob| check_ids(&store.names_path, blob));
        let descriptors = read_blob::<DescriptorMap>(&store.descriptors_path)
            .and_then(|blob| check_ids(&store.descriptors_path, blob));

        match (names, descriptors) {
            (Ok(Some(names)), Ok(Some(descriptors))) => {
                tracing::info!(
                    identities = names.len(),
                    descriptors = descriptors.values().map(Vec::len).sum::<usize>(),
                    path = %store.names_path.display(),
                    "identity store loaded"
                );
                store.names = names;
                store.descriptors = descriptors;
                store.warn_orphans();
            }
            (Err(err), _) | (_, Err(err)) => match policy {
                CorruptStorePolicy::Fail => return Err(err),
                CorruptStorePolicy::Recover => {
                    tracing::warn!(error = %err, "identity store corrupt; reinitializing empty");
                    store.reset()?;
                }
            },
            _ => {
                tracing::info!(
                    names = %store.names_path.display(),
                    descriptors = %store.descriptors_path.display(),
                    "no identity store found; creating empty one"
                );
                store.reset()?;
            }
        }

        Ok(store)
    }

    /// Open `names.json` and `descriptors.json` inside `dir`.
    pub fn open_in_dir(dir: &Path, policy: CorruptStorePolicy) -> Result<Self, StoreError> {
        Self::open(
            dir.join(DEFAULT_NAMES_FILE),
            dir.join(DEFAULT_DESCRIPTORS_FILE),
            policy,
        )
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        self.names.clear();
        self.descriptors.clear();
        write_blob(&self.names_path, &self.names)?;
        write_blob(&self.descriptors_path, &self.descriptors)
    }

    fn warn_orphans(&self) {
        for id in self.descriptors.keys() {
            if !self.names.contains_key(id) {
                tracing::warn!(%id, "descriptors stored for an identity with no name");
            }
        }
    }

    /// Id registered under `name`, creating one if needed.
    ///
    /// New ids are `max(existing) + 1`, or 1 for an empty store. The name map
    /// is written to disk on every call.
    pub fn lookup_or_create(&mut self, name: &str) -> Result<IdentityId, StoreError> {
        let existing = self
            .names
            .iter()
            .find(|(_, known)| known.as_str() == name)
            .map(|(&id, _)| id);

        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.next_id()?;
                self.names.insert(id, name.to_string());
                tracing::info!(%id, name, "identity created");
                id
            }
        };

        write_blob(&self.names_path, &self.names)?;
        Ok(id)
    }

    fn next_id(&self) -> Result<IdentityId, StoreError> {
        match self.names.keys().next_back() {
            None => Ok(IdentityId::FIRST),
            Some(&last) => last.next().ok_or(StoreError::IdsExhausted { last }),
        }
    }

    /// Append a descriptor to `id` in memory. Not persisted until
    /// [`flush_descriptors`](Self::flush_descriptors).
    pub fn append_descriptor(&mut self, id: IdentityId, descriptor: Descriptor) {
        let list = self.descriptors.entry(id).or_default();
        list.push(descriptor);
        tracing::debug!(%id, count = list.len(), "descriptor appended");
    }

    /// Overwrite the descriptor blob with the in-memory map.
    pub fn flush_descriptors(&self) -> Result<(), StoreError> {
        write_blob(&self.descriptors_path, &self.descriptors)?;
        tracing::info!(
            path = %self.descriptors_path.display(),
            identities = self.descriptors.len(),
            "descriptors flushed"
        );
        Ok(())
    }

    pub fn name_of(&self, id: IdentityId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    /// Descriptors registered for `id`; empty if none yet.
    pub fn descriptors_of(&self, id: IdentityId) -> &[Descriptor] {
        self.descriptors.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Registered identities in id order.
    pub fn identities(&self) -> impl Iterator<Item = (IdentityId, &str)> + '_ {
        self.names.iter().map(|(&id, name)| (id, name.as_str()))
    }

    pub fn names(&self) -> &NameMap {
        &self.names
    }

    pub fn descriptors(&self) -> &DescriptorMap {
        &self.descriptors
    }

    /// One row per stored descriptor, labelled with its identity.
    pub fn flatten(&self) -> (Vec<Descriptor>, Vec<IdentityId>) {
        let mut features = Vec::new();
        let mut labels = Vec::new();
        for (&id, list) in &self.descriptors {
            for descriptor in list {
                features.push(descriptor.clone());
                labels.push(id);
            }
        }
        (features, labels)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names_path(&self) -> &Path {
        &self.names_path
    }

    pub fn descriptors_path(&self) -> &Path {
        &self.descriptors_path
    }
}

/// `Ok(None)` if the file does not exist.
fn read_blob<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Reject a blob keyed by id 0, which is never assigned.
fn check_ids<V>(
    path: &Path,
    blob: Option<BTreeMap<IdentityId, V>>,
) -> Result<Option<BTreeMap<IdentityId, V>>, StoreError> {
    match blob {
        Some(map) if map.keys().any(|id| !id.is_valid()) => Err(StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: "identity id 0 is not a valid id".to_string(),
        }),
        other => Ok(other),
    }
}

/// Replace `path` with the JSON encoding of `value` via a temp file and rename.
fn write_blob<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    let write_err = |source: std::io::Error| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let mut file = File::create(&tmp_path).map_err(write_err)?;
    file.write_all(&bytes).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(write_err(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path, policy: CorruptStorePolicy) -> IdentityStore {
        IdentityStore::open_in_dir(dir, policy).unwrap()
    }

    #[test]
    fn test_empty_store_creates_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), CorruptStorePolicy::Fail);
        assert!(store.is_empty());
        assert!(dir.path().join(DEFAULT_NAMES_FILE).exists());
        assert!(dir.path().join(DEFAULT_DESCRIPTORS_FILE).exists());
    }

    #[test]
    fn test_lookup_or_create_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path(), CorruptStorePolicy::Fail);

        let alice = store.lookup_or_create("Alice").unwrap();
        assert_eq!(alice, IdentityId(1));
        assert_eq!(store.lookup_or_create("Alice").unwrap(), alice);

        let bob = store.lookup_or_create("Bob").unwrap();
        assert_eq!(bob, IdentityId(2));
        assert_eq!(store.len(), 2);
        assert_eq!(store.name_of(bob), Some("Bob"));
    }

    #[test]
    fn test_next_id_follows_max_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let names: NameMap = [(IdentityId(4), "Dana".to_string())].into();
        write_blob(&dir.path().join(DEFAULT_NAMES_FILE), &names).unwrap();
        write_blob(&dir.path().join(DEFAULT_DESCRIPTORS_FILE), &DescriptorMap::new()).unwrap();

        let mut store = open(dir.path(), CorruptStorePolicy::Fail);
        assert_eq!(store.lookup_or_create("Eve").unwrap(), IdentityId(5));
    }

    #[test]
    fn test_name_map_persisted_immediately() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open(dir.path(), CorruptStorePolicy::Fail);
            store.lookup_or_create("Alice").unwrap();
        }
        let store = open(dir.path(), CorruptStorePolicy::Fail);
        assert_eq!(store.name_of(IdentityId(1)), Some("Alice"));
    }

    #[test]
    fn test_append_without_flush_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open(dir.path(), CorruptStorePolicy::Fail);
            let id = store.lookup_or_create("Alice").unwrap();
            store.append_descriptor(id, Descriptor::new(vec![0.1, 0.2]));
            assert_eq!(store.descriptors_of(id).len(), 1);
        }
        let store = open(dir.path(), CorruptStorePolicy::Fail);
        assert!(store.descriptors_of(IdentityId(1)).is_empty());
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path(), CorruptStorePolicy::Fail);
        let alice = store.lookup_or_create("Alice").unwrap();
        let bob = store.lookup_or_create("Bob").unwrap();
        store.append_descriptor(alice, Descriptor::new(vec![0.1, 0.2]));
        store.append_descriptor(bob, Descriptor::new(vec![0.9, 0.8]));
        store.append_descriptor(bob, Descriptor::new(vec![0.85, 0.75]));
        store.flush_descriptors().unwrap();

        let reloaded = open(dir.path(), CorruptStorePolicy::Fail);
        assert_eq!(reloaded.names(), store.names());
        assert_eq!(reloaded.descriptors(), store.descriptors());
        assert_eq!(
            reloaded.descriptors_of(bob),
            &[Descriptor::new(vec![0.9, 0.8]), Descriptor::new(vec![0.85, 0.75])]
        );
    }

    #[test]
    fn test_missing_descriptor_file_resets_both() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open(dir.path(), CorruptStorePolicy::Fail);
            store.lookup_or_create("Alice").unwrap();
        }
        std::fs::remove_file(dir.path().join(DEFAULT_DESCRIPTORS_FILE)).unwrap();

        let store = open(dir.path(), CorruptStorePolicy::Fail);
        assert!(store.is_empty());
        let on_disk = std::fs::read_to_string(dir.path().join(DEFAULT_NAMES_FILE)).unwrap();
        assert_eq!(on_disk.trim(), "{}");
        assert!(dir.path().join(DEFAULT_DESCRIPTORS_FILE).exists());
    }

    #[test]
    fn test_corrupt_store_fails_by_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_NAMES_FILE), b"{\"1\": \"Alice\"}").unwrap();
        std::fs::write(dir.path().join(DEFAULT_DESCRIPTORS_FILE), b"not json").unwrap();

        let err = IdentityStore::open_in_dir(dir.path(), CorruptStorePolicy::Fail).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "{err}");
        // Nothing was overwritten.
        let names = std::fs::read_to_string(dir.path().join(DEFAULT_NAMES_FILE)).unwrap();
        assert!(names.contains("Alice"));
    }

    #[test]
    fn test_corrupt_store_recovers_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_NAMES_FILE), b"[[[").unwrap();
        std::fs::write(dir.path().join(DEFAULT_DESCRIPTORS_FILE), b"{}").unwrap();

        let mut store = open(dir.path(), CorruptStorePolicy::Recover);
        assert!(store.is_empty());
        assert_eq!(store.lookup_or_create("Alice").unwrap(), IdentityId(1));
    }

    #[test]
    fn test_exhausted_id_space_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_NAMES_FILE), b"{\"4294967295\": \"Max\"}").unwrap();
        std::fs::write(dir.path().join(DEFAULT_DESCRIPTORS_FILE), b"{}").unwrap();

        let mut store = open(dir.path(), CorruptStorePolicy::Fail);
        assert_eq!(store.lookup_or_create("Max").unwrap(), IdentityId(u32::MAX));
        let err = store.lookup_or_create("New").unwrap_err();
        assert!(matches!(err, StoreError::IdsExhausted { last: IdentityId(u32::MAX) }), "{err}");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_zero_id_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_NAMES_FILE), b"{\"0\": \"Zero\"}").unwrap();
        std::fs::write(dir.path().join(DEFAULT_DESCRIPTORS_FILE), b"{}").unwrap();

        let err = IdentityStore::open_in_dir(dir.path(), CorruptStorePolicy::Fail).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "{err}");

        let mut store = open(dir.path(), CorruptStorePolicy::Recover);
        assert!(store.is_empty());
        assert_eq!(store.lookup_or_create("Zero").unwrap(), IdentityId::FIRST);
    }

    #[test]
    fn test_zero_id_in_descriptor_blob_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_NAMES_FILE), b"{\"1\": \"Ann\"}").unwrap();
        std::fs::write(dir.path().join(DEFAULT_DESCRIPTORS_FILE), b"{\"0\": [[0.5]]}").unwrap();

        let err = IdentityStore::open_in_dir(dir.path(), CorruptStorePolicy::Fail).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "{err}");
    }

    #[test]
    fn test_flatten_emits_one_row_per_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path(), CorruptStorePolicy::Fail);
        let one = store.lookup_or_create("Solo").unwrap();
        let three = store.lookup_or_create("Trio").unwrap();
        store.append_descriptor(one, Descriptor::new(vec![1.0]));
        for v in [2.0, 3.0, 4.0] {
            store.append_descriptor(three, Descriptor::new(vec![v]));
        }

        let (features, labels) = store.flatten();
        assert_eq!(features.len(), 4);
        assert_eq!(labels, vec![one, three, three, three]);
        assert_eq!(features[3], Descriptor::new(vec![4.0]));
    }
}
