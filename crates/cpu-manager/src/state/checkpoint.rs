//! Durable checkpointing of the allocation state.
//!
//! [`CheckpointStore`] is a tiny key/value store with one file per key in a
//! directory. Writes go to a temporary file that is fsynced and renamed over
//! the target, so a reader only ever sees a complete checkpoint.
//! [`CheckpointState`] layers the versioned, checksummed CPU manager format on
//! top of it.

use std::fs;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use tracing::info;

use super::AllocationState;
use super::ContainerCpuAssignments;
use super::State;
use crate::topology::CpuSet;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint `{0}` not found")]
    NotFound(String),

    #[error("checkpoint i/o error on `{}`: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint `{key}` is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("checkpoint `{key}` is incompatible: {reason}")]
    Incompatible { key: String, reason: String },

    #[error("invalid checkpoint key `{0}`")]
    InvalidKey(String),
}

/// File-backed key/value store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `data` under `key`; the data is on disk when this returns.
    pub fn save(&self, key: &str, data: &[u8]) -> Result<(), CheckpointError> {
        let path = self.path_of(key)?;
        let tmp_path = self.dir.join(format!(".{key}.tmp"));
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| CheckpointError::Io { path, source }
        };

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(io_err(&tmp_path))?;
            file.write_all(data).map_err(io_err(&tmp_path))?;
            file.sync_all().map_err(io_err(&tmp_path))?;
        }
        fs::rename(&tmp_path, &path).map_err(io_err(&path))?;

        // Persist the rename itself.
        if let Ok(dir) = fs::File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    pub fn load(&self, key: &str) -> Result<Vec<u8>, CheckpointError> {
        let path = self.path_of(key)?;
        fs::read(&path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => CheckpointError::NotFound(key.to_string()),
            _ => CheckpointError::Io { path, source },
        })
    }

    pub fn remove(&self, key: &str) -> Result<(), CheckpointError> {
        let path = self.path_of(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }

    pub fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut keys: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn path_of(&self, key: &str) -> Result<PathBuf, CheckpointError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(CheckpointError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }
}

/// Checksummed part of the checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointPayload {
    pub schema_version: u32,
    pub policy_name: String,
    pub default_cpu_set: CpuSet,
    #[serde(default)]
    pub entries: ContainerCpuAssignments,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    #[serde(flatten)]
    pub payload: CheckpointPayload,
    pub checksum: String,
}

impl CheckpointPayload {
    fn checksum(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(bytes)))
    }
}

impl CheckpointFile {
    pub fn encode(payload: CheckpointPayload) -> Result<Vec<u8>, serde_json::Error> {
        let checksum = payload.checksum()?;
        serde_json::to_vec_pretty(&CheckpointFile { payload, checksum })
    }

    /// Parses and verifies the checksum. Version and policy are left to the
    /// caller.
    pub fn decode(key: &str, data: &[u8]) -> Result<Self, CheckpointError> {
        let corrupt = |reason: String| CheckpointError::Corrupt {
            key: key.to_string(),
            reason,
        };
        let file: CheckpointFile =
            serde_json::from_slice(data).map_err(|e| corrupt(e.to_string()))?;
        let expected = file
            .payload
            .checksum()
            .map_err(|e| corrupt(e.to_string()))?;
        if expected != file.checksum {
            return Err(corrupt(format!(
                "checksum mismatch: stored {}, computed {expected}",
                file.checksum
            )));
        }
        Ok(file)
    }

    /// Reads a checkpoint for inspection, checksum verified.
    pub fn read(store: &CheckpointStore, key: &str) -> Result<Self, CheckpointError> {
        let data = store.load(key)?;
        Self::decode(key, &data)
    }
}

/// Allocation state that is written through to a [`CheckpointStore`].
#[derive(Debug)]
pub struct CheckpointState {
    inner: AllocationState,
    store: CheckpointStore,
    key: String,
    policy_name: String,
}

impl CheckpointState {
    /// Restores state from `key`, or starts empty when no checkpoint exists.
    ///
    /// Corrupt checkpoints and checkpoints written by another schema version
    /// or policy are rejected.
    pub fn new(
        store: CheckpointStore,
        key: impl Into<String>,
        policy_name: impl Into<String>,
    ) -> Result<Self, CheckpointError> {
        let mut state = Self {
            inner: AllocationState::default(),
            store,
            key: key.into(),
            policy_name: policy_name.into(),
        };

        match state.restore() {
            Ok(()) => {
                info!(
                    checkpoint = %state.key,
                    default_cpuset = %state.inner.default_cpu_set,
                    pods = state.inner.assignments.len(),
                    "Restored CPU manager checkpoint"
                );
            }
            Err(CheckpointError::NotFound(_)) => {
                info!(checkpoint = %state.key, "No checkpoint found, starting with empty state");
                state.store_state()?;
            }
            Err(e) => return Err(e),
        }
        Ok(state)
    }

    fn restore(&mut self) -> Result<(), CheckpointError> {
        let file = CheckpointFile::read(&self.store, &self.key)?;
        let payload = file.payload;

        if payload.schema_version != SCHEMA_VERSION {
            return Err(CheckpointError::Incompatible {
                key: self.key.clone(),
                reason: format!(
                    "schema version {} is not supported (expected {SCHEMA_VERSION})",
                    payload.schema_version
                ),
            });
        }
        if payload.policy_name != self.policy_name {
            return Err(CheckpointError::Incompatible {
                key: self.key.clone(),
                reason: format!(
                    "configured policy `{}` does not match checkpointed policy `{}`",
                    self.policy_name, payload.policy_name
                ),
            });
        }

        self.inner = AllocationState {
            assignments: payload.entries,
            default_cpu_set: payload.default_cpu_set,
        };
        Ok(())
    }

    fn store_state(&self) -> Result<(), CheckpointError> {
        self.store_allocation(&self.inner)
    }

    fn store_allocation(&self, allocation: &AllocationState) -> Result<(), CheckpointError> {
        let payload = CheckpointPayload {
            schema_version: SCHEMA_VERSION,
            policy_name: self.policy_name.clone(),
            default_cpu_set: allocation.default_cpu_set.clone(),
            entries: allocation.assignments.clone(),
        };
        let data = CheckpointFile::encode(payload).map_err(|e| CheckpointError::Corrupt {
            key: self.key.clone(),
            reason: e.to_string(),
        })?;
        self.store.save(&self.key, &data)?;
        debug!(checkpoint = %self.key, "Stored CPU manager checkpoint");
        Ok(())
    }
}

impl State for CheckpointState {
    fn snapshot(&self) -> &AllocationState {
        &self.inner
    }

    fn commit(&mut self, next: AllocationState) -> Result<(), CheckpointError> {
        self.store_allocation(&next)?;
        self.inner = next;
        Ok(())
    }

    fn set_cpu_set(
        &mut self,
        pod_uid: &str,
        container_name: &str,
        cpus: CpuSet,
    ) -> Result<(), CheckpointError> {
        let mut next = self.inner.clone();
        next.set_cpu_set(pod_uid, container_name, cpus);
        self.commit(next)
    }

    fn set_default_cpu_set(&mut self, cpus: CpuSet) -> Result<(), CheckpointError> {
        let mut next = self.inner.clone();
        next.default_cpu_set = cpus;
        self.commit(next)
    }

    fn delete(&mut self, pod_uid: &str, container_name: &str) -> Result<(), CheckpointError> {
        let mut next = self.inner.clone();
        if next.delete(pod_uid, container_name) {
            self.commit(next)?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), CheckpointError> {
        self.commit(AllocationState::default())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;

    const KEY: &str = "cpu_manager_state";

    fn store() -> (TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path()).expect("store");
        (dir, store)
    }

    #[test]
    fn store_roundtrips_and_reports_missing_keys() {
        let (_dir, store) = store();
        assert!(matches!(store.load("a"), Err(CheckpointError::NotFound(_))));

        store.save("a", b"hello").expect("save");
        assert_eq!(store.load("a").expect("load"), b"hello".to_vec());
        assert_eq!(store.list().expect("list"), vec!["a".to_string()]);

        store.remove("a").expect("remove");
        store.remove("a").expect("remove twice");
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn rejects_path_like_keys() {
        let (_dir, store) = store();
        assert!(matches!(
            store.save("../escape", b"x"),
            Err(CheckpointError::InvalidKey(_))
        ));
    }

    #[test]
    fn state_survives_restart() {
        let (_dir, store) = store();
        {
            let mut state = CheckpointState::new(store.clone(), KEY, "static").expect("new");
            state
                .set_default_cpu_set(CpuSet::from([2, 3]))
                .expect("set default");
            state
                .set_cpu_set("pod-1", "app", CpuSet::from([0, 1]))
                .expect("set");
        }

        let restored = CheckpointState::new(store, KEY, "static").expect("restore");
        assert_eq!(restored.default_cpu_set(), CpuSet::from([2, 3]));
        assert_eq!(restored.cpu_set("pod-1", "app"), Some(CpuSet::from([0, 1])));
    }

    #[test]
    fn missing_checkpoint_starts_empty_and_is_written() {
        let (_dir, store) = store();
        let state = CheckpointState::new(store.clone(), KEY, "static").expect("new");
        assert_eq!(state.snapshot(), &AllocationState::default());
        assert!(store.load(KEY).is_ok());
    }

    #[test]
    fn tampered_checkpoint_is_corrupt() {
        let (_dir, store) = store();
        {
            let mut state = CheckpointState::new(store.clone(), KEY, "static").expect("new");
            state
                .set_default_cpu_set(CpuSet::from([0, 1]))
                .expect("set default");
        }
        let raw = String::from_utf8(store.load(KEY).expect("load")).expect("utf8");
        store
            .save(KEY, raw.replace("0-1", "0-3").as_bytes())
            .expect("save");

        let err = CheckpointState::new(store, KEY, "static").expect_err("corrupt");
        assert!(matches!(err, CheckpointError::Corrupt { .. }), "got {err}");
    }

    #[test]
    fn failed_write_keeps_previous_state() {
        let (dir, store) = store();
        let mut state = CheckpointState::new(store, KEY, "static").expect("new");
        state
            .set_default_cpu_set(CpuSet::from([0, 1, 2, 3]))
            .expect("set default");
        let before = state.snapshot().clone();

        std::fs::remove_dir_all(dir.path()).expect("remove state dir");

        let mut next = before.clone();
        next.default_cpu_set = CpuSet::from([2, 3]);
        next.set_cpu_set("pod-1", "app", CpuSet::from([0, 1]));
        assert!(matches!(state.commit(next), Err(CheckpointError::Io { .. })));
        assert!(state.set_default_cpu_set(CpuSet::from([3])).is_err());
        assert!(state.set_cpu_set("pod-2", "app", CpuSet::from([3])).is_err());

        assert_eq!(state.snapshot(), &before);
    }

    #[test]
    fn garbage_checkpoint_is_corrupt() {
        let (_dir, store) = store();
        store.save(KEY, b"{not json").expect("save");
        let err = CheckpointState::new(store, KEY, "static").expect_err("corrupt");
        assert!(matches!(err, CheckpointError::Corrupt { .. }), "got {err}");
    }

    #[test]
    fn policy_mismatch_is_incompatible() {
        let (_dir, store) = store();
        CheckpointState::new(store.clone(), KEY, "none").expect("new");
        let err = CheckpointState::new(store, KEY, "static").expect_err("incompatible");
        assert!(matches!(err, CheckpointError::Incompatible { .. }), "got {err}");
    }

    #[test]
    fn unknown_schema_version_is_incompatible() {
        let (_dir, store) = store();
        let payload = CheckpointPayload {
            schema_version: SCHEMA_VERSION + 1,
            policy_name: "static".to_string(),
            default_cpu_set: CpuSet::from([0]),
            entries: ContainerCpuAssignments::new(),
        };
        store
            .save(KEY, &CheckpointFile::encode(payload).expect("encode"))
            .expect("save");

        let err = CheckpointState::new(store, KEY, "static").expect_err("incompatible");
        assert!(matches!(err, CheckpointError::Incompatible { .. }), "got {err}");
    }
}
