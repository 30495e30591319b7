//! CPU allocation state.
//!
//! Holds the per-container CPU assignments and the default (shared) CPU set.
//! [`MemoryState`] keeps everything in memory; [`CheckpointState`] adds a
//! durable write of the whole state after every mutation.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::topology::CpuSet;

pub mod checkpoint;

pub use checkpoint::CheckpointError;
pub use checkpoint::CheckpointState;
pub use checkpoint::CheckpointStore;

/// pod UID -> container name -> CPU set.
pub type ContainerCpuAssignments = BTreeMap<String, BTreeMap<String, CpuSet>>;

/// Plain snapshot of the allocation state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationState {
    pub assignments: ContainerCpuAssignments,
    pub default_cpu_set: CpuSet,
}

impl AllocationState {
    pub fn cpu_set(&self, pod_uid: &str, container_name: &str) -> Option<&CpuSet> {
        self.assignments.get(pod_uid)?.get(container_name)
    }

    pub fn set_cpu_set(&mut self, pod_uid: &str, container_name: &str, cpus: CpuSet) {
        self.assignments
            .entry(pod_uid.to_string())
            .or_default()
            .insert(container_name.to_string(), cpus);
    }

    /// Removes one container entry, dropping the pod entry with its last
    /// container. Returns whether anything was removed.
    pub fn delete(&mut self, pod_uid: &str, container_name: &str) -> bool {
        let Some(containers) = self.assignments.get_mut(pod_uid) else {
            return false;
        };
        let removed = containers.remove(container_name).is_some();
        if containers.is_empty() {
            self.assignments.remove(pod_uid);
        }
        removed
    }

    /// Every CPU set held by some container.
    pub fn assigned_cpu_sets(&self) -> impl Iterator<Item = &CpuSet> + '_ {
        self.assignments.values().flat_map(|containers| containers.values())
    }
}

/// Read and write access to allocation state.
///
/// Mutations return an error only when the backing store cannot persist the
/// change. The in-memory view changes only once the change is persisted, so
/// a failed mutation leaves the state as it was.
pub trait State: Send {
    fn snapshot(&self) -> &AllocationState;

    /// Replaces the whole state in one write.
    fn commit(&mut self, next: AllocationState) -> Result<(), CheckpointError>;

    fn set_cpu_set(
        &mut self,
        pod_uid: &str,
        container_name: &str,
        cpus: CpuSet,
    ) -> Result<(), CheckpointError>;

    fn set_default_cpu_set(&mut self, cpus: CpuSet) -> Result<(), CheckpointError>;

    fn delete(&mut self, pod_uid: &str, container_name: &str) -> Result<(), CheckpointError>;

    fn clear(&mut self) -> Result<(), CheckpointError>;

    fn cpu_set(&self, pod_uid: &str, container_name: &str) -> Option<CpuSet> {
        self.snapshot().cpu_set(pod_uid, container_name).cloned()
    }

    fn default_cpu_set(&self) -> CpuSet {
        self.snapshot().default_cpu_set.clone()
    }

    fn cpu_set_or_default(&self, pod_uid: &str, container_name: &str) -> CpuSet {
        self.cpu_set(pod_uid, container_name)
            .unwrap_or_else(|| self.default_cpu_set())
    }

    fn assignments(&self) -> ContainerCpuAssignments {
        self.snapshot().assignments.clone()
    }
}

#[derive(Debug, Default)]
pub struct MemoryState {
    inner: AllocationState,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl State for MemoryState {
    fn snapshot(&self) -> &AllocationState {
        &self.inner
    }

    fn commit(&mut self, next: AllocationState) -> Result<(), CheckpointError> {
        self.inner = next;
        Ok(())
    }

    fn set_cpu_set(
        &mut self,
        pod_uid: &str,
        container_name: &str,
        cpus: CpuSet,
    ) -> Result<(), CheckpointError> {
        self.inner.set_cpu_set(pod_uid, container_name, cpus);
        Ok(())
    }

    fn set_default_cpu_set(&mut self, cpus: CpuSet) -> Result<(), CheckpointError> {
        self.inner.default_cpu_set = cpus;
        Ok(())
    }

    fn delete(&mut self, pod_uid: &str, container_name: &str) -> Result<(), CheckpointError> {
        self.inner.delete(pod_uid, container_name);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), CheckpointError> {
        self.inner = AllocationState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn deleting_last_container_drops_pod_entry() {
        let mut state = MemoryState::new();
        state
            .set_cpu_set("pod-1", "app", CpuSet::from([0, 1]))
            .expect("set");
        state
            .set_cpu_set("pod-1", "sidecar", CpuSet::from([2]))
            .expect("set");

        state.delete("pod-1", "app").expect("delete");
        assert_eq!(state.assignments().len(), 1);

        state.delete("pod-1", "sidecar").expect("delete");
        assert!(state.assignments().is_empty());
    }

    #[test]
    fn falls_back_to_default_cpu_set() {
        let mut state = MemoryState::new();
        state
            .set_default_cpu_set(CpuSet::from([0, 1, 2, 3]))
            .expect("set default");
        state
            .set_cpu_set("pod-1", "app", CpuSet::from([2, 3]))
            .expect("set");

        assert_eq!(
            state.cpu_set_or_default("pod-1", "app"),
            CpuSet::from([2, 3])
        );
        assert_eq!(
            state.cpu_set_or_default("pod-2", "app"),
            CpuSet::from([0, 1, 2, 3])
        );
    }

    #[test]
    fn deleting_unknown_entry_is_noop() {
        let mut state = MemoryState::new();
        state.delete("missing", "app").expect("delete");
        assert_eq!(state.snapshot(), &AllocationState::default());
    }
}
