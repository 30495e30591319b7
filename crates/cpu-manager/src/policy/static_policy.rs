//! Static CPU policy.
//!
//! Containers either run on the shared pool (the default CPU set) or get a
//! dedicated CPU set computed from the topology scheduler's result for their
//! pod. Every mutation goes through [`State`], which persists it.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use tracing::error;
use tracing::info;

use super::build_reserved_cpu_set;
use super::PolicyError;
use super::PolicyMode;
use super::Result;
use super::TopologyResult;
use super::POLICY_NAME_STATIC;
use crate::state::AllocationState;
use crate::state::State;
use crate::topology::take_by_topology;
use crate::topology::CpuSet;
use crate::topology::CpuTopology;

/// One container asking for CPUs.
#[derive(Debug, Clone)]
pub struct AllocationRequest<'a> {
    pub pod_uid: &'a str,
    pub container_name: &'a str,
    pub mode: PolicyMode,
    pub topology_result: &'a TopologyResult,
}

#[derive(Debug)]
pub struct StaticPolicy {
    topology: Arc<CpuTopology>,
    reserved: CpuSet,
    /// CPUs already committed to the pod currently being allocated, so its
    /// sibling containers land on the same CPUs.
    cpus_to_reuse: HashMap<String, CpuSet>,
}

impl StaticPolicy {
    pub fn new(topology: Arc<CpuTopology>) -> Self {
        Self {
            topology,
            reserved: CpuSet::new(),
            cpus_to_reuse: HashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        POLICY_NAME_STATIC
    }

    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    /// Computes the reserved set and validates `state` against the topology.
    ///
    /// An invalid state is cleared and validated once more; failing again is
    /// fatal.
    pub fn start(&mut self, state: &mut dyn State, node_result: &TopologyResult) -> Result<()> {
        self.reserved = build_reserved_cpu_set(&self.topology, node_result)?;
        info!(reserved = %self.reserved, "Static policy started");

        if let Err(e) = self.validate_state(state) {
            error!(error = %e, "Invalid CPU manager state, clearing it");
            state.clear()?;
            self.validate_state(state).inspect_err(|e| {
                error!(error = %e, "CPU manager state still invalid after reset");
            })?;
        }
        Ok(())
    }

    /// Assigns CPUs to one container. Idempotent.
    pub fn allocate(
        &mut self,
        state: &mut dyn State,
        request: &AllocationRequest<'_>,
        immovable_cpus: &CpuSet,
    ) -> Result<()> {
        if let Some(cpus) = state.cpu_set(request.pod_uid, request.container_name) {
            debug!(
                pod_uid = request.pod_uid,
                container = request.container_name,
                "Container already present in state, skipping"
            );
            self.update_cpus_to_reuse(request.pod_uid, &cpus);
            return Ok(());
        }

        if request.topology_result.is_empty() {
            debug!(
                pod_uid = request.pod_uid,
                container = request.container_name,
                "Empty topology result, container stays on the shared pool"
            );
            return Ok(());
        }

        let reusable = self
            .cpus_to_reuse
            .get(request.pod_uid)
            .cloned()
            .unwrap_or_default();
        // One write for the whole change; the state is untouched on failure.
        let mut next = state.snapshot().clone();
        let cpus = self.allocate_cpus(&mut next, request, &reusable, immovable_cpus)?;
        next.set_cpu_set(request.pod_uid, request.container_name, cpus.clone());
        state.commit(next)?;

        info!(
            pod_uid = request.pod_uid,
            container = request.container_name,
            mode = %request.mode,
            cpuset = %cpus,
            "Allocated CPUs"
        );
        self.update_cpus_to_reuse(request.pod_uid, &cpus);
        Ok(())
    }

    fn allocate_cpus(
        &self,
        next: &mut AllocationState,
        request: &AllocationRequest<'_>,
        reusable: &CpuSet,
        immovable_cpus: &CpuSet,
    ) -> Result<CpuSet> {
        let tr = request.topology_result;
        if !reusable.is_empty() && tr.cpus() == reusable.len() {
            return Ok(reusable.clone());
        }

        let shared = next.default_cpu_set.difference(&self.reserved);
        let allocatable = shared.difference(immovable_cpus);

        let mut result = CpuSet::new();
        match request.mode {
            PolicyMode::None => {}
            PolicyMode::Exclusive | PolicyMode::Immovable => {
                for (numa_node_id, info) in tr.iter() {
                    let node_cpus = self.topology.cpus_in_numa_nodes(&[numa_node_id]);
                    let available = allocatable.intersection(&node_cpus);
                    let taken = take_by_topology(&self.topology, &available, info.cpus)?;
                    result = result.union(&taken);
                }

                if request.mode == PolicyMode::Exclusive {
                    next.default_cpu_set = next.default_cpu_set.difference(&result);
                    for cpus in next.assignments.values_mut().flat_map(|c| c.values_mut()) {
                        if !cpus.is_disjoint(&result) {
                            *cpus = cpus.difference(&result);
                        }
                    }
                }
            }
            PolicyMode::Numa => {
                for numa_node_id in tr.numa_node_ids() {
                    let node_cpus = self.topology.cpus_in_numa_nodes(&[numa_node_id]);
                    result = result.union(&shared.intersection(&node_cpus));
                }
            }
        }
        Ok(result)
    }

    /// Releases the CPUs of one container. Idempotent.
    ///
    /// CPUs still held by sibling containers of the same pod stay assigned.
    pub fn remove_container(
        &mut self,
        state: &mut dyn State,
        pod_uid: &str,
        container_name: &str,
    ) -> Result<()> {
        let Some(to_release) = state.cpu_set(pod_uid, container_name) else {
            return Ok(());
        };
        info!(pod_uid, container = container_name, cpuset = %to_release, "Removing container");

        let in_use = assigned_cpus_of_siblings(state, pod_uid, container_name);
        let mut next = state.snapshot().clone();
        next.delete(pod_uid, container_name);
        next.default_cpu_set = next
            .default_cpu_set
            .union(&to_release.difference(&in_use));
        state.commit(next)?;
        Ok(())
    }

    /// Checks that `state` can describe this machine. An empty state is
    /// initialized with every CPU in the default set.
    pub fn validate_state(&self, state: &mut dyn State) -> Result<()> {
        let default_cpus = state.default_cpu_set();
        let all_cpus = self.topology.cpus();

        if default_cpus.is_empty() {
            if !state.snapshot().assignments.is_empty() {
                return Err(PolicyError::InvalidState(
                    "default cpuset cannot be empty while assignments exist".to_string(),
                ));
            }
            state.set_default_cpu_set(all_cpus)?;
            return Ok(());
        }

        if !self.reserved.is_subset_of(&default_cpus) {
            return Err(PolicyError::InvalidState(format!(
                "not all reserved cpus `{}` are present in the default cpuset `{default_cpus}`",
                self.reserved
            )));
        }

        let known = default_cpus.union_all(state.snapshot().assigned_cpu_sets());
        if known != all_cpus {
            return Err(PolicyError::InvalidState(format!(
                "cpus in state `{known}` do not match the machine's cpus `{all_cpus}`"
            )));
        }
        Ok(())
    }

    pub fn reserved_cpus(&self) -> &CpuSet {
        &self.reserved
    }

    /// Default set minus reserved CPUs.
    pub fn shared_cpus(&self, state: &dyn State) -> CpuSet {
        state.default_cpu_set().difference(&self.reserved)
    }

    /// Every CPU that is not in the default set.
    pub fn exclusive_cpus(&self, state: &dyn State) -> CpuSet {
        self.topology.cpus().difference(&state.default_cpu_set())
    }

    /// Shared CPUs that are not held by immovable containers.
    pub fn allocatable_cpus(&self, state: &dyn State, immovable_cpus: &CpuSet) -> CpuSet {
        self.shared_cpus(state).difference(immovable_cpus)
    }

    pub fn cpus_to_reuse(&self, pod_uid: &str) -> Option<&CpuSet> {
        self.cpus_to_reuse.get(pod_uid)
    }

    fn update_cpus_to_reuse(&mut self, pod_uid: &str, cpus: &CpuSet) {
        self.cpus_to_reuse.retain(|uid, _| uid == pod_uid);
        let entry = self.cpus_to_reuse.entry(pod_uid.to_string()).or_default();
        *entry = entry.union(cpus);
    }
}

fn assigned_cpus_of_siblings(state: &dyn State, pod_uid: &str, container_name: &str) -> CpuSet {
    state
        .snapshot()
        .assignments
        .get(pod_uid)
        .map(|containers| {
            containers
                .iter()
                .filter(|(name, _)| name.as_str() != container_name)
                .fold(CpuSet::new(), |acc, (_, cpus)| acc.union(cpus))
        })
        .unwrap_or_default()
}
