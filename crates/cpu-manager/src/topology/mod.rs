//! CPU topology model.
//!
//! Describes how logical CPUs map onto sockets, NUMA nodes and physical cores.
//! The topology is discovered once at startup (see [`discover`]) and is
//! read-only afterwards.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub mod cpuset;
pub mod discover;
pub mod packing;

pub use cpuset::CpuSet;
pub use cpuset::CpuSetError;
pub use discover::discover;
pub use packing::take_by_topology;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to read `{path}`: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse `{path}`: {message}")]
    Parse { path: String, message: String },

    #[error("no online cpus reported by the platform")]
    NoCpus,

    #[error("cpu {cpu} reported by more than one numa node")]
    DuplicateNumaCpu { cpu: usize },

    #[error("not enough cpus available: requested {requested}, available {available}")]
    NotEnoughCpus { requested: usize, available: usize },
}

/// Placement of a single logical CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuInfo {
    pub socket_id: usize,
    pub numa_node_id: usize,
    /// Lowest logical CPU ID among the hyperthreads of this physical core.
    pub core_id: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuTopology {
    details: BTreeMap<usize, CpuInfo>,
}

impl CpuTopology {
    pub fn new(details: BTreeMap<usize, CpuInfo>) -> Result<Self, TopologyError> {
        if details.is_empty() {
            return Err(TopologyError::NoCpus);
        }
        Ok(Self { details })
    }

    pub fn details(&self) -> &BTreeMap<usize, CpuInfo> {
        &self.details
    }

    pub fn cpu_info(&self, cpu: usize) -> Option<&CpuInfo> {
        self.details.get(&cpu)
    }

    pub fn num_cpus(&self) -> usize {
        self.details.len()
    }

    pub fn num_cores(&self) -> usize {
        self.core_ids().len()
    }

    pub fn num_sockets(&self) -> usize {
        self.socket_ids().len()
    }

    pub fn num_numa_nodes(&self) -> usize {
        self.numa_node_ids().len()
    }

    /// All logical CPUs of the machine.
    pub fn cpus(&self) -> CpuSet {
        self.details.keys().copied().collect()
    }

    pub fn socket_ids(&self) -> BTreeSet<usize> {
        self.details.values().map(|info| info.socket_id).collect()
    }

    pub fn numa_node_ids(&self) -> BTreeSet<usize> {
        self.details.values().map(|info| info.numa_node_id).collect()
    }

    pub fn core_ids(&self) -> BTreeSet<usize> {
        self.details.values().map(|info| info.core_id).collect()
    }

    pub fn cpus_in_numa_nodes(&self, ids: &[usize]) -> CpuSet {
        self.select(|info| ids.contains(&info.numa_node_id))
    }

    pub fn cpus_in_sockets(&self, ids: &[usize]) -> CpuSet {
        self.select(|info| ids.contains(&info.socket_id))
    }

    pub fn cpus_in_cores(&self, ids: &[usize]) -> CpuSet {
        self.select(|info| ids.contains(&info.core_id))
    }

    fn select<F>(&self, predicate: F) -> CpuSet
    where
        F: Fn(&CpuInfo) -> bool,
    {
        self.details
            .iter()
            .filter(|(_, info)| predicate(info))
            .map(|(cpu, _)| *cpu)
            .collect()
    }
}

impl fmt::Display for CpuTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpus={} cores={} sockets={} numa_nodes={}",
            self.num_cpus(),
            self.num_cores(),
            self.num_sockets(),
            self.num_numa_nodes()
        )
    }
}

/// Builds a uniform topology, used by tests across the crate.
///
/// CPUs are numbered so that the hyperthreads of a core are adjacent:
/// with two threads per core, core 0 is `{0, 1}`, core 1 is `{2, 3}`.
#[cfg(test)]
pub(crate) fn uniform_topology(
    sockets: usize,
    numa_per_socket: usize,
    cores_per_numa: usize,
    threads_per_core: usize,
) -> CpuTopology {
    let mut details = BTreeMap::new();
    let mut cpu = 0;
    for socket_id in 0..sockets {
        for numa in 0..numa_per_socket {
            let numa_node_id = socket_id * numa_per_socket + numa;
            for _ in 0..cores_per_numa {
                let core_id = cpu;
                for _ in 0..threads_per_core {
                    details.insert(
                        cpu,
                        CpuInfo {
                            socket_id,
                            numa_node_id,
                            core_id,
                        },
                    );
                    cpu += 1;
                }
            }
        }
    }
    CpuTopology::new(details).expect("non-empty topology")
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn uniform_topology_counts() {
        let topo = uniform_topology(2, 1, 2, 2);
        assert_eq!(topo.num_cpus(), 8);
        assert_eq!(topo.num_cores(), 4);
        assert_eq!(topo.num_sockets(), 2);
        assert_eq!(topo.num_numa_nodes(), 2);
        assert_eq!(topo.cpus_in_numa_nodes(&[1]), CpuSet::from([4, 5, 6, 7]));
        assert_eq!(topo.cpus_in_cores(&[2]), CpuSet::from([2, 3]));
    }

    #[test]
    fn empty_topology_is_rejected() {
        assert!(matches!(
            CpuTopology::new(BTreeMap::new()),
            Err(TopologyError::NoCpus)
        ));
    }
}
