//! CPU allocation policy.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::state::CheckpointError;
use crate::topology::take_by_topology;
use crate::topology::CpuSet;
use crate::topology::CpuTopology;
use crate::topology::TopologyError;

pub mod static_policy;

pub use static_policy::AllocationRequest;
pub use static_policy::StaticPolicy;

pub const POLICY_NAME_STATIC: &str = "static";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to pack cpus: {0}")]
    Packing(#[from] TopologyError),

    #[error("failed to persist state: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unknown cpu policy `{0}`")]
    UnknownMode(String),
}

pub type Result<T> = std::result::Result<T, PolicyError>;

/// Per-pod CPU policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Runs on the shared pool.
    #[default]
    None,
    /// CPUs are removed from the shared pool.
    Exclusive,
    /// Pinned to the shared CPUs of the scheduled NUMA nodes.
    Numa,
    /// Dedicated CPUs that stay in the shared pool but are never handed out
    /// again.
    Immovable,
}

impl PolicyMode {
    pub const ALL: [PolicyMode; 4] = [
        PolicyMode::None,
        PolicyMode::Exclusive,
        PolicyMode::Numa,
        PolicyMode::Immovable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyMode::None => "none",
            PolicyMode::Exclusive => "exclusive",
            PolicyMode::Numa => "numa",
            PolicyMode::Immovable => "immovable",
        }
    }
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyMode {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        PolicyMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| PolicyError::UnknownMode(s.to_string()))
    }
}

/// Placement target on one NUMA node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub cpus: usize,
    pub num_reserved_cpus: usize,
    /// Explicit reserved CPUs; takes precedence over `num_reserved_cpus`.
    pub reserved_system_cpus: CpuSet,
}

/// NUMA node ID -> placement target, as produced by the topology scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopologyResult(BTreeMap<usize, NodeInfo>);

impl TopologyResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, numa_node_id: usize, info: NodeInfo) {
        self.0.insert(numa_node_id, info);
    }

    pub fn get(&self, numa_node_id: usize) -> Option<&NodeInfo> {
        self.0.get(&numa_node_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &NodeInfo)> + '_ {
        self.0.iter().map(|(id, info)| (*id, info))
    }

    pub fn numa_node_ids(&self) -> Vec<usize> {
        self.0.keys().copied().collect()
    }

    /// Total requested CPUs over all nodes.
    pub fn cpus(&self) -> usize {
        self.0.values().map(|info| info.cpus).sum()
    }

    pub fn num_reserved_cpus(&self) -> usize {
        self.0.values().map(|info| info.num_reserved_cpus).sum()
    }
}

impl FromIterator<(usize, NodeInfo)> for TopologyResult {
    fn from_iter<T: IntoIterator<Item = (usize, NodeInfo)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Builds the node-wide reserved CPU set.
///
/// An explicit reserved set on a node entry is used as is. Otherwise
/// `num_reserved_cpus` are packed out of that node's CPUs.
pub fn build_reserved_cpu_set(
    topology: &CpuTopology,
    node_result: &TopologyResult,
) -> Result<CpuSet> {
    let mut reserved = CpuSet::new();
    for (numa_node_id, info) in node_result.iter() {
        if !info.reserved_system_cpus.is_empty() {
            reserved = reserved.union(&info.reserved_system_cpus);
            continue;
        }
        let node_cpus = topology.cpus_in_numa_nodes(&[numa_node_id]);
        let taken = take_by_topology(topology, &node_cpus, info.num_reserved_cpus)?;
        reserved = reserved.union(&taken);
    }
    Ok(reserved)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::topology::uniform_topology;

    #[test]
    fn policy_mode_parses_known_values() {
        for mode in PolicyMode::ALL {
            assert_eq!(mode.as_str().parse::<PolicyMode>().expect("parse"), mode);
        }
        assert!("shared".parse::<PolicyMode>().is_err());
    }

    #[test]
    fn reserved_set_packs_per_node_count() {
        let topo = uniform_topology(2, 1, 2, 2);
        let result: TopologyResult = [
            (
                0,
                NodeInfo {
                    cpus: 4,
                    num_reserved_cpus: 2,
                    ..Default::default()
                },
            ),
            (
                1,
                NodeInfo {
                    cpus: 4,
                    num_reserved_cpus: 1,
                    ..Default::default()
                },
            ),
        ]
        .into_iter()
        .collect();

        let reserved = build_reserved_cpu_set(&topo, &result).expect("reserved");
        assert_eq!(reserved, CpuSet::from([0, 1, 4]));
    }

    #[test]
    fn explicit_reserved_cpus_win_over_count() {
        let topo = uniform_topology(1, 1, 2, 2);
        let result: TopologyResult = [(
            0,
            NodeInfo {
                cpus: 4,
                num_reserved_cpus: 2,
                reserved_system_cpus: CpuSet::from([3]),
            },
        )]
        .into_iter()
        .collect();

        let reserved = build_reserved_cpu_set(&topo, &result).expect("reserved");
        assert_eq!(reserved, CpuSet::from([3]));
    }

    #[test]
    fn reserving_more_than_node_has_fails() {
        let topo = uniform_topology(1, 1, 1, 2);
        let result: TopologyResult = [(
            0,
            NodeInfo {
                cpus: 2,
                num_reserved_cpus: 3,
                ..Default::default()
            },
        )]
        .into_iter()
        .collect();

        assert!(matches!(
            build_reserved_cpu_set(&topo, &result),
            Err(PolicyError::Packing(_))
        ));
    }
}
