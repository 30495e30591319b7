//! Topology-aware selection of CPUs.
//!
//! Whole sockets and NUMA nodes are taken first, then whole physical cores,
//! then single hyperthreads, preferring hyperthreads of partially used cores.
//! Cores and hyperthreads come from the NUMA node with the fewest free CPUs
//! that can still satisfy the request, so an allocation spans as few nodes as
//! possible and large free regions stay intact. Ties are broken by ascending
//! ID.

use std::collections::BTreeMap;

use super::CpuInfo;
use super::CpuSet;
use super::CpuTopology;
use super::TopologyError;

/// Picks `count` CPUs out of `available`.
///
/// Pure function: the same inputs always produce the same set.
pub fn take_by_topology(
    topology: &CpuTopology,
    available: &CpuSet,
    count: usize,
) -> Result<CpuSet, TopologyError> {
    if count > available.len() {
        return Err(TopologyError::NotEnoughCpus {
            requested: count,
            available: available.len(),
        });
    }

    let mut acc = Accumulator::new(topology, available, count);
    acc.take_full_groups(|info| info.socket_id);
    acc.take_full_groups(|info| info.numa_node_id);
    acc.take_full_cores();
    acc.take_single_cpus();
    if acc.needed > 0 {
        return Err(TopologyError::NotEnoughCpus {
            requested: count,
            available: count - acc.needed,
        });
    }
    Ok(acc.result)
}

struct Accumulator<'a> {
    topology: &'a CpuTopology,
    available: CpuSet,
    result: CpuSet,
    needed: usize,
    current_node: Option<usize>,
}

impl<'a> Accumulator<'a> {
    fn new(topology: &'a CpuTopology, available: &CpuSet, needed: usize) -> Self {
        // CPUs unknown to the topology can never be placed.
        let available = available.filter(|cpu| topology.cpu_info(cpu).is_some());
        Self {
            topology,
            available,
            result: CpuSet::new(),
            needed,
            current_node: None,
        }
    }

    fn take(&mut self, cpus: &CpuSet) {
        self.result = self.result.union(cpus);
        self.available = self.available.difference(cpus);
        self.needed -= cpus.len();
    }

    fn groups<F>(&self, key: F) -> BTreeMap<usize, CpuSet>
    where
        F: Fn(&CpuInfo) -> usize,
    {
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (cpu, info) in self.topology.details() {
            groups.entry(key(info)).or_default().push(*cpu);
        }
        groups
            .into_iter()
            .map(|(id, cpus)| (id, cpus.into_iter().collect()))
            .collect()
    }

    fn take_full_groups<F>(&mut self, key: F)
    where
        F: Fn(&CpuInfo) -> usize,
    {
        for cpus in self.groups(key).into_values() {
            if self.needed == 0 {
                return;
            }
            if cpus.len() <= self.needed && cpus.is_subset_of(&self.available) {
                self.take(&cpus);
            }
        }
    }

    fn take_full_cores(&mut self) {
        let cores = self.groups(|info| info.core_id);
        while self.needed > 0 {
            let Some(node) = self.target_node() else {
                return;
            };
            let node_cpus = self.topology.cpus_in_numa_nodes(&[node]);
            let candidate = cores
                .values()
                .find(|cpus| {
                    !cpus.is_empty()
                        && cpus.len() <= self.needed
                        && cpus.is_subset_of(&node_cpus)
                        && cpus.is_subset_of(&self.available)
                })
                .cloned();

            match candidate {
                Some(cpus) => self.take(&cpus),
                None => return,
            }
        }
    }

    fn take_single_cpus(&mut self) {
        while self.needed > 0 {
            let Some(node) = self.target_node() else {
                return;
            };
            let node_cpus = self.topology.cpus_in_numa_nodes(&[node]);
            let candidate = self
                .available
                .intersection(&node_cpus)
                .iter()
                .min_by_key(|cpu| (self.free_in_core(*cpu), *cpu));

            match candidate {
                Some(cpu) => self.take(&CpuSet::from([cpu])),
                None => return,
            }
        }
    }

    /// NUMA node to draw from next. Sticks to the current node until it runs
    /// out of free CPUs, so a request is never spread across nodes while one
    /// node can still serve it.
    fn target_node(&mut self) -> Option<usize> {
        if let Some(node) = self.current_node {
            if self.free_in_node(node) > 0 {
                return Some(node);
            }
        }

        let needed = self.needed;
        let next = self
            .topology
            .numa_node_ids()
            .into_iter()
            .map(|node| (node, self.free_in_node(node)))
            .filter(|(_, free)| *free > 0)
            .min_by_key(|(node, free)| {
                // Nodes that fit the whole request come first, tightest first.
                // Otherwise spill over starting with the largest node.
                let fits = *free >= needed;
                let order = if fits { *free } else { usize::MAX - *free };
                (!fits, order, *node)
            })
            .map(|(node, _)| node);

        self.current_node = next;
        next
    }

    fn free_in_node(&self, node: usize) -> usize {
        self.available
            .iter()
            .filter(|c| {
                self.topology
                    .cpu_info(*c)
                    .is_some_and(|i| i.numa_node_id == node)
            })
            .count()
    }

    fn free_in_core(&self, cpu: usize) -> usize {
        let Some(core) = self.topology.cpu_info(cpu).map(|info| info.core_id) else {
            return usize::MAX;
        };
        self.available
            .iter()
            .filter(|c| {
                self.topology
                    .cpu_info(*c)
                    .is_some_and(|i| i.core_id == core)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::topology::uniform_topology;

    #[test]
    fn takes_one_whole_core_first() {
        let topo = uniform_topology(1, 1, 2, 2);
        let got = take_by_topology(&topo, &topo.cpus(), 2).expect("pack");
        assert_eq!(got, CpuSet::from([0, 1]));
    }

    #[test]
    fn zero_count_is_empty() {
        let topo = uniform_topology(1, 1, 2, 2);
        let got = take_by_topology(&topo, &topo.cpus(), 0).expect("pack");
        assert!(got.is_empty());
    }

    #[test]
    fn rejects_count_above_available() {
        let topo = uniform_topology(1, 1, 2, 2);
        let err = take_by_topology(&topo, &CpuSet::from([0, 1]), 3).expect_err("too many");
        assert!(matches!(
            err,
            TopologyError::NotEnoughCpus {
                requested: 3,
                available: 2
            }
        ));
    }

    #[test]
    fn takes_whole_free_numa_node() {
        let topo = uniform_topology(2, 1, 2, 2);
        let available = topo.cpus().difference(&CpuSet::from([0]));
        let got = take_by_topology(&topo, &available, 4).expect("pack");
        assert_eq!(got, CpuSet::from([4, 5, 6, 7]));
    }

    #[test]
    fn fills_partially_used_core_before_splitting_free_one() {
        let topo = uniform_topology(1, 1, 2, 2);
        let got = take_by_topology(&topo, &CpuSet::from([1, 2, 3]), 1).expect("pack");
        assert_eq!(got, CpuSet::from([1]));
    }

    #[test]
    fn packs_into_tightest_node_that_fits() {
        let topo = uniform_topology(2, 1, 2, 2);
        let available = CpuSet::from([2, 3, 4, 5, 6, 7]);
        let got = take_by_topology(&topo, &available, 2).expect("pack");
        assert_eq!(got, CpuSet::from([2, 3]));
    }

    #[test]
    fn avoids_spanning_nodes_when_one_node_suffices() {
        let topo = uniform_topology(2, 1, 2, 2);
        let available = CpuSet::from([3, 4, 5, 6, 7]);
        let got = take_by_topology(&topo, &available, 3).expect("pack");
        assert_eq!(got.len(), 3);
        assert!(got.is_subset_of(&topo.cpus_in_numa_nodes(&[1])));
    }

    #[test]
    fn result_is_always_subset_of_available() {
        let topo = uniform_topology(2, 2, 2, 2);
        let available = CpuSet::from([1, 2, 5, 6, 7, 9, 12, 13, 15]);
        for count in 0..=available.len() {
            let got = take_by_topology(&topo, &available, count).expect("pack");
            assert_eq!(got.len(), count);
            assert!(got.is_subset_of(&available));
        }
    }
}
