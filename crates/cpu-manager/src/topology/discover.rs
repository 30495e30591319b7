//! Topology discovery from sysfs.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use glob::glob;
use tracing::debug;
use tracing::info;

use super::CpuInfo;
use super::CpuSet;
use super::CpuTopology;
use super::TopologyError;

const CPU_DIR: &str = "devices/system/cpu";
const NODE_DIR: &str = "devices/system/node";

/// Discovers the CPU topology below `sysfs_root` (normally `/sys`).
///
/// Any missing or unparsable topology file is an error. Machines that expose
/// no NUMA directories are treated as a single node `0`.
pub fn discover(sysfs_root: &Path) -> Result<CpuTopology, TopologyError> {
    let cpu_dir = sysfs_root.join(CPU_DIR);
    let online = read_cpulist(&cpu_dir.join("online"))?;
    if online.is_empty() {
        return Err(TopologyError::NoCpus);
    }

    let numa_of_cpu = read_numa_membership(&sysfs_root.join(NODE_DIR))?;

    let mut details = BTreeMap::new();
    for cpu in online.iter() {
        let topology_dir = cpu_dir.join(format!("cpu{cpu}")).join("topology");
        let socket_id = read_usize(&topology_dir.join("physical_package_id"))?;
        let siblings = read_cpulist(&topology_dir.join("thread_siblings_list"))?;
        let core_id = siblings.iter().next().unwrap_or(cpu);
        let numa_node_id = numa_of_cpu.get(&cpu).copied().unwrap_or(0);

        details.insert(
            cpu,
            CpuInfo {
                socket_id,
                numa_node_id,
                core_id,
            },
        );
    }

    let topology = CpuTopology::new(details)?;
    info!(
        sysfs_root = %sysfs_root.display(),
        topology = %topology,
        "Discovered CPU topology"
    );
    Ok(topology)
}

fn read_numa_membership(node_dir: &Path) -> Result<BTreeMap<usize, usize>, TopologyError> {
    let mut membership = BTreeMap::new();
    for node_path in glob_paths(&node_dir.join("node[0-9]*"))? {
        let node_id = parse_suffix(&node_path, "node")?;
        for cpu_path in glob_paths(&node_path.join("cpu[0-9]*"))? {
            let cpu = parse_suffix(&cpu_path, "cpu")?;
            if membership.insert(cpu, node_id).is_some() {
                return Err(TopologyError::DuplicateNumaCpu { cpu });
            }
        }
    }

    if membership.is_empty() {
        debug!(path = %node_dir.display(), "No NUMA nodes found, assuming node 0");
    }
    Ok(membership)
}

fn glob_paths(pattern: &Path) -> Result<Vec<PathBuf>, TopologyError> {
    let pattern = pattern.to_string_lossy();
    let paths = glob(&pattern).map_err(|e| TopologyError::Read {
        path: pattern.to_string(),
        message: e.to_string(),
    })?;
    Ok(paths.filter_map(Result::ok).collect())
}

fn parse_suffix(path: &Path, prefix: &str) -> Result<usize, TopologyError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix(prefix))
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| TopologyError::Parse {
            path: path.display().to_string(),
            message: format!("expected `{prefix}<id>`"),
        })
}

fn read_trimmed(path: &Path) -> Result<String, TopologyError> {
    fs::read_to_string(path)
        .map(|raw| raw.trim_end_matches('\0').trim().to_string())
        .map_err(|e| TopologyError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

fn read_usize(path: &Path) -> Result<usize, TopologyError> {
    let raw = read_trimmed(path)?;
    raw.parse().map_err(|_| TopologyError::Parse {
        path: path.display().to_string(),
        message: format!("`{raw}` is not an integer"),
    })
}

fn read_cpulist(path: &Path) -> Result<CpuSet, TopologyError> {
    let raw = read_trimmed(path)?;
    raw.parse().map_err(|e: super::CpuSetError| TopologyError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;

    struct FakeSysfs {
        dir: TempDir,
    }

    impl FakeSysfs {
        fn new(online: &str) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let fake = Self { dir };
            fake.write(&format!("{CPU_DIR}/online"), online);
            fake
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn write(&self, relative: &str, contents: &str) {
            let path = self.dir.path().join(relative);
            fs::create_dir_all(path.parent().expect("parent")).expect("create dirs");
            fs::write(path, format!("{contents}\n")).expect("write file");
        }

        fn cpu(&self, cpu: usize, socket: usize, siblings: &str) {
            self.write(
                &format!("{CPU_DIR}/cpu{cpu}/topology/physical_package_id"),
                &socket.to_string(),
            );
            self.write(
                &format!("{CPU_DIR}/cpu{cpu}/topology/thread_siblings_list"),
                siblings,
            );
        }

        fn numa(&self, node: usize, cpu: usize) {
            let path = self
                .dir
                .path()
                .join(format!("{NODE_DIR}/node{node}/cpu{cpu}"));
            fs::create_dir_all(path).expect("create node cpu dir");
        }
    }

    #[test]
    fn discovers_two_numa_nodes_with_hyperthreads() {
        let sysfs = FakeSysfs::new("0-7");
        for cpu in 0..8 {
            let socket = cpu / 4;
            let first = cpu - cpu % 2;
            sysfs.cpu(cpu, socket, &format!("{}-{}", first, first + 1));
            sysfs.numa(socket, cpu);
        }

        let topo = discover(sysfs.root()).expect("discover");

        assert_eq!(topo.num_cpus(), 8);
        assert_eq!(topo.num_cores(), 4);
        assert_eq!(topo.num_sockets(), 2);
        assert_eq!(topo.num_numa_nodes(), 2);
        assert_eq!(topo.cpus_in_numa_nodes(&[0]), CpuSet::from([0, 1, 2, 3]));
        assert_eq!(
            topo.cpu_info(5),
            Some(&CpuInfo {
                socket_id: 1,
                numa_node_id: 1,
                core_id: 4,
            })
        );
    }

    #[test]
    fn missing_numa_directories_map_to_node_zero() {
        let sysfs = FakeSysfs::new("0-1");
        sysfs.cpu(0, 0, "0");
        sysfs.cpu(1, 0, "1");

        let topo = discover(sysfs.root()).expect("discover");

        assert_eq!(topo.numa_node_ids().into_iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(topo.num_cores(), 2);
    }

    #[test]
    fn only_online_cpus_are_discovered() {
        let sysfs = FakeSysfs::new("0,2");
        sysfs.cpu(0, 0, "0");
        sysfs.cpu(2, 0, "2");

        let topo = discover(sysfs.root()).expect("discover");

        assert_eq!(topo.cpus(), CpuSet::from([0, 2]));
    }

    #[test]
    fn missing_topology_file_is_fatal() {
        let sysfs = FakeSysfs::new("0-1");
        sysfs.cpu(0, 0, "0-1");

        let err = discover(sysfs.root()).expect_err("cpu1 has no topology");
        assert!(matches!(err, TopologyError::Read { .. }), "got {err}");
    }

    #[test]
    fn garbage_package_id_is_fatal() {
        let sysfs = FakeSysfs::new("0");
        sysfs.write(&format!("{CPU_DIR}/cpu0/topology/physical_package_id"), "x");
        sysfs.write(&format!("{CPU_DIR}/cpu0/topology/thread_siblings_list"), "0");

        let err = discover(sysfs.root()).expect_err("bad package id");
        assert!(matches!(err, TopologyError::Parse { .. }), "got {err}");
    }
}
