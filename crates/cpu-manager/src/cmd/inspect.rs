use anyhow::{Context, Result};

use crate::config::{ShowStateArgs, ShowTopologyArgs, CHECKPOINT_KEY};
use crate::state::checkpoint::CheckpointFile;
use crate::state::CheckpointStore;
use crate::topology::discover;

pub async fn run_show_state(show_state_args: ShowStateArgs) -> Result<()> {
    utils::logging::init();

    let store = CheckpointStore::new(&show_state_args.state_dir)?;
    tracing::info!(
        "Reading checkpoint `{CHECKPOINT_KEY}` from {}",
        store.dir().display()
    );

    let file = CheckpointFile::read(&store, CHECKPOINT_KEY)
        .context("failed to read CPU manager checkpoint")?;
    let payload = &file.payload;

    tracing::info!(
        "Schema version v{}, policy `{}`, checksum {}",
        payload.schema_version,
        payload.policy_name,
        file.checksum
    );
    tracing::info!("Default cpuset: {}", payload.default_cpu_set);
    for (pod_uid, containers) in &payload.entries {
        for (container_name, cpus) in containers {
            tracing::info!("Pod {pod_uid} container {container_name}: {cpus}");
        }
    }
    Ok(())
}

pub async fn run_show_topology(show_topology_args: ShowTopologyArgs) -> Result<()> {
    utils::logging::init();

    let topology = discover(&show_topology_args.sysfs_root).with_context(|| {
        format!(
            "failed to discover CPU topology under `{}`",
            show_topology_args.sysfs_root.display()
        )
    })?;

    tracing::info!("Topology: {topology}");
    for numa_node_id in topology.numa_node_ids() {
        tracing::info!(
            "NUMA node {numa_node_id}: {}",
            topology.cpus_in_numa_nodes(&[numa_node_id])
        );
    }
    for (cpu, info) in topology.details() {
        tracing::info!(
            "CPU {cpu}: socket={} numa_node={} core={}",
            info.socket_id,
            info.numa_node_id,
            info.core_id
        );
    }
    Ok(())
}
