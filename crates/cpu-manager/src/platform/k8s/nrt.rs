//! NodeResourceTopology (`topology.crane.io/v1alpha1`) access.

use std::borrow::Cow;
use std::collections::BTreeMap;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::ClusterResourceScope;
use kube::api::ObjectMeta;
use kube::Api;
use kube::Client;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use super::pod::cpu_value;
use super::KubernetesError;
use crate::platform::NodeTopology;
use crate::platform::TopologySource;
use crate::policy::NodeInfo;
use crate::policy::TopologyResult;
use crate::topology::CpuSet;

pub const ZONE_TYPE_NODE: &str = "Node";
pub const CPU_MANAGER_POLICY_STATIC: &str = "Static";
pub const ATTRIBUTE_RESERVED_SYSTEM_CPUS: &str = "topology.crane.io/reserved-system-cpus";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: BTreeMap<String, Quantity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocatable: BTreeMap<String, Quantity>,
    #[serde(default, rename = "reservedCPUNums")]
    pub reserved_cpu_nums: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub name: String,
    #[serde(rename = "type")]
    pub zone_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerPolicy {
    #[serde(default, rename = "cpuManagerPolicy")]
    pub cpu_manager_policy: String,
    #[serde(default)]
    pub topology_manager_policy: String,
}

/// Cluster-scoped, named after the node.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResourceTopology {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub crane_manager_policy: ManagerPolicy,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub zones: Vec<Zone>,
}

impl kube::Resource for NodeResourceTopology {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn group(_dt: &()) -> Cow<'_, str> {
        "topology.crane.io".into()
    }

    fn version(_dt: &()) -> Cow<'_, str> {
        "v1alpha1".into()
    }

    fn kind(_dt: &()) -> Cow<'_, str> {
        "NodeResourceTopology".into()
    }

    fn plural(_dt: &()) -> Cow<'_, str> {
        "noderesourcetopologies".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl NodeResourceTopology {
    pub fn is_static_cpu_policy(&self) -> bool {
        self.crane_manager_policy.cpu_manager_policy == CPU_MANAGER_POLICY_STATIC
    }

    pub fn topology_result(&self) -> Result<TopologyResult, KubernetesError> {
        zones_to_topology_result(&self.zones, Some(&self.attributes))
    }
}

/// Converts NUMA node zones (`node<N>`) with CPU capacity into a
/// [`TopologyResult`]. Other zone types are ignored.
pub fn zones_to_topology_result(
    zones: &[Zone],
    attributes: Option<&BTreeMap<String, String>>,
) -> Result<TopologyResult, KubernetesError> {
    let reserved_system_cpus = match attributes.and_then(|a| a.get(ATTRIBUTE_RESERVED_SYSTEM_CPUS)) {
        Some(raw) => raw
            .parse::<CpuSet>()
            .map_err(|e| KubernetesError::InvalidTopology {
                message: format!("{ATTRIBUTE_RESERVED_SYSTEM_CPUS}: {e}"),
            })?,
        None => CpuSet::new(),
    };

    let mut result = TopologyResult::new();
    for zone in zones {
        if zone.zone_type != ZONE_TYPE_NODE {
            continue;
        }
        let Some(resources) = zone.resources.as_ref() else {
            continue;
        };
        let numa_node_id = zone
            .name
            .strip_prefix("node")
            .and_then(|id| id.parse::<usize>().ok())
            .ok_or_else(|| KubernetesError::InvalidTopology {
                message: format!("zone name `{}` is not of the form `node<N>`", zone.name),
            })?;

        let cpus = resources
            .capacity
            .get("cpu")
            .and_then(cpu_value)
            .unwrap_or(0);
        if cpus == 0 {
            continue;
        }

        result.insert(
            numa_node_id,
            NodeInfo {
                cpus: usize::try_from(cpus).unwrap_or(usize::MAX),
                num_reserved_cpus: usize::try_from(resources.reserved_cpu_nums).unwrap_or(0),
                reserved_system_cpus: reserved_system_cpus.clone(),
            },
        );
    }
    Ok(result)
}

/// Reads the node's NodeResourceTopology from the API server.
pub struct NrtTopologySource {
    api: Api<NodeResourceTopology>,
    node_name: String,
}

impl NrtTopologySource {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            api: Api::all(client),
            node_name: node_name.into(),
        }
    }
}

impl NrtTopologySource {
    async fn fetch(&self) -> Result<NodeResourceTopology, Report<KubernetesError>> {
        self.api
            .get_opt(&self.node_name)
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: format!("Failed to get NodeResourceTopology `{}`", self.node_name),
            })?
            .ok_or_else(|| {
                Report::new(KubernetesError::TopologyNotFound {
                    node_name: self.node_name.clone(),
                })
            })
    }
}

#[async_trait]
impl TopologySource for NrtTopologySource {
    async fn node_topology(&self) -> Result<NodeTopology, Report<KubernetesError>> {
        let nrt = self.fetch().await?;
        let result = nrt.topology_result().map_err(Report::new)?;
        debug!(
            node = %self.node_name,
            policy = %nrt.crane_manager_policy.cpu_manager_policy,
            numa_nodes = result.len(),
            "Fetched NodeResourceTopology"
        );
        Ok(NodeTopology {
            static_policy: nrt.is_static_cpu_policy(),
            result,
        })
    }

    async fn static_cpu_policy(&self) -> Result<bool, Report<KubernetesError>> {
        Ok(self.fetch().await?.is_static_cpu_policy())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn nrt(json: &str) -> NodeResourceTopology {
        serde_json::from_str(json).expect("valid nrt")
    }

    #[test]
    fn converts_node_zones_with_cpu_capacity() {
        let nrt = nrt(r#"{
            "metadata": {"name": "worker-1"},
            "craneManagerPolicy": {"cpuManagerPolicy": "Static", "topologyManagerPolicy": "SingleNUMANodePodLevel"},
            "attributes": {"topology.crane.io/reserved-system-cpus": "0-1"},
            "zones": [
                {"name": "node0", "type": "Node", "resources": {"capacity": {"cpu": "8"}, "reservedCPUNums": 2}},
                {"name": "node1", "type": "Node", "resources": {"capacity": {"cpu": "0"}}},
                {"name": "node2", "type": "Node"},
                {"name": "socket0", "type": "Socket", "resources": {"capacity": {"cpu": "16"}}}
            ]
        }"#);

        assert!(nrt.is_static_cpu_policy());
        let result = nrt.topology_result().expect("result");
        assert_eq!(result.numa_node_ids(), vec![0]);
        assert_eq!(
            result.get(0),
            Some(&NodeInfo {
                cpus: 8,
                num_reserved_cpus: 2,
                reserved_system_cpus: CpuSet::from([0, 1]),
            })
        );
    }

    #[test]
    fn rejects_badly_named_node_zone() {
        let zones = vec![Zone {
            name: "numa-a".to_string(),
            zone_type: ZONE_TYPE_NODE.to_string(),
            resources: Some(ResourceInfo {
                capacity: [("cpu".to_string(), Quantity("2".to_string()))].into(),
                ..Default::default()
            }),
            ..Default::default()
        }];
        assert!(zones_to_topology_result(&zones, None).is_err());
    }

    #[test]
    fn policy_is_readable_when_zones_are_malformed() {
        let nrt = nrt(r#"{
            "metadata": {"name": "w"},
            "craneManagerPolicy": {"cpuManagerPolicy": "Static"},
            "attributes": {"topology.crane.io/reserved-system-cpus": "not-a-cpulist"},
            "zones": [{"name": "numa-a", "type": "Node", "resources": {"capacity": {"cpu": "2"}}}]
        }"#);
        assert!(nrt.topology_result().is_err());
        assert!(nrt.is_static_cpu_policy());
    }

    #[test]
    fn non_static_policy_is_reported() {
        let nrt = nrt(r#"{"metadata": {"name": "w"}, "craneManagerPolicy": {"cpuManagerPolicy": "None"}, "zones": []}"#);
        assert!(!nrt.is_static_cpu_policy());
        assert!(nrt.topology_result().expect("result").is_empty());
    }
}
