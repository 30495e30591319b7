//! Minimal CRI v1 client.
//!
//! Only the three `runtime.v1.RuntimeService` calls the CPU manager uses are
//! modelled. Message field numbers follow `k8s.io/cri-api` `api.proto`;
//! fields the agent never reads are left out and skipped by prost on decode.

use core::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;
use tracing::debug;

use super::RuntimeService;
use crate::topology::CpuSet;

const LIST_POD_SANDBOX: &str = "/runtime.v1.RuntimeService/ListPodSandbox";
const LIST_CONTAINERS: &str = "/runtime.v1.RuntimeService/ListContainers";
const UPDATE_CONTAINER_RESOURCES: &str = "/runtime.v1.RuntimeService/UpdateContainerResources";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, derive_more::Display)]
pub enum RuntimeError {
    #[display("Invalid container runtime endpoint `{endpoint}`")]
    InvalidEndpoint { endpoint: String },
    #[display("Failed to connect to container runtime at `{endpoint}`")]
    ConnectionFailed { endpoint: String },
    #[display("Container runtime call `{method}` failed")]
    CallFailed { method: &'static str },
}

impl Error for RuntimeError {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListPodSandboxRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListPodSandboxResponse {
    #[prost(message, repeated, tag = "1")]
    pub items: Vec<PodSandbox>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PodSandbox {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub metadata: Option<PodSandboxMetadata>,
    #[prost(int32, tag = "3")]
    pub state: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PodSandboxMetadata {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub uid: String,
    #[prost(string, tag = "3")]
    pub namespace: String,
    #[prost(uint32, tag = "4")]
    pub attempt: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListContainersRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListContainersResponse {
    #[prost(message, repeated, tag = "1")]
    pub containers: Vec<Container>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Container {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub pod_sandbox_id: String,
    #[prost(message, optional, tag = "3")]
    pub metadata: Option<ContainerMetadata>,
    #[prost(int32, tag = "6")]
    pub state: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContainerMetadata {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, tag = "2")]
    pub attempt: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UpdateContainerResourcesRequest {
    #[prost(string, tag = "1")]
    pub container_id: String,
    #[prost(message, optional, tag = "2")]
    pub linux: Option<LinuxContainerResources>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LinuxContainerResources {
    #[prost(int64, tag = "1")]
    pub cpu_period: i64,
    #[prost(int64, tag = "2")]
    pub cpu_quota: i64,
    #[prost(int64, tag = "3")]
    pub cpu_shares: i64,
    #[prost(int64, tag = "4")]
    pub memory_limit_in_bytes: i64,
    #[prost(int64, tag = "5")]
    pub oom_score_adj: i64,
    /// cpulist format, e.g. `0-3,8`.
    #[prost(string, tag = "6")]
    pub cpuset_cpus: String,
    #[prost(string, tag = "7")]
    pub cpuset_mems: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UpdateContainerResourcesResponse {}

/// Strips the `unix://` scheme; plain paths are accepted as-is.
pub fn socket_path(endpoint: &str) -> Result<PathBuf, RuntimeError> {
    let path = endpoint.strip_prefix("unix://").unwrap_or(endpoint);
    if path.is_empty() || (endpoint.contains("://") && !endpoint.starts_with("unix://")) {
        return Err(RuntimeError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
        });
    }
    Ok(PathBuf::from(path))
}

/// Talks to containerd / CRI-O over their unix socket.
#[derive(Debug, Clone)]
pub struct CriRuntimeClient {
    channel: Channel,
}

impl CriRuntimeClient {
    pub async fn connect(endpoint: &str) -> Result<Self, Report<RuntimeError>> {
        let socket_path = socket_path(endpoint).map_err(Report::new)?;

        // The URI is a placeholder, the connector always dials the socket.
        let channel = Endpoint::from_static("http://[::]:50051")
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket_path = socket_path.clone();
                async move { UnixStream::connect(socket_path).await.map(TokioIo::new) }
            }))
            .await
            .change_context(RuntimeError::ConnectionFailed {
                endpoint: endpoint.to_string(),
            })?;

        debug!(endpoint, "Connected to container runtime");
        Ok(Self { channel })
    }

    async fn unary<Req, Resp>(
        &self,
        method: &'static str,
        request: Req,
    ) -> Result<Resp, Report<RuntimeError>>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .change_context(RuntimeError::CallFailed { method })?;

        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        grpc.unary(
            tonic::Request::new(request),
            PathAndQuery::from_static(method),
            codec,
        )
        .await
        .map(tonic::Response::into_inner)
        .change_context(RuntimeError::CallFailed { method })
    }
}

#[async_trait]
impl RuntimeService for CriRuntimeClient {
    async fn list_pod_sandboxes(&self) -> Result<Vec<PodSandbox>, Report<RuntimeError>> {
        let response: ListPodSandboxResponse =
            self.unary(LIST_POD_SANDBOX, ListPodSandboxRequest {}).await?;
        Ok(response.items)
    }

    async fn list_containers(&self) -> Result<Vec<Container>, Report<RuntimeError>> {
        let response: ListContainersResponse =
            self.unary(LIST_CONTAINERS, ListContainersRequest {}).await?;
        Ok(response.containers)
    }

    async fn update_container_cpuset(
        &self,
        container_id: &str,
        cpus: &CpuSet,
    ) -> Result<(), Report<RuntimeError>> {
        let request = UpdateContainerResourcesRequest {
            container_id: container_id.to_string(),
            linux: Some(LinuxContainerResources {
                cpuset_cpus: cpus.to_string(),
                ..Default::default()
            }),
        };
        let _: UpdateContainerResourcesResponse = self
            .unary(UPDATE_CONTAINER_RESOURCES, request)
            .await
            .attach_printable_lazy(|| format!("container_id: {container_id}, cpuset: {cpus}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn socket_path_accepts_unix_scheme_and_plain_paths() {
        assert_eq!(
            socket_path("unix:///run/containerd/containerd.sock").expect("path"),
            PathBuf::from("/run/containerd/containerd.sock")
        );
        assert_eq!(
            socket_path("/var/run/crio/crio.sock").expect("path"),
            PathBuf::from("/var/run/crio/crio.sock")
        );
        assert!(socket_path("tcp://127.0.0.1:1234").is_err());
        assert!(socket_path("unix://").is_err());
    }

    #[test]
    fn update_request_carries_cpulist_in_field_six() {
        let request = UpdateContainerResourcesRequest {
            container_id: "abc".to_string(),
            linux: Some(LinuxContainerResources {
                cpuset_cpus: CpuSet::from([0, 1, 2, 5]).to_string(),
                ..Default::default()
            }),
        };
        let bytes = request.encode_to_vec();
        // linux (field 2, len 7) -> cpuset_cpus (field 6, len 5) "0-2,5"
        let expected_tail = [0x12, 0x07, 0x32, 0x05, b'0', b'-', b'2', b',', b'5'];
        assert!(bytes.ends_with(&expected_tail), "{bytes:?}");
    }

    #[test]
    fn decodes_container_list_ignoring_unknown_fields() {
        let container = Container {
            id: "c1".to_string(),
            pod_sandbox_id: "s1".to_string(),
            metadata: Some(ContainerMetadata {
                name: "app".to_string(),
                attempt: 0,
            }),
            state: 1,
        };
        let mut bytes = ListContainersResponse {
            containers: vec![container.clone()],
        }
        .encode_to_vec();
        // Unknown trailing field 15 (string "x") must be skipped.
        bytes.extend_from_slice(&[0x7a, 0x01, b'x']);

        let decoded = ListContainersResponse::decode(bytes.as_slice()).expect("decode");
        assert_eq!(decoded.containers, vec![container]);
    }
}
