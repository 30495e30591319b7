//! The CPU manager: keeps allocation state in sync with the pods on the node
//! and pushes the resulting cpusets to the container runtime.
//!
//! Allocation is driven per pod through a rate-limited [`WorkQueue`]; a
//! periodic reconcile pass re-applies the desired cpuset of every running
//! container. Both paths take the same lock before touching state, and
//! runtime calls are made after the lock is released.

use core::error::Error;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

pub mod container_map;
pub mod workqueue;

pub use container_map::ContainerMap;
pub use workqueue::Backoff;
pub use workqueue::WorkQueue;

use crate::metrics::ManagerMetrics;
use crate::platform::k8s::nrt::zones_to_topology_result;
use crate::platform::k8s::pod;
use crate::platform::k8s::PodEvent;
use crate::platform::PodSource;
use crate::platform::RuntimeService;
use crate::platform::TopologySource;
use crate::policy::AllocationRequest;
use crate::policy::PolicyMode;
use crate::policy::StaticPolicy;
use crate::policy::TopologyResult;
use crate::state::AllocationState;
use crate::state::MemoryState;
use crate::state::State;
use crate::topology::CpuSet;
use crate::topology::CpuTopology;

pub const DEFAULT_RECONCILE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, derive_more::Display)]
pub enum CpuManagerError {
    #[display("Failed to fetch the node topology result")]
    TopologyUnavailable,
    #[display("Failed to start the static policy")]
    PolicyStart,
    #[display("Pod `{pod}` has no topology result yet")]
    MissingTopologyResult { pod: String },
    #[display("Failed to allocate CPUs for `{pod}/{container}`")]
    Allocation { pod: String, container: String },
}

impl Error for CpuManagerError {}

#[derive(Debug, Clone)]
pub struct CpuManagerConfig {
    pub node_name: String,
    /// Policy for pods without a `topology.crane.io/cpu-policy` annotation.
    pub default_policy: PolicyMode,
    pub reconcile_period: Duration,
    pub backoff: Backoff,
}

impl CpuManagerConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            default_policy: PolicyMode::None,
            reconcile_period: DEFAULT_RECONCILE_PERIOD,
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledContainer {
    /// `namespace/name`
    pub pod: String,
    pub container: String,
    /// Empty when the container is not running.
    pub container_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub success: Vec<ReconciledContainer>,
    pub failure: Vec<ReconciledContainer>,
}

struct Inner {
    state: Box<dyn State>,
    /// What was last pushed to the runtime for each container.
    last_update: MemoryState,
    policy: StaticPolicy,
    container_map: ContainerMap,
}

struct PendingUpdate {
    target: ReconciledContainer,
    pod_uid: String,
    cpus: CpuSet,
}

pub struct CpuManager<R, P, T> {
    config: CpuManagerConfig,
    runtime: Arc<R>,
    pods: Arc<P>,
    topology_source: Arc<T>,
    inner: Mutex<Inner>,
    queue: WorkQueue<String>,
    metrics: Arc<ManagerMetrics>,
}

impl<R, P, T> CpuManager<R, P, T>
where
    R: RuntimeService,
    P: PodSource,
    T: TopologySource,
{
    /// Builds the manager on top of already loaded `state` and seeds the
    /// container map from the runtime.
    pub async fn new(
        config: CpuManagerConfig,
        topology: Arc<CpuTopology>,
        state: Box<dyn State>,
        runtime: Arc<R>,
        pods: Arc<P>,
        topology_source: Arc<T>,
        metrics: Arc<ManagerMetrics>,
    ) -> Self {
        info!(topology = %topology, "Detected CPU topology");
        let container_map = build_container_map(runtime.as_ref()).await;
        let queue = WorkQueue::new(config.backoff);

        Self {
            config,
            runtime,
            pods,
            topology_source,
            inner: Mutex::new(Inner {
                state,
                last_update: MemoryState::new(),
                policy: StaticPolicy::new(topology),
                container_map,
            }),
            queue,
            metrics,
        }
    }

    pub fn config(&self) -> &CpuManagerConfig {
        &self.config
    }

    /// Fetches the node's topology result and validates state against it.
    /// Either failing is fatal.
    pub async fn start(&self) -> Result<(), Report<CpuManagerError>> {
        let node_topology = self
            .topology_source
            .node_topology()
            .await
            .change_context(CpuManagerError::TopologyUnavailable)?;

        let mut inner = self.inner.lock().await;
        let Inner { state, policy, .. } = &mut *inner;
        policy
            .start(state.as_mut(), &node_topology.result)
            .map_err(Report::new)
            .change_context(CpuManagerError::PolicyStart)?;

        info!(
            policy = policy.name(),
            reserved = %policy.reserved_cpus(),
            default_cpuset = %state.default_cpu_set(),
            "CPU manager started"
        );
        self.update_pool_metrics(&inner);
        Ok(())
    }

    /// Drains the work queue until cancelled.
    #[tracing::instrument(skip_all)]
    pub async fn run_worker(&self, cancellation_token: CancellationToken) {
        info!("Starting CPU manager worker");
        loop {
            let key = tokio::select! {
                _ = cancellation_token.cancelled() => {
                    self.queue.shutdown();
                    None
                }
                key = self.queue.get() => key,
            };
            let Some(key) = key else {
                break;
            };

            match self.sync_pod(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) => {
                    warn!(pod = %key, "Failed to sync pod, requeuing: {e:?}");
                    self.metrics.record_requeue();
                    self.queue.add_rate_limited(key.clone());
                }
            }
            self.queue.done(&key);
        }
        info!("CPU manager worker stopped");
    }

    /// Reconciles every `reconcile_period` while the node runs the static
    /// CPU manager policy.
    #[tracing::instrument(skip_all, fields(period = ?self.config.reconcile_period))]
    pub async fn run_reconcile_loop(&self, cancellation_token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reconcile_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Reconcile loop shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    match self.topology_source.static_cpu_policy().await {
                        Ok(true) => {
                            self.reconcile_state().await;
                        }
                        Ok(false) => debug!("Node CPU manager policy is not static, skipping reconcile"),
                        Err(e) => warn!("Failed to get node CPU manager policy, skipping reconcile: {e:?}"),
                    }
                }
            }
        }
    }

    /// Feeds pod watch events into the work queue.
    pub async fn process_events(
        &self,
        mut events: mpsc::Receiver<PodEvent>,
        cancellation_token: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancellation_token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(PodEvent::Applied { key }) => {
                    let Some((namespace, name)) = pod::split_pod_key(&key) else {
                        continue;
                    };
                    if let Some(pod) = self.pods.get(namespace, name) {
                        self.enqueue_pod(&pod);
                    }
                }
                // Released by the next reconcile.
                Some(PodEvent::Deleted { key }) => debug!(pod = %key, "Pod deleted"),
                None => break,
            }
        }
    }

    /// Queues `pod` unless it opted out of dedicated CPUs or has finished.
    pub fn enqueue_pod(&self, pod: &Pod) {
        if pod::is_terminated(pod)
            || pod::cpu_policy_or(pod, self.config.default_policy) == PolicyMode::None
        {
            return;
        }
        if let Some(key) = pod::pod_key(pod) {
            self.queue.add(key);
        }
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    /// Allocates CPUs for every eligible container of the pod behind `key`.
    pub async fn sync_pod(&self, key: &str) -> Result<(), Report<CpuManagerError>> {
        let Some((namespace, name)) = pod::split_pod_key(key) else {
            error!(pod = %key, "Invalid pod key");
            return Ok(());
        };
        let Some(pod) = self.pods.get(namespace, name) else {
            return Ok(());
        };
        if pod::is_terminated(&pod) {
            debug!(pod = %key, "Pod terminated, not allocating");
            return Ok(());
        }

        let mode = pod::cpu_policy_or(&pod, self.config.default_policy);
        if mode == PolicyMode::None {
            return Ok(());
        }

        let zones = match pod::topology_result(&pod) {
            Ok(Some(zones)) => zones,
            Ok(None) => {
                return Err(Report::new(CpuManagerError::MissingTopologyResult {
                    pod: key.to_string(),
                }));
            }
            Err(e) => {
                error!(pod = %key, "Dropping pod with malformed topology result: {e}");
                return Ok(());
            }
        };
        let topology_result = match zones_to_topology_result(&pod::numa_zones(zones), None) {
            Ok(result) => result,
            Err(e) => {
                error!(pod = %key, "Dropping pod with invalid topology result: {e}");
                return Ok(());
            }
        };
        // Shared pool, nothing to pin.
        if topology_result.is_empty() {
            return Ok(());
        }

        for (container, _) in pod::target_containers(&pod) {
            self.allocate(&pod, &container.name, mode, &topology_result)
                .await
                .attach_printable_lazy(|| format!("pod: {key}"))?;
        }
        Ok(())
    }

    /// Drops stale state and assigns CPUs to one container, all under one
    /// lock acquisition.
    pub async fn allocate(
        &self,
        pod: &Pod,
        container_name: &str,
        mode: PolicyMode,
        topology_result: &TopologyResult,
    ) -> Result<(), Report<CpuManagerError>> {
        let active_pods = self.pods.active_pods();
        let mut inner = self.inner.lock().await;
        self.renew_state_locked(&mut inner, &active_pods);

        let immovable_cpus = self.immovable_cpus(&inner, &active_pods);
        let request = AllocationRequest {
            pod_uid: pod::pod_uid(pod),
            container_name,
            mode,
            topology_result,
        };
        let Inner { state, policy, .. } = &mut *inner;
        let result = policy.allocate(state.as_mut(), &request, &immovable_cpus);
        self.metrics.record_allocation(result.is_ok());
        self.update_pool_metrics(&inner);

        result.map_err(Report::new).change_context_lazy(|| CpuManagerError::Allocation {
            pod: pod::pod_key(pod).unwrap_or_default(),
            container: container_name.to_string(),
        })
    }

    /// Removes state of containers that are no longer active. Returns how
    /// many entries were dropped.
    ///
    /// Releasing an exclusive container also releases every NUMA-pinned pod
    /// so it is reallocated against the grown shared pool.
    fn renew_state_locked(&self, inner: &mut Inner, active_pods: &[Arc<Pod>]) -> usize {
        let active: HashMap<&str, HashSet<&str>> = active_pods
            .iter()
            .map(|pod| {
                (
                    pod::pod_uid(pod),
                    pod::container_names(pod).into_iter().collect(),
                )
            })
            .collect();

        let is_active = |pod_uid: &str, container_name: &str| {
            active
                .get(pod_uid)
                .is_some_and(|names| names.contains(container_name))
        };

        let default_cpus = inner.state.default_cpu_set();
        let mut removed = 0;
        let mut exclusive_removed = false;
        for (pod_uid, containers) in inner.state.assignments() {
            for (container_name, cpus) in containers {
                if is_active(&pod_uid, &container_name) {
                    continue;
                }

                info!(pod_uid = %pod_uid, container = %container_name, cpuset = %cpus, "Removing stale container state");
                if !cpus.is_empty() && cpus.is_disjoint(&default_cpus) {
                    exclusive_removed = true;
                }
                remove_container_locked(inner, &pod_uid, &container_name);
                removed += 1;
            }
        }

        // Containers on the shared pool have no assignment but still leave a
        // pushed cpuset and a runtime ID behind.
        for (pod_uid, containers) in inner.last_update.assignments() {
            for container_name in containers.keys() {
                if is_active(&pod_uid, container_name) {
                    continue;
                }
                debug!(pod_uid = %pod_uid, container = %container_name, "Forgetting pushed cpuset of inactive container");
                if let Err(e) = inner.last_update.delete(&pod_uid, container_name) {
                    error!(pod_uid = %pod_uid, container = %container_name, "Failed to drop pushed cpuset: {e}");
                }
            }
        }
        inner
            .container_map
            .retain(|r| is_active(&r.pod_uid, &r.container_name));

        if exclusive_removed {
            for pod in active_pods {
                if pod::cpu_policy_or(pod, self.config.default_policy) != PolicyMode::Numa {
                    continue;
                }
                let pod_uid = pod::pod_uid(pod);
                info!(pod_uid, "Releasing NUMA-pinned pod after an exclusive container was removed");
                for container_name in pod::container_names(pod) {
                    remove_container_locked(inner, pod_uid, container_name);
                }
                self.enqueue_pod(pod);
            }
        }

        if removed > 0 {
            self.metrics.record_stale_removed(removed);
        }
        removed
    }

    /// CPUs held by active immovable pods.
    fn immovable_cpus(&self, inner: &Inner, active_pods: &[Arc<Pod>]) -> CpuSet {
        let held: Vec<CpuSet> = active_pods
            .iter()
            .filter(|pod| {
                pod::cpu_policy_or(pod, self.config.default_policy) == PolicyMode::Immovable
            })
            .flat_map(|pod| {
                let pod_uid = pod::pod_uid(pod);
                pod::container_names(pod)
                    .into_iter()
                    .filter_map(move |name| inner.state.cpu_set(pod_uid, name))
            })
            .collect();
        CpuSet::new().union_all(&held)
    }

    /// Pushes the desired cpuset of every running container whose last
    /// pushed cpuset differs, or whose runtime ID is not yet known.
    pub async fn reconcile_state(&self) -> ReconcileOutcome {
        let active_pods = self.pods.active_pods();
        let mut outcome = ReconcileOutcome::default();

        let pending = {
            let mut inner = self.inner.lock().await;
            self.renew_state_locked(&mut inner, &active_pods);
            self.plan_updates(&inner, &active_pods, &mut outcome)
        };

        let mut pushed = Vec::with_capacity(pending.len());
        for update in pending {
            let target = &update.target;
            debug!(
                pod = %target.pod,
                container = %target.container,
                container_id = %target.container_id,
                cpuset = %update.cpus,
                "Updating container cpuset"
            );
            match self
                .runtime
                .update_container_cpuset(&target.container_id, &update.cpus)
                .await
            {
                Ok(()) => pushed.push(update),
                Err(e) => {
                    error!(
                        pod = %target.pod,
                        container = %target.container,
                        container_id = %target.container_id,
                        cpuset = %update.cpus,
                        "Failed to update container cpuset: {e:?}"
                    );
                    outcome.failure.push(update.target);
                }
            }
        }

        if !pushed.is_empty() {
            let mut inner = self.inner.lock().await;
            for update in pushed {
                let target = update.target;
                if let Err(e) =
                    inner
                        .last_update
                        .set_cpu_set(&update.pod_uid, &target.container, update.cpus)
                {
                    error!("Failed to record pushed cpuset: {e}");
                }
                inner
                    .container_map
                    .add(&update.pod_uid, &target.container, &target.container_id);
                outcome.success.push(target);
            }
        }

        self.metrics
            .record_reconcile(outcome.success.len(), outcome.failure.len());
        outcome
    }

    fn plan_updates(
        &self,
        inner: &Inner,
        active_pods: &[Arc<Pod>],
        outcome: &mut ReconcileOutcome,
    ) -> Vec<PendingUpdate> {
        let reserved = inner.policy.reserved_cpus();
        let mut pending = Vec::new();

        for pod in active_pods {
            let pod_key = pod::pod_key(pod).unwrap_or_default();
            let pod_uid = pod::pod_uid(pod);
            let exclude_reserved = pod::excludes_reserved_cpus(pod);

            for container_name in pod::container_names(pod) {
                let container_id = match pod::running_container_id(pod, container_name) {
                    Ok(id) => id,
                    Err(e) => {
                        debug!(pod = %pod_key, container = container_name, "Skipping container: {e}");
                        outcome.failure.push(ReconciledContainer {
                            pod: pod_key.clone(),
                            container: container_name.to_string(),
                            container_id: String::new(),
                        });
                        continue;
                    }
                };
                let target = ReconciledContainer {
                    pod: pod_key.clone(),
                    container: container_name.to_string(),
                    container_id,
                };

                let mut cpus = inner.state.cpu_set_or_default(pod_uid, container_name);
                let mut last_cpus = inner.last_update.cpu_set_or_default(pod_uid, container_name);
                if exclude_reserved {
                    cpus = cpus.difference(reserved);
                    last_cpus = last_cpus.difference(reserved);
                }
                if cpus.is_empty() {
                    debug!(pod = %pod_key, container = container_name, "Skipping container with empty cpuset");
                    outcome.failure.push(target);
                    continue;
                }

                let known = inner
                    .container_map
                    .matches(&target.container_id, pod_uid, container_name);
                if cpus != last_cpus || !known {
                    pending.push(PendingUpdate {
                        target,
                        pod_uid: pod_uid.to_string(),
                        cpus,
                    });
                } else {
                    outcome.success.push(target);
                }
            }
        }
        pending
    }

    /// CPUs not in the shared pool.
    pub async fn exclusive_cpus(&self) -> CpuSet {
        let inner = self.inner.lock().await;
        inner.policy.exclusive_cpus(inner.state.as_ref())
    }

    /// Shared pool minus reserved CPUs.
    pub async fn shared_cpus(&self) -> CpuSet {
        let inner = self.inner.lock().await;
        inner.policy.shared_cpus(inner.state.as_ref())
    }

    pub async fn reserved_cpus(&self) -> CpuSet {
        self.inner.lock().await.policy.reserved_cpus().clone()
    }

    pub async fn state_snapshot(&self) -> AllocationState {
        self.inner.lock().await.state.snapshot().clone()
    }

    fn update_pool_metrics(&self, inner: &Inner) {
        let state = inner.state.as_ref();
        self.metrics.set_cpu_pools(
            inner.policy.exclusive_cpus(state).len(),
            inner.policy.shared_cpus(state).len(),
        );
    }
}

fn remove_container_locked(inner: &mut Inner, pod_uid: &str, container_name: &str) {
    if let Err(e) = inner
        .policy
        .remove_container(inner.state.as_mut(), pod_uid, container_name)
    {
        error!(pod_uid, container = container_name, "Failed to remove container state: {e}");
    }
    if let Err(e) = inner.last_update.delete(pod_uid, container_name) {
        error!(pod_uid, container = container_name, "Failed to drop pushed cpuset: {e}");
    }
    inner.container_map.remove_by_ref(pod_uid, container_name);
}

/// Maps the runtime's containers to `(pod_uid, container_name)`. Runtime
/// errors leave the map partially filled; unknown containers are pushed on
/// the next reconcile anyway.
async fn build_container_map<R: RuntimeService + ?Sized>(runtime: &R) -> ContainerMap {
    let mut container_map = ContainerMap::new();

    let sandboxes: HashMap<String, String> = match runtime.list_pod_sandboxes().await {
        Ok(sandboxes) => sandboxes
            .into_iter()
            .filter_map(|sandbox| Some((sandbox.id, sandbox.metadata?.uid)))
            .collect(),
        Err(e) => {
            warn!("Failed to list pod sandboxes: {e:?}");
            return container_map;
        }
    };
    let containers = match runtime.list_containers().await {
        Ok(containers) => containers,
        Err(e) => {
            warn!("Failed to list containers: {e:?}");
            return container_map;
        }
    };

    for container in containers {
        let Some(pod_uid) = sandboxes.get(&container.pod_sandbox_id) else {
            info!(
                pod_sandbox_id = %container.pod_sandbox_id,
                container_id = %container.id,
                "No pod sandbox found for container"
            );
            continue;
        };
        let Some(metadata) = container.metadata else {
            continue;
        };
        container_map.add(pod_uid, &metadata.name, &container.id);
    }
    debug!(containers = container_map.len(), "Built container map from runtime");
    container_map
}
