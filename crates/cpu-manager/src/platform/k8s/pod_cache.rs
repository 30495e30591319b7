//! Local cache of the pods bound to this node, fed by a watch on the API
//! server.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::pod::pod_key;
use super::KubernetesError;
use super::PodEvent;
use crate::platform::PodSource;

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Pods keyed by `namespace/name`.
pub struct PodCache {
    pods: DashMap<String, Arc<Pod>>,
    synced: watch::Sender<bool>,
}

impl Default for PodCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PodCache {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            pods: DashMap::new(),
            synced,
        }
    }

    /// Inserts or replaces a pod. Returns its key.
    pub fn apply(&self, pod: Pod) -> Option<String> {
        let key = pod_key(&pod)?;
        self.pods.insert(key.clone(), Arc::new(pod));
        Some(key)
    }

    pub fn delete(&self, pod: &Pod) -> Option<String> {
        let key = pod_key(pod)?;
        self.pods.remove(&key);
        Some(key)
    }

    /// Replaces the whole content after a (re)list. Returns the events that
    /// bring a consumer from the old content to the new one.
    pub fn replace(&self, pods: Vec<Pod>) -> Vec<PodEvent> {
        let mut seen = HashSet::with_capacity(pods.len());
        let mut events = Vec::with_capacity(pods.len());
        for pod in pods {
            if let Some(key) = self.apply(pod) {
                seen.insert(key.clone());
                events.push(PodEvent::Applied { key });
            }
        }

        let stale: Vec<String> = self
            .pods
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| !seen.contains(key))
            .collect();
        for key in stale {
            self.pods.remove(&key);
            events.push(PodEvent::Deleted { key });
        }

        self.synced.send_replace(true);
        events
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolves once the first full list has been loaded.
    pub async fn wait_for_sync(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives in `self`, so this only errors if `self` is gone.
        let _ = rx.wait_for(|synced| *synced).await;
    }
}

impl PodSource for PodCache {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.pods
            .get(&format!("{namespace}/{name}"))
            .map(|entry| Arc::clone(entry.value()))
    }

    fn list(&self) -> Vec<Arc<Pod>> {
        self.pods
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

/// Watches pods scheduled to `node_name`, keeps the [`PodCache`] current and
/// forwards a [`PodEvent`] for every change.
pub struct PodWatcher {
    client: Client,
    node_name: String,
    cache: Arc<PodCache>,
    events: mpsc::Sender<PodEvent>,
}

impl PodWatcher {
    pub fn new(
        client: Client,
        node_name: impl Into<String>,
        cache: Arc<PodCache>,
        events: mpsc::Sender<PodEvent>,
    ) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            cache,
            events,
        }
    }

    #[tracing::instrument(skip(self, cancellation_token), fields(node_name = %self.node_name))]
    pub async fn run(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        info!("Starting pod watcher");

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Pod watcher shutdown requested");
                    break;
                }
                result = self.watch_pods() => {
                    match result {
                        Ok(()) => {
                            warn!("Pod watch stream ended unexpectedly, restarting...");
                        }
                        Err(e) => {
                            error!("Pod watch failed: {e:?}");
                            select! {
                                _ = cancellation_token.cancelled() => break,
                                _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn watch_pods(&self) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let config = watcher::Config::default().fields(&format!("spec.nodeName={}", self.node_name));

        let mut stream = watcher(api, config).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.handle_event(event).await,
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        message: format!("Watch stream error: {e}"),
                    }));
                }
            }
        }

        Ok(())
    }

    async fn handle_event(&self, event: watcher::Event<Pod>) {
        match event {
            watcher::Event::Applied(pod) => {
                if let Some(key) = self.cache.apply(pod) {
                    self.emit(PodEvent::Applied { key }).await;
                }
            }
            watcher::Event::Deleted(pod) => {
                if let Some(key) = self.cache.delete(&pod) {
                    self.emit(PodEvent::Deleted { key }).await;
                }
            }
            watcher::Event::Restarted(pods) => {
                debug!(pods = pods.len(), "Pod watch (re)listed");
                for event in self.cache.replace(pods) {
                    self.emit(event).await;
                }
            }
        }
    }

    async fn emit(&self, event: PodEvent) {
        if let Err(e) = self.events.send(event).await {
            warn!("Failed to forward pod event: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::platform::k8s::pod::testing;

    fn pod(name: &str) -> Pod {
        testing::pod(name, &format!("uid-{name}"), &[], vec![], vec![])
    }

    #[test]
    fn apply_and_delete_update_lookup() {
        let cache = PodCache::new();
        assert_eq!(cache.apply(pod("a")), Some("default/a".to_string()));
        assert!(cache.get("default", "a").is_some());
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.delete(&pod("a")), Some("default/a".to_string()));
        assert!(cache.get("default", "a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn replace_reports_vanished_pods() {
        let cache = PodCache::new();
        cache.apply(pod("a"));
        cache.apply(pod("b"));
        assert!(!cache.has_synced());

        let events = cache.replace(vec![pod("b"), pod("c")]);

        assert_eq!(
            events,
            vec![
                PodEvent::Applied { key: "default/b".to_string() },
                PodEvent::Applied { key: "default/c".to_string() },
                PodEvent::Deleted { key: "default/a".to_string() },
            ]
        );
        assert!(cache.has_synced());
        let mut keys: Vec<String> = cache.list().iter().filter_map(|p| pod_key(p.as_ref())).collect();
        keys.sort();
        assert_eq!(keys, vec!["default/b".to_string(), "default/c".to_string()]);
    }

    #[test(tokio::test)]
    async fn wait_for_sync_resolves_after_first_list() {
        let cache = Arc::new(PodCache::new());
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.wait_for_sync().await })
        };
        cache.replace(vec![pod("a")]);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("synced in time")
            .expect("task completes");
    }
}
