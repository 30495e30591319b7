use std::collections::HashMap;

/// (pod UID, container name) of a runtime container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef {
    pub pod_uid: String,
    pub container_name: String,
}

/// Runtime container ID <-> (pod UID, container name).
#[derive(Debug, Default, Clone)]
pub struct ContainerMap {
    by_id: HashMap<String, ContainerRef>,
}

impl ContainerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `container_id`, replacing any previous ID of the same
    /// container.
    pub fn add(&mut self, pod_uid: &str, container_name: &str, container_id: &str) {
        self.remove_by_ref(pod_uid, container_name);
        self.by_id.insert(
            container_id.to_string(),
            ContainerRef {
                pod_uid: pod_uid.to_string(),
                container_name: container_name.to_string(),
            },
        );
    }

    pub fn remove_by_id(&mut self, container_id: &str) {
        self.by_id.remove(container_id);
    }

    pub fn remove_by_ref(&mut self, pod_uid: &str, container_name: &str) {
        self.by_id
            .retain(|_, r| !(r.pod_uid == pod_uid && r.container_name == container_name));
    }

    /// Keeps only the containers for which `keep` returns true.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&ContainerRef) -> bool,
    {
        self.by_id.retain(|_, r| keep(r));
    }

    pub fn container_ref(&self, container_id: &str) -> Option<&ContainerRef> {
        self.by_id.get(container_id)
    }

    pub fn container_id(&self, pod_uid: &str, container_name: &str) -> Option<&str> {
        self.by_id
            .iter()
            .find(|(_, r)| r.pod_uid == pod_uid && r.container_name == container_name)
            .map(|(id, _)| id.as_str())
    }

    /// Whether `container_id` is known to belong to the given container.
    pub fn matches(&self, container_id: &str, pod_uid: &str, container_name: &str) -> bool {
        self.container_ref(container_id)
            .is_some_and(|r| r.pod_uid == pod_uid && r.container_name == container_name)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn add_replaces_previous_container_id() {
        let mut map = ContainerMap::new();
        map.add("pod", "app", "c1");
        map.add("pod", "app", "c2");

        assert_eq!(map.len(), 1);
        assert_eq!(map.container_id("pod", "app"), Some("c2"));
        assert!(!map.matches("c1", "pod", "app"));
        assert!(map.matches("c2", "pod", "app"));
    }

    #[test]
    fn retain_drops_unmatched_containers() {
        let mut map = ContainerMap::new();
        map.add("pod-a", "app", "c1");
        map.add("pod-b", "app", "c2");

        map.retain(|r| r.pod_uid == "pod-a");

        assert_eq!(map.len(), 1);
        assert!(map.matches("c1", "pod-a", "app"));
        assert_eq!(map.container_ref("c2"), None);
    }

    #[test]
    fn remove_by_ref_and_id() {
        let mut map = ContainerMap::new();
        map.add("pod", "app", "c1");
        map.add("pod", "sidecar", "c2");

        map.remove_by_ref("pod", "app");
        assert_eq!(map.container_ref("c1"), None);

        map.remove_by_id("c2");
        assert!(map.is_empty());
    }
}
