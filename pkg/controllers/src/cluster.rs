use anyhow::{Context, bail};
use async_trait::async_trait;
use pkg_constants::state::{DEPLOYMENTS_PREFIX, NODES_PREFIX, PODS_PREFIX};
use pkg_state::client::StateStore;
use pkg_types::deployment::{Deployment, WorkloadRef};
use pkg_types::node::Node;
use pkg_types::pod::{Pod, PodStatus};
use std::collections::HashMap;
use tracing::warn;

/// Point-in-time reads of cluster state.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    async fn list_nodes(&self) -> anyhow::Result<Vec<Node>>;

    /// Pods in `namespace` whose labels match every entry of `selector`.
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &HashMap<String, String>,
    ) -> anyhow::Result<Vec<Pod>>;

    /// Current definition of a workload, `None` if it no longer exists.
    async fn get_workload(&self, workload: &WorkloadRef) -> anyhow::Result<Option<Deployment>>;
}

/// Writes applied by a rebalance pass.
#[async_trait]
pub trait MutationSink: Send + Sync {
    /// Re-bind a pod to `target_node`.
    async fn patch_pod_node(
        &self,
        namespace: &str,
        pod: &str,
        target_node: &str,
    ) -> anyhow::Result<()>;

    /// Set a workload's desired replica count.
    async fn patch_workload_replicas(
        &self,
        workload: &WorkloadRef,
        replicas: u32,
    ) -> anyhow::Result<()>;
}

pub fn node_key(name: &str) -> String {
    format!("{}{}", NODES_PREFIX, name)
}

pub fn pod_key(namespace: &str, name: &str) -> String {
    format!("{}{}/{}", PODS_PREFIX, namespace, name)
}

pub fn deployment_key(namespace: &str, name: &str) -> String {
    format!("{}{}/{}", DEPLOYMENTS_PREFIX, namespace, name)
}

/// Cluster access backed by the registry in a [`StateStore`].
#[derive(Clone)]
pub struct StoreCluster {
    store: StateStore,
}

impl StoreCluster {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ClusterReader for StoreCluster {
    async fn list_nodes(&self) -> anyhow::Result<Vec<Node>> {
        let entries = self.store.list_prefix(NODES_PREFIX).await?;
        let mut nodes = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_slice::<Node>(&value) {
                Ok(node) => nodes.push(node),
                Err(e) => warn!("Skipping malformed node {}: {}", key, e),
            }
        }
        Ok(nodes)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &HashMap<String, String>,
    ) -> anyhow::Result<Vec<Pod>> {
        let prefix = format!("{}{}/", PODS_PREFIX, namespace);
        let entries = self.store.list_prefix(&prefix).await?;
        let mut pods = Vec::new();
        for (key, value) in entries {
            match serde_json::from_slice::<Pod>(&value) {
                Ok(pod) if pod.matches_selector(selector) => pods.push(pod),
                Ok(_) => {}
                Err(e) => warn!("Skipping malformed pod {}: {}", key, e),
            }
        }
        Ok(pods)
    }

    async fn get_workload(&self, workload: &WorkloadRef) -> anyhow::Result<Option<Deployment>> {
        let key = deployment_key(&workload.namespace, &workload.name);
        self.store
            .get_json(&key)
            .await
            .with_context(|| format!("failed to decode {}", key))
    }
}

#[async_trait]
impl MutationSink for StoreCluster {
    async fn patch_pod_node(
        &self,
        namespace: &str,
        pod: &str,
        target_node: &str,
    ) -> anyhow::Result<()> {
        let key = pod_key(namespace, pod);
        let Some(mut current) = self.store.get_json::<Pod>(&key).await? else {
            bail!("pod {}/{} not found", namespace, pod);
        };
        // The target node's agent picks the pod up from Scheduled.
        current.node_name = Some(target_node.to_string());
        current.container_id = None;
        current.status = PodStatus::Scheduled;
        self.store.put_json(&key, &current).await
    }

    async fn patch_workload_replicas(
        &self,
        workload: &WorkloadRef,
        replicas: u32,
    ) -> anyhow::Result<()> {
        let key = deployment_key(&workload.namespace, &workload.name);
        let Some(mut deploy) = self.store.get_json::<Deployment>(&key).await? else {
            bail!("deployment {} not found", workload);
        };
        if deploy.spec.replicas == replicas {
            return Ok(());
        }
        deploy.spec.replicas = replicas;
        deploy.generation += 1;
        self.store.put_json(&key, &deploy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pkg_types::deployment::DeploymentSpec;
    use pkg_types::node::NodeStatus;
    use pkg_types::pod::PodSpec;

    async fn seeded_store() -> StoreCluster {
        let store = StateStore::in_memory().await.unwrap();
        for name in ["node-1", "node-2"] {
            let node = Node {
                name: name.to_string(),
                status: NodeStatus::Ready,
                labels: HashMap::new(),
                unschedulable: false,
                registered_at: Utc::now(),
            };
            store.put_json(&node_key(name), &node).await.unwrap();
        }
        store.put(&node_key("broken"), b"not json").await.unwrap();

        for (name, app, ns) in [
            ("web-0", "web", "default"),
            ("web-1", "web", "default"),
            ("api-0", "api", "default"),
            ("web-x", "web", "staging"),
        ] {
            let pod = Pod {
                name: name.to_string(),
                namespace: ns.to_string(),
                spec: PodSpec::default(),
                status: PodStatus::Running,
                container_id: Some(format!("{}-ctr", name)),
                node_name: Some("node-1".to_string()),
                labels: HashMap::from([("app".to_string(), app.to_string())]),
                created_at: Utc::now(),
            };
            store.put_json(&pod_key(ns, name), &pod).await.unwrap();
        }

        let deploy = Deployment {
            name: "web".to_string(),
            namespace: "default".to_string(),
            spec: DeploymentSpec {
                replicas: 2,
                template: PodSpec::default(),
                selector: HashMap::new(),
            },
            generation: 1,
            created_at: Utc::now(),
        };
        store
            .put_json(&deployment_key("default", "web"), &deploy)
            .await
            .unwrap();

        StoreCluster::new(store)
    }

    #[tokio::test]
    async fn test_reads_registry() {
        let cluster = seeded_store().await;

        let nodes = cluster.list_nodes().await.unwrap();
        let mut names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["node-1", "node-2"]);

        let deploy = cluster
            .get_workload(&WorkloadRef::new("default", "web"))
            .await
            .unwrap()
            .unwrap();
        let pods = cluster
            .list_pods("default", &deploy.pod_selector())
            .await
            .unwrap();
        let mut pod_names: Vec<_> = pods.iter().map(|p| p.name.as_str()).collect();
        pod_names.sort();
        assert_eq!(pod_names, vec!["web-0", "web-1"]);

        assert!(
            cluster
                .get_workload(&WorkloadRef::new("default", "gone"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_patch_pod_node_reschedules() {
        let cluster = seeded_store().await;
        cluster
            .patch_pod_node("default", "web-1", "node-2")
            .await
            .unwrap();

        let pod: Pod = cluster
            .store
            .get_json(&pod_key("default", "web-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pod.node_name.as_deref(), Some("node-2"));
        assert_eq!(pod.status, PodStatus::Scheduled);
        assert!(pod.container_id.is_none());

        assert!(
            cluster
                .patch_pod_node("default", "missing", "node-2")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_patch_replicas_bumps_generation() {
        let cluster = seeded_store().await;
        let web = WorkloadRef::new("default", "web");

        cluster.patch_workload_replicas(&web, 1).await.unwrap();
        let deploy = cluster.get_workload(&web).await.unwrap().unwrap();
        assert_eq!(deploy.spec.replicas, 1);
        assert_eq!(deploy.generation, 2);

        // Unchanged count is not rewritten
        cluster.patch_workload_replicas(&web, 1).await.unwrap();
        let deploy = cluster.get_workload(&web).await.unwrap().unwrap();
        assert_eq!(deploy.generation, 2);

        assert!(
            cluster
                .patch_workload_replicas(&WorkloadRef::new("default", "gone"), 1)
                .await
                .is_err()
        );
    }
}
