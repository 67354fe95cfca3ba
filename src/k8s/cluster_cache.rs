//! Watch-driven cache of pods and replica sets.
//!
//! This component maintains an in-memory view of the cluster, populated by
//! watching pod and replica-set events. Pods are additionally indexed by the
//! node they are assigned to, which is the lookup the filter decision runs
//! against. Readers always see the most recent coherent state; there is no
//! error surface towards request handlers.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cache::ClaimOverlay;
use crate::k8s::types::KubernetesError;

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Key for identifying a namespaced object in the cache.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct ResourceKey {
    namespace: String,
    name: String,
}

impl ResourceKey {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// The slice of a pod the spread decision needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    /// Node the pod is assigned to; `None` until the scheduler has bound it.
    pub node_name: Option<String>,
}

impl PodRecord {
    /// Reduce a watch-stream pod to the fields the cache keeps.
    ///
    /// Returns `None` for objects without a name; the event loop logs and
    /// skips those instead of crashing.
    pub fn from_pod(pod: Pod) -> Option<Self> {
        let name = pod.metadata.name?;
        let namespace = pod.metadata.namespace.unwrap_or_else(|| "default".to_string());
        let node_name = pod
            .spec
            .and_then(|spec| spec.node_name)
            .filter(|node| !node.is_empty());
        Some(Self {
            namespace,
            name,
            node_name,
        })
    }
}

/// The slice of a replica set the spread decision needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSetRecord {
    pub namespace: String,
    pub name: String,
    /// Desired replica count; an unset `spec.replicas` counts as 0.
    pub replicas: i32,
}

impl ReplicaSetRecord {
    pub fn from_replica_set(replica_set: ReplicaSet) -> Option<Self> {
        let name = replica_set.metadata.name?;
        let namespace = replica_set
            .metadata
            .namespace
            .unwrap_or_else(|| "default".to_string());
        let replicas = replica_set
            .spec
            .and_then(|spec| spec.replicas)
            .unwrap_or(0);
        Some(Self {
            namespace,
            name,
            replicas,
        })
    }
}

/// In-memory store of pods and replica sets with a node-name secondary index.
///
/// Request handlers only read; the watch tasks are the single writer per
/// resource, so every pod appears under exactly one node key (or none while
/// unbound) between any two event applications.
pub struct ClusterCache {
    pods: DashMap<ResourceKey, PodRecord>,
    node_index: DashMap<String, HashSet<ResourceKey>>,
    replica_sets: DashMap<ResourceKey, ReplicaSetRecord>,
    pods_synced: AtomicBool,
    replica_sets_synced: AtomicBool,
    sync_notify: Notify,
}

impl Default for ClusterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterCache {
    pub fn new() -> Self {
        Self {
            pods: DashMap::new(),
            node_index: DashMap::new(),
            replica_sets: DashMap::new(),
            pods_synced: AtomicBool::new(false),
            replica_sets_synced: AtomicBool::new(false),
            sync_notify: Notify::new(),
        }
    }

    /// Pods currently assigned to `node_name` according to the watch stream.
    ///
    /// `node_name` must be non-empty; unbound pods are never indexed.
    pub fn pods_on_node(&self, node_name: &str) -> Vec<PodRecord> {
        let keys: Vec<ResourceKey> = match self.node_index.get(node_name) {
            Some(set) => set.iter().cloned().collect(),
            None => return Vec::new(),
        };
        keys.iter()
            .filter_map(|key| self.pods.get(key).map(|record| record.clone()))
            .collect()
    }

    /// Point lookup of a replica set by namespace and name.
    pub fn get_replica_set(&self, namespace: &str, name: &str) -> Option<ReplicaSetRecord> {
        self.replica_sets
            .get(&ResourceKey::new(namespace, name))
            .map(|record| record.clone())
    }

    /// True once the initial list of both resources has been applied.
    pub fn is_synced(&self) -> bool {
        self.pods_synced.load(Ordering::Acquire)
            && self.replica_sets_synced.load(Ordering::Acquire)
    }

    /// Block until the initial list-then-watch sync has completed for both
    /// pods and replica sets. The service must not accept filter requests
    /// before this resolves.
    pub async fn wait_until_synced(&self) {
        while !self.is_synced() {
            let notified = self.sync_notify.notified();
            if self.is_synced() {
                break;
            }
            notified.await;
        }
    }

    /// Insert or update a pod, keeping the node index in step. The new
    /// mapping is inserted before the stale one is dropped so concurrent
    /// readers can momentarily overcount but never miss the pod.
    pub fn apply_pod(&self, record: PodRecord) {
        let key = ResourceKey::new(&record.namespace, &record.name);
        if let Some(node) = &record.node_name {
            self.node_index
                .entry(node.clone())
                .or_default()
                .insert(key.clone());
        }
        let old = self.pods.insert(key.clone(), record.clone());
        if let Some(old_node) = old.and_then(|previous| previous.node_name) {
            if record.node_name.as_deref() != Some(old_node.as_str()) {
                self.unindex(&old_node, &key);
            }
        }
    }

    /// Remove a pod from the store and the node index, returning the last
    /// observed record so callers can react to the deletion.
    pub fn delete_pod(&self, namespace: &str, name: &str) -> Option<PodRecord> {
        let key = ResourceKey::new(namespace, name);
        let (_, record) = self.pods.remove(&key)?;
        if let Some(node) = &record.node_name {
            self.unindex(node, &key);
        }
        Some(record)
    }

    /// Replace the pod store with a freshly listed state, returning the
    /// records that vanished during the watch gap.
    pub fn replace_pods(&self, records: Vec<PodRecord>) -> Vec<PodRecord> {
        let fresh: HashSet<ResourceKey> = records
            .iter()
            .map(|record| ResourceKey::new(&record.namespace, &record.name))
            .collect();
        let stale: Vec<ResourceKey> = self
            .pods
            .iter()
            .filter(|entry| !fresh.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        let mut dropped = Vec::new();
        for key in stale {
            if let Some(record) = self.delete_pod(&key.namespace, &key.name) {
                dropped.push(record);
            }
        }
        for record in records {
            self.apply_pod(record);
        }
        dropped
    }

    pub fn apply_replica_set(&self, record: ReplicaSetRecord) {
        let key = ResourceKey::new(&record.namespace, &record.name);
        self.replica_sets.insert(key, record);
    }

    pub fn delete_replica_set(&self, namespace: &str, name: &str) {
        self.replica_sets.remove(&ResourceKey::new(namespace, name));
    }

    pub fn replace_replica_sets(&self, records: Vec<ReplicaSetRecord>) {
        let fresh: HashSet<ResourceKey> = records
            .iter()
            .map(|record| ResourceKey::new(&record.namespace, &record.name))
            .collect();
        self.replica_sets.retain(|key, _| fresh.contains(key));
        for record in records {
            self.apply_replica_set(record);
        }
    }

    fn mark_pods_synced(&self) {
        self.pods_synced.store(true, Ordering::Release);
        self.sync_notify.notify_waiters();
    }

    fn mark_replica_sets_synced(&self) {
        self.replica_sets_synced.store(true, Ordering::Release);
        self.sync_notify.notify_waiters();
    }

    fn unindex(&self, node: &str, key: &ResourceKey) {
        if let Some(mut set) = self.node_index.get_mut(node) {
            set.remove(key);
            let empty = set.is_empty();
            drop(set);
            if empty {
                self.node_index.remove_if(node, |_, members| members.is_empty());
            }
        }
    }
}

/// Drives the pod and replica-set watch streams into a [`ClusterCache`] and
/// keeps the claim overlay consistent with observed pod deletions.
pub struct ClusterWatcher {
    client: Client,
    namespace: Option<String>,
    cache: Arc<ClusterCache>,
    claims: Arc<ClaimOverlay>,
}

impl ClusterWatcher {
    pub fn new(
        client: Client,
        namespace: Option<String>,
        cache: Arc<ClusterCache>,
        claims: Arc<ClaimOverlay>,
    ) -> Self {
        Self {
            client,
            namespace,
            cache,
            claims,
        }
    }

    /// Watch pods until cancelled, reconnecting on stream failure.
    #[tracing::instrument(skip(self, token), fields(namespace = ?self.namespace))]
    pub async fn run_pods(&self, token: CancellationToken) -> Result<(), Report<KubernetesError>> {
        info!("Starting pod watcher");

        loop {
            select! {
                _ = token.cancelled() => {
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
                            tokio::time::sleep(WATCH_RETRY_DELAY).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Watch replica sets until cancelled, reconnecting on stream failure.
    #[tracing::instrument(skip(self, token), fields(namespace = ?self.namespace))]
    pub async fn run_replica_sets(
        &self,
        token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        info!("Starting replica-set watcher");

        loop {
            select! {
                _ = token.cancelled() => {
                    info!("Replica-set watcher shutdown requested");
                    break;
                }
                result = self.watch_replica_sets() => {
                    match result {
                        Ok(()) => {
                            warn!("Replica-set watch stream ended unexpectedly, restarting...");
                        }
                        Err(e) => {
                            error!("Replica-set watch failed: {e:?}");
                            tokio::time::sleep(WATCH_RETRY_DELAY).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn watch_pods(&self) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let mut stream = watcher(api, Config::default()).boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.handle_pod_event(event),
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        resource: "pods",
                        message: format!("watch stream error: {e}"),
                    }));
                }
            }
        }

        Ok(())
    }

    async fn watch_replica_sets(&self) -> Result<(), Report<KubernetesError>> {
        let api: Api<ReplicaSet> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let mut stream = watcher(api, Config::default()).boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.handle_replica_set_event(event),
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        resource: "replicasets",
                        message: format!("watch stream error: {e}"),
                    }));
                }
            }
        }

        Ok(())
    }

    fn handle_pod_event(&self, event: Event<Pod>) {
        match event {
            Event::Applied(pod) => {
                let Some(record) = PodRecord::from_pod(pod) else {
                    warn!("cannot reduce pod event, object has no name");
                    return;
                };
                debug!(pod = %record.name, node = ?record.node_name, "Pod applied");
                self.cache.apply_pod(record);
            }
            Event::Deleted(pod) => {
                let Some(record) = PodRecord::from_pod(pod) else {
                    warn!("cannot reduce pod event, object has no name");
                    return;
                };
                debug!(pod = %record.name, node = ?record.node_name, "Pod deleted");
                if let Some(observed) = self.cache.delete_pod(&record.namespace, &record.name) {
                    self.forget_claim(&observed);
                } else {
                    // Deleted before we ever indexed it; the claim may still
                    // reference the node named in the event itself.
                    self.forget_claim(&record);
                }
            }
            Event::Restarted(pods) => {
                let records = pods.into_iter().filter_map(PodRecord::from_pod).collect();
                let dropped = self.cache.replace_pods(records);
                for record in dropped {
                    debug!(pod = %record.name, "Pod vanished during watch gap");
                    self.forget_claim(&record);
                }
                info!(count = self.cache.pods.len(), "Pod store synced");
                self.cache.mark_pods_synced();
            }
        }
    }

    fn handle_replica_set_event(&self, event: Event<ReplicaSet>) {
        match event {
            Event::Applied(replica_set) => {
                let Some(record) = ReplicaSetRecord::from_replica_set(replica_set) else {
                    warn!("cannot reduce replica-set event, object has no name");
                    return;
                };
                debug!(replica_set = %record.name, replicas = record.replicas, "ReplicaSet applied");
                self.cache.apply_replica_set(record);
            }
            Event::Deleted(replica_set) => {
                let Some(record) = ReplicaSetRecord::from_replica_set(replica_set) else {
                    warn!("cannot reduce replica-set event, object has no name");
                    return;
                };
                debug!(replica_set = %record.name, "ReplicaSet deleted");
                self.cache.delete_replica_set(&record.namespace, &record.name);
            }
            Event::Restarted(replica_sets) => {
                let records = replica_sets
                    .into_iter()
                    .filter_map(ReplicaSetRecord::from_replica_set)
                    .collect();
                self.cache.replace_replica_sets(records);
                info!(count = self.cache.replica_sets.len(), "ReplicaSet store synced");
                self.cache.mark_replica_sets_synced();
            }
        }
    }

    /// A deleted pod must not linger in the claim overlay and count against
    /// future placements on its node.
    fn forget_claim(&self, record: &PodRecord) {
        if let Some(node) = &record.node_name {
            self.claims.remove_pod_name(node, &record.name);
        }
    }
}
