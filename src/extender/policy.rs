//! Decides whether a pod is subject to the spread policy and derives the
//! policy parameters from its owning replica set.

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;
use tracing::info;

use crate::k8s::ClusterCache;

/// Pod annotation carrying the per-node replica cap.
///
/// Read from the pod, not the replica set: the annotation only reaches pods
/// on the next rollout, which makes the cap changeable per rollout without
/// editing the replica set itself.
pub const MAX_PODS_PER_NODE_ANNOTATION: &str =
    "k8s-scheduler-extender.ridecell.io/maxPodsPerNode";

/// Cap used when the annotation is present but empty or unparseable.
pub const DEFAULT_MAX_PODS_PER_NODE: i32 = 2;

/// Spread parameters for one eligible pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpreadPolicy {
    /// As parsed from the annotation; zero or negative values are kept and
    /// simply make every node ineligible.
    pub max_pods_per_node: i32,
    /// Desired replica count of the owning replica set.
    pub replicas: i32,
    /// Workload identity: the owning replica set's name. Pods named
    /// `<workload>-<suffix>` count towards this workload's occupancy.
    pub workload: String,
}

/// Classify a pod against the spread policy.
///
/// Returns `None` when the pod is not subject to the policy: no annotation,
/// no replica-set owner, or the owner is not (yet) in the cache. All three
/// are treated as "not eligible" rather than failures, because an extender
/// that omits a decision must not block scheduling.
pub fn classify(pod: &Pod, cluster: &ClusterCache) -> Option<SpreadPolicy> {
    let pod_name = pod.metadata.name.as_deref().unwrap_or("unknown");

    let raw = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(MAX_PODS_PER_NODE_ANNOTATION));
    let Some(raw) = raw else {
        debug!(pod = pod_name, "Pod carries no max-pods-per-node annotation");
        return None;
    };
    let max_pods_per_node = match raw.parse::<i32>() {
        Ok(value) => value,
        Err(_) => {
            debug!(
                pod = pod_name,
                value = %raw,
                default = DEFAULT_MAX_PODS_PER_NODE,
                "Annotation value unparseable, using default"
            );
            DEFAULT_MAX_PODS_PER_NODE
        }
    };

    let owner = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|owners| owners.iter().find(|owner| owner.kind == "ReplicaSet"));
    let Some(owner) = owner else {
        info!(pod = pod_name, "Pod is not owned by a replica set");
        return None;
    };

    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let Some(replica_set) = cluster.get_replica_set(namespace, &owner.name) else {
        info!(
            pod = pod_name,
            replica_set = %owner.name,
            "Owning replica set not found in cache"
        );
        return None;
    };

    Some(SpreadPolicy {
        max_pods_per_node,
        replicas: replica_set.replicas,
        workload: replica_set.name,
    })
}
