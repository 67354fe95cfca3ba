//! Per-node occupancy check: can this pod land on this node under its
//! workload's spread policy?

use std::collections::HashSet;
use std::fmt;

use crate::cache::ClaimOverlay;
use crate::extender::policy::SpreadPolicy;
use crate::k8s::ClusterCache;

/// Spread floor: with few enough replicas, one pod per node covers the fleet
/// and pure anti-affinity wins over the annotated cap.
pub const MIN_PODS_PER_NODE: i32 = 1;

/// Why a node was rejected for a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MinPodsReached,
    MaxPodsReached,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinPodsReached => write!(f, "already running minimum pods per node."),
            Self::MaxPodsReached => write!(f, "already running maximum pods per node."),
        }
    }
}

/// Evaluate one candidate node against the spread policy.
///
/// Occupancy unions the watch cache's node index with the claim overlay, so
/// placements this extender accepted moments ago count even before the watch
/// stream reflects them. Both layers may transiently overcount; neither can
/// permanently undercount.
pub fn evaluate(
    node_name: &str,
    policy: &SpreadPolicy,
    cluster: &ClusterCache,
    claims: &ClaimOverlay,
) -> Result<(), RejectReason> {
    let mut names: HashSet<String> = cluster
        .pods_on_node(node_name)
        .into_iter()
        .map(|record| record.name)
        .collect();
    if let Some(claimed) = claims.get(node_name) {
        names.extend(claimed);
    }

    let pod_count = names
        .iter()
        .filter(|name| belongs_to_workload(name, &policy.workload))
        .count() as i32;

    let strict = policy.replicas <= MIN_PODS_PER_NODE
        || MIN_PODS_PER_NODE >= policy.replicas - policy.max_pods_per_node;
    if strict {
        if pod_count == 0 {
            Ok(())
        } else {
            Err(RejectReason::MinPodsReached)
        }
    } else if pod_count < policy.max_pods_per_node {
        Ok(())
    } else {
        Err(RejectReason::MaxPodsReached)
    }
}

/// A pod belongs to workload `W` iff it is named `W-<suffix>` with a
/// non-empty suffix. Replica sets name their pods with that prefix, and the
/// name test also covers pods whose owner reference is not yet visible
/// through the watch.
pub fn belongs_to_workload(pod_name: &str, workload: &str) -> bool {
    pod_name
        .strip_prefix(workload)
        .is_some_and(|rest| rest.starts_with('-') && rest.len() > 1)
}
