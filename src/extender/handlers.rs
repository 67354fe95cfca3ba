//! Request handlers for the extender endpoints.

use std::sync::Arc;

use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::Body;
use poem::Response;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cache::ClaimOverlay;
use crate::extender::fitness;
use crate::extender::policy;
use crate::extender::types::ExtenderArgs;
use crate::extender::types::ExtenderFilterResult;
use crate::extender::types::NodeList;
use crate::k8s::ClusterCache;

/// Shared state handed to every request handler. The cluster cache is
/// read-only here; only the claim overlay is written, and only on an
/// accepted placement.
pub struct ExtenderContext {
    pub cluster: Arc<ClusterCache>,
    pub claims: Arc<ClaimOverlay>,
}

/// Core filter decision, separated from the HTTP plumbing for tests.
///
/// An ineligible pod passes all candidates through unchanged. For an
/// eligible pod the candidates are evaluated in the order given and the
/// first fitting node wins: the placement is claimed in the overlay and the
/// response narrows to exactly that node, so the scheduler cannot re-place
/// onto a node this extender never evaluated. Rejected nodes are logged and
/// dropped; `FailedNodes` stays empty on the success path.
pub fn filter_pod(args: ExtenderArgs, context: &ExtenderContext) -> ExtenderFilterResult {
    let candidates = args.nodes.map(|list| list.items).unwrap_or_default();

    let Some(pod) = args.pod else {
        warn!("Filter request without a pod, passing candidates through");
        return ExtenderFilterResult::pass_through(candidates);
    };
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    info!(pod = %pod_name, candidates = candidates.len(), "Filter request");

    let Some(spread) = policy::classify(&pod, &context.cluster) else {
        info!(pod = %pod_name, "Pod is not subject to the spread policy");
        return ExtenderFilterResult::pass_through(candidates);
    };

    let mut accepted = Vec::new();
    for node in candidates {
        let Some(node_name) = node.metadata.name.clone() else {
            warn!(pod = %pod_name, "Skipping candidate node without a name");
            continue;
        };

        match fitness::evaluate(&node_name, &spread, &context.cluster, &context.claims) {
            Ok(()) => {
                // Claim the placement so concurrent requests for the same
                // workload see it before the watch stream catches up.
                context.claims.append(&node_name, &pod_name);
                info!(
                    pod = %pod_name,
                    node = %node_name,
                    workload = %spread.workload,
                    "Pod can be scheduled"
                );
                accepted.push(node);
                break;
            }
            Err(reason) => {
                info!(
                    pod = %pod_name,
                    node = %node_name,
                    reason = %reason,
                    "Cannot schedule on node"
                );
            }
        }
    }

    ExtenderFilterResult {
        nodes: Some(NodeList { items: accepted }),
        ..Default::default()
    }
}

/// `POST /podspernode/filter`
#[handler]
pub async fn filter(body: Body, context: Data<&Arc<ExtenderContext>>) -> Response {
    let bytes = match body.into_vec().await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to read filter request body: {e}");
            return encode_result(ExtenderFilterResult::from_error(e.to_string()));
        }
    };

    let result = match serde_json::from_slice::<ExtenderArgs>(&bytes) {
        Ok(args) => filter_pod(args, &context),
        Err(e) => {
            error!("Error in json decode: {e}");
            ExtenderFilterResult::from_error(e.to_string())
        }
    };

    encode_result(result)
}

/// `GET /`
#[handler]
pub fn index() -> &'static str {
    "Welcome to k8s-scheduler-extender!\n"
}

fn encode_result(result: ExtenderFilterResult) -> Response {
    let status = if result.error.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    match serde_json::to_vec(&result) {
        Ok(body) => Response::builder()
            .status(status)
            .content_type("application/json")
            .body(body),
        Err(e) => {
            error!("Error in json encode: {e}");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .content_type("application/json")
                .body(
                    serde_json::json!({ "Error": e.to_string() }).to_string(),
                )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use crate::cache::CLAIM_TTL;
    use crate::extender::policy::MAX_PODS_PER_NODE_ANNOTATION;
    use crate::k8s::PodRecord;
    use crate::k8s::ReplicaSetRecord;

    use super::*;

    fn test_context() -> ExtenderContext {
        ExtenderContext {
            cluster: Arc::new(ClusterCache::new()),
            claims: Arc::new(ClaimOverlay::new(CLAIM_TTL)),
        }
    }

    fn add_replica_set(context: &ExtenderContext, name: &str, replicas: i32) {
        context.cluster.apply_replica_set(ReplicaSetRecord {
            namespace: "default".to_string(),
            name: name.to_string(),
            replicas,
        });
    }

    fn add_pod_on_node(context: &ExtenderContext, name: &str, node: &str) {
        context.cluster.apply_pod(PodRecord {
            namespace: "default".to_string(),
            name: name.to_string(),
            node_name: Some(node.to_string()),
        });
    }

    fn eligible_pod(name: &str, annotation: &str, replica_set: &str) -> Pod {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            MAX_PODS_PER_NODE_ANNOTATION.to_string(),
            annotation.to_string(),
        );
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(annotations),
                owner_references: Some(vec![OwnerReference {
                    kind: "ReplicaSet".to_string(),
                    name: replica_set.to_string(),
                    api_version: "apps/v1".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn plain_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn args(pod: Pod, node_names: &[&str]) -> ExtenderArgs {
        ExtenderArgs {
            pod: Some(pod),
            nodes: Some(NodeList {
                items: node_names.iter().map(|name| node(name)).collect(),
            }),
            node_names: None,
        }
    }

    fn result_node_names(result: &ExtenderFilterResult) -> Vec<String> {
        result
            .nodes
            .as_ref()
            .map(|list| {
                list.items
                    .iter()
                    .filter_map(|node| node.metadata.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn ineligible_pod_passes_candidates_through() {
        let context = test_context();
        let result = filter_pod(args(plain_pod("lonely"), &["n1", "n2", "n3"]), &context);

        assert_eq!(result_node_names(&result), vec!["n1", "n2", "n3"]);
        assert!(result.failed_nodes.is_empty());
        assert_eq!(result.error, "");
        // No claim is recorded for a pass-through.
        assert_eq!(context.claims.get("n1"), None);
    }

    #[tokio::test]
    async fn first_fitting_node_wins_and_is_claimed() {
        let context = test_context();
        add_replica_set(&context, "web-7d9f", 2);

        let result = filter_pod(
            args(eligible_pod("web-7d9f-new", "2", "web-7d9f"), &["n1", "n2", "n3"]),
            &context,
        );

        assert_eq!(result_node_names(&result), vec!["n1"]);
        assert_eq!(
            context.claims.get("n1"),
            Some(vec!["web-7d9f-new".to_string()])
        );
    }

    #[tokio::test]
    async fn occupied_head_node_is_skipped() {
        let context = test_context();
        add_replica_set(&context, "web-7d9f", 2);
        add_pod_on_node(&context, "web-7d9f-abc", "n1");

        let result = filter_pod(
            args(eligible_pod("web-7d9f-new", "2", "web-7d9f"), &["n1", "n2", "n3"]),
            &context,
        );

        assert_eq!(result_node_names(&result), vec!["n2"]);
        assert!(result.failed_nodes.is_empty());
        assert_eq!(
            context.claims.get("n2"),
            Some(vec!["web-7d9f-new".to_string()])
        );
    }

    #[tokio::test]
    async fn no_fitting_node_yields_empty_result() {
        let context = test_context();
        add_replica_set(&context, "web-7d9f", 10);
        add_pod_on_node(&context, "web-7d9f-a", "n1");
        add_pod_on_node(&context, "web-7d9f-b", "n1");

        let result = filter_pod(
            args(eligible_pod("web-7d9f-new", "2", "web-7d9f"), &["n1"]),
            &context,
        );

        assert_eq!(result_node_names(&result), Vec::<String>::new());
        assert_eq!(result.error, "");
    }

    #[tokio::test]
    async fn sequential_claims_spread_a_workload() {
        let context = test_context();
        add_replica_set(&context, "web-7d9f", 5);

        let first = filter_pod(
            args(eligible_pod("web-7d9f-one", "1", "web-7d9f"), &["n1", "n2"]),
            &context,
        );
        assert_eq!(result_node_names(&first), vec!["n1"]);

        let second = filter_pod(
            args(eligible_pod("web-7d9f-two", "1", "web-7d9f"), &["n1", "n2"]),
            &context,
        );
        assert_eq!(result_node_names(&second), vec!["n2"]);
    }

    #[tokio::test]
    async fn missing_nodes_yield_empty_result() {
        let context = test_context();
        add_replica_set(&context, "web-7d9f", 2);

        let request = ExtenderArgs {
            pod: Some(eligible_pod("web-7d9f-new", "2", "web-7d9f")),
            nodes: None,
            node_names: None,
        };
        let result = filter_pod(request, &context);

        assert_eq!(result_node_names(&result), Vec::<String>::new());
        assert_eq!(result.error, "");
    }

    #[tokio::test]
    async fn missing_pod_passes_candidates_through() {
        let context = test_context();

        let request = ExtenderArgs {
            pod: None,
            nodes: Some(NodeList {
                items: vec![node("n1")],
            }),
            node_names: None,
        };
        let result = filter_pod(request, &context);

        assert_eq!(result_node_names(&result), vec!["n1"]);
    }

    #[tokio::test]
    async fn nameless_candidate_is_skipped() {
        let context = test_context();
        add_replica_set(&context, "web-7d9f", 2);

        let request = ExtenderArgs {
            pod: Some(eligible_pod("web-7d9f-new", "2", "web-7d9f")),
            nodes: Some(NodeList {
                items: vec![Node::default(), node("n2")],
            }),
            node_names: None,
        };
        let result = filter_pod(request, &context);

        assert_eq!(result_node_names(&result), vec!["n2"]);
    }
}
