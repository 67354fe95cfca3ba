//! Wire types of the kube-scheduler extender filter protocol.
//!
//! The upstream Go structs (`k8s.io/kube-scheduler/extender/v1`) marshal with
//! capitalized field names, so the serde names here follow suit. The embedded
//! pod and node payloads are the full `k8s-openapi` objects and pass through
//! the decision unmutated.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeList {
    #[serde(default)]
    pub items: Vec<Node>,
}

/// Filter request: the pod being scheduled plus its candidate nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtenderArgs {
    #[serde(rename = "Pod", default)]
    pub pod: Option<Pod>,
    #[serde(rename = "Nodes", default)]
    pub nodes: Option<NodeList>,
    /// Populated instead of `Nodes` when the scheduler runs node-cache
    /// capable extenders; this extender does not opt into that mode.
    #[serde(rename = "NodeNames", default, skip_serializing_if = "Option::is_none")]
    pub node_names: Option<Vec<String>>,
}

/// Filter response: the nodes the pod may run on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderFilterResult {
    #[serde(rename = "Nodes")]
    pub nodes: Option<NodeList>,
    #[serde(rename = "FailedNodes", default)]
    pub failed_nodes: BTreeMap<String, String>,
    #[serde(rename = "Error", default)]
    pub error: String,
}

impl ExtenderFilterResult {
    /// Pass the candidate nodes through unchanged.
    pub fn pass_through(items: Vec<Node>) -> Self {
        Self {
            nodes: Some(NodeList { items }),
            ..Default::default()
        }
    }

    /// A request-local failure; the caller maps a non-empty error to HTTP 500.
    pub fn from_error(message: String) -> Self {
        Self {
            nodes: None,
            failed_nodes: BTreeMap::new(),
            error: message,
        }
    }
}
