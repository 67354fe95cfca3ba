//! Kubernetes scheduler extender enforcing a pods-per-node spread policy.
//!
//! The kube-scheduler consults this service over the extender filter
//! protocol. For every scheduling decision the extender receives a pod and a
//! list of candidate nodes and answers with the subset of nodes on which the
//! pod may run without packing more replicas of its workload onto one node
//! than the workload's annotation allows.
//!
//! The decision combines two layers of state: a watch-driven cache of pods
//! and replica sets ([`k8s::ClusterCache`]) and a short-lived overlay of
//! placements this extender has just claimed ([`cache::ClaimOverlay`]), which
//! covers the window until the watch stream reflects the binding.

pub mod cache;
pub mod config;
pub mod extender;
pub mod k8s;
pub mod logging;
