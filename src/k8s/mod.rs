//! Kubernetes-facing infrastructure: client setup and the watch-driven
//! cluster cache.

pub mod client;
pub mod cluster_cache;
pub mod types;

pub use cluster_cache::ClusterCache;
pub use cluster_cache::ClusterWatcher;
pub use cluster_cache::PodRecord;
pub use cluster_cache::ReplicaSetRecord;
pub use types::KubernetesError;
