//! Builds the Kubernetes client the watch streams run on.

use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;
use tracing::info;

use crate::k8s::types::KubernetesError;

/// Connect to the cluster this extender answers filter requests for.
///
/// An explicit kubeconfig path wins, which is the development loop against a
/// remote cluster. Without one, discovery tries the in-cluster service
/// account and then `~/.kube/config`, which is how the extender runs as a
/// deployment next to the scheduler.
pub async fn connect(kubeconfig: Option<PathBuf>) -> Result<Client, Report<KubernetesError>> {
    let config = cluster_config(kubeconfig).await?;
    info!(cluster_url = %config.cluster_url, "Connecting to Kubernetes API");

    Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
        message: "could not build an API client from the resolved cluster config".to_string(),
    })
}

async fn cluster_config(kubeconfig: Option<PathBuf>) -> Result<Config, Report<KubernetesError>> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig =
                Kubeconfig::read_from(&path).change_context(KubernetesError::ConnectionFailed {
                    message: format!("kubeconfig at {} is unreadable", path.display()),
                })?;

            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: format!("kubeconfig at {} has no usable context", path.display()),
                })
        }
        None => Config::infer()
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: "cluster discovery failed: neither an in-cluster service account nor \
                          ~/.kube/config is available"
                    .to_string(),
            }),
    }
}
