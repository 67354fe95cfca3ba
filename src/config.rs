use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "k8s-scheduler-extender",
    about = "Scheduler extender that spreads replica-set pods across nodes"
)]
pub struct Args {
    #[arg(
        long,
        env = "PORT",
        default_value_t = 8080,
        help = "HTTP listen port for the extender endpoints"
    )]
    pub port: u16,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to in-cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "WATCH_NAMESPACE",
        help = "Kubernetes namespace to watch (empty for all namespaces)"
    )]
    pub namespace: Option<String>,

    #[arg(
        long,
        env = "CLAIM_TTL_SECS",
        default_value_t = 60,
        help = "Seconds a claimed placement stays visible before the watch stream is trusted again"
    )]
    pub claim_ttl_secs: u64,
}
