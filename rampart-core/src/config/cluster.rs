use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Name(pub String);

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Definition {
    /// Namespaces excluded from snapshots unless an explicit include-list is
    /// given for the run.
    #[serde(default = "default_system_namespaces", alias = "system_namespaces")]
    pub system_namespaces: Vec<String>,
    /// Snapshot time-to-live passed to the snapshot service; the run's
    /// retention window is used when unset.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
    /// kubeconfig context to operate on, if not the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubecontext: Option<String>,
}

impl Default for Definition {
    fn default() -> Self {
        Definition {
            system_namespaces: default_system_namespaces(),
            ttl: None,
            kubecontext: None,
        }
    }
}

fn default_system_namespaces() -> Vec<String> {
    ["kube-system", "kube-public", "kube-node-lease", "velero"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}
