use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value of `status.clusterStatus` once the operator gave up on a cluster
pub const CLUSTER_STATUS_FAILED: &str = "Failed";

/// CrdbCluster is the Schema for the crdbclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "crdb.cockroachlabs.com",
    version = "v1alpha1",
    kind = "CrdbCluster",
    plural = "crdbclusters",
    shortname = "crdb",
    namespaced,
    status = "CrdbClusterStatus",
    printcolumn = r#"{"name":"Nodes", "type":"integer", "jsonPath":".spec.nodes"}"#,
    printcolumn = r#"{"name":"TLS", "type":"boolean", "jsonPath":".spec.tlsEnabled"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.clusterStatus"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CrdbClusterSpec {
    /// Number of CockroachDB nodes (StatefulSet replicas)
    pub nodes: i32,

    /// Whether nodes and clients talk over TLS
    #[serde(default)]
    pub tls_enabled: bool,

    /// Container image for the database nodes
    pub image: PodImage,

    /// Persistent storage for node data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_store: Option<DataStore>,
}

/// Container image reference
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodImage {
    /// Image in `repository:tag` form
    pub name: String,

    /// Kubernetes image pull policy (Always, IfNotPresent, Never)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
}

/// Data volume configuration
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataStore {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PvcSource>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvcSource {
    pub spec: PvcSpec,
}

/// Subset of a PersistentVolumeClaim spec the operator forwards to its
/// volume claim template
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvcSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<String>,

    pub resources: VolumeResources,
}

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct VolumeResources {
    /// Requested quantities, e.g. `storage: 1Gi`
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
}

/// Status reported by the operator
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CrdbClusterStatus {
    /// Overall outcome of the last reconciliation ("Starting", "Finished", "Failed")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_status: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,

    /// Image the operator resolved and is running
    #[serde(
        default,
        rename = "crdbcontainerimage",
        skip_serializing_if = "Option::is_none"
    )]
    pub crdb_container_image: Option<String>,

    /// CockroachDB version detected by the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False" or "Unknown"
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl CrdbClusterStatus {
    pub fn is_failed(&self) -> bool {
        self.cluster_status.as_deref() == Some(CLUSTER_STATUS_FAILED)
    }
}
