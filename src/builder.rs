//! Fluent builder for CrdbCluster test specifications
//!
//! ```ignore
//! let spec = ClusterBuilder::new("crdb")
//!     .with_node_count(3)
//!     .with_tls()
//!     .with_image("cockroachdb/cockroach:v20.2.10")
//!     .with_pv_data_store("1Gi", "standard")
//!     .build()?;
//! ```
//!
//! The builder only assembles data. Whether the image exists or is a
//! CockroachDB binary at all is for the operator to find out.

use std::collections::BTreeMap;

use kube::core::ObjectMeta;

use crate::crd::{
    CrdbCluster, CrdbClusterSpec, DataStore, PodImage, PvcSource, PvcSpec, VolumeResources,
};
use crate::error::SpecificationError;

/// Image used when a test does not pick one
pub const DEFAULT_IMAGE: &str = "cockroachdb/cockroach:v21.1.6";

/// Maximum length of a DNS-1123 label
const MAX_NAME_LEN: usize = 63;

/// Whether nodes and clients talk over TLS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecurityMode {
    #[default]
    Insecure,
    Tls,
}

impl SecurityMode {
    pub fn is_tls(self) -> bool {
        self == SecurityMode::Tls
    }
}

/// Persistent volume parameters for node data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageParams {
    /// Requested capacity, e.g. "1Gi"
    pub capacity: String,
    pub storage_class: String,
}

/// Immutable description of the cluster a test wants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpecification {
    name: String,
    node_count: i32,
    security: SecurityMode,
    image: String,
    image_pull_policy: Option<String>,
    storage: Option<StorageParams>,
    labels: BTreeMap<String, String>,
}

impl ClusterSpecification {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_count(&self) -> i32 {
        self.node_count
    }

    pub fn security(&self) -> SecurityMode {
        self.security
    }

    pub fn tls_enabled(&self) -> bool {
        self.security.is_tls()
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn image_pull_policy(&self) -> Option<&str> {
        self.image_pull_policy.as_deref()
    }

    pub fn storage(&self) -> Option<&StorageParams> {
        self.storage.as_ref()
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Name of the StatefulSet the operator creates for this cluster
    pub fn statefulset_name(&self) -> &str {
        &self.name
    }

    /// Secret holding the root client certificate for TLS clusters
    pub fn root_client_secret(&self) -> String {
        format!("{}-root", self.name)
    }

    /// Name of the data PVC of the node with the given ordinal
    pub fn data_pvc_name(&self, ordinal: i32) -> String {
        format!("datadir-{}-{}", self.name, ordinal)
    }

    /// Render the custom resource to submit into `namespace`
    pub fn to_resource(&self, namespace: &str) -> CrdbCluster {
        let data_store = self.storage.as_ref().map(|s| DataStore {
            pvc: Some(PvcSource {
                spec: PvcSpec {
                    storage_class_name: Some(s.storage_class.clone()),
                    access_modes: vec!["ReadWriteOnce".to_string()],
                    resources: VolumeResources {
                        requests: BTreeMap::from([("storage".to_string(), s.capacity.clone())]),
                    },
                },
            }),
        });

        CrdbCluster {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(namespace.to_string()),
                labels: (!self.labels.is_empty()).then(|| self.labels.clone()),
                ..Default::default()
            },
            spec: CrdbClusterSpec {
                nodes: self.node_count,
                tls_enabled: self.tls_enabled(),
                image: PodImage {
                    name: self.image.clone(),
                    pull_policy: self.image_pull_policy.clone(),
                },
                data_store,
            },
            status: None,
        }
    }
}

/// Builder for [`ClusterSpecification`]
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    name: String,
    node_count: Option<i32>,
    security: SecurityMode,
    image: String,
    image_pull_policy: Option<String>,
    storage: Option<StorageParams>,
    labels: BTreeMap<String, String>,
}

impl ClusterBuilder {
    /// Create a new builder with default values (insecure, default image, no storage)
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            node_count: None,
            security: SecurityMode::Insecure,
            image: DEFAULT_IMAGE.to_string(),
            image_pull_policy: None,
            storage: None,
            labels: BTreeMap::new(),
        }
    }

    /// Set the number of nodes
    pub fn with_node_count(mut self, nodes: i32) -> Self {
        self.node_count = Some(nodes);
        self
    }

    /// Enable TLS between nodes and clients
    pub fn with_tls(mut self) -> Self {
        self.security = SecurityMode::Tls;
        self
    }

    /// Set the security mode explicitly
    pub fn with_security(mut self, security: SecurityMode) -> Self {
        self.security = security;
        self
    }

    /// Set the container image (`repository:tag`)
    pub fn with_image(mut self, image: &str) -> Self {
        self.image = image.to_string();
        self
    }

    pub fn with_image_pull_policy(mut self, policy: &str) -> Self {
        self.image_pull_policy = Some(policy.to_string());
        self
    }

    /// Store node data on persistent volumes of the given capacity and class
    pub fn with_pv_data_store(mut self, capacity: &str, storage_class: &str) -> Self {
        self.storage = Some(StorageParams {
            capacity: capacity.to_string(),
            storage_class: storage_class.to_string(),
        });
        self
    }

    /// Add labels to the custom resource metadata
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    /// Validate and freeze the configuration
    pub fn build(&self) -> Result<ClusterSpecification, SpecificationError> {
        validate_name(&self.name)?;

        let node_count = self.node_count.ok_or(SpecificationError::MissingNodeCount)?;
        if node_count < 1 {
            return Err(SpecificationError::ZeroNodes(node_count));
        }

        if let Some(storage) = &self.storage {
            if storage.capacity.trim().is_empty() {
                return Err(SpecificationError::EmptyStorageCapacity);
            }
        }

        Ok(ClusterSpecification {
            name: self.name.clone(),
            node_count,
            security: self.security,
            image: self.image.clone(),
            image_pull_policy: self.image_pull_policy.clone(),
            storage: self.storage.clone(),
            labels: self.labels.clone(),
        })
    }
}

/// Reject names Kubernetes would refuse for the StatefulSet and its pods
fn validate_name(name: &str) -> Result<(), SpecificationError> {
    if name.is_empty() {
        return Err(SpecificationError::EmptyName);
    }

    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());

    if !valid_chars || !valid_edges || name.len() > MAX_NAME_LEN {
        return Err(SpecificationError::InvalidName(name.to_string()));
    }

    Ok(())
}
