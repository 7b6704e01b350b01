//! Specification builder and CrdbCluster rendering

use std::collections::BTreeMap;

use crdb_e2e::builder::DEFAULT_IMAGE;
use crdb_e2e::{ClusterBuilder, SecurityMode, SpecificationError};

#[test]
fn test_fluent_chain_records_every_option() {
    let spec = ClusterBuilder::new("crdb")
        .with_node_count(3)
        .with_tls()
        .with_image("cockroachdb/cockroach:v20.2.10")
        .with_pv_data_store("1Gi", "standard")
        .build()
        .unwrap();

    assert_eq!(spec.name(), "crdb");
    assert_eq!(spec.node_count(), 3);
    assert_eq!(spec.security(), SecurityMode::Tls);
    assert_eq!(spec.image(), "cockroachdb/cockroach:v20.2.10");
    let storage = spec.storage().unwrap();
    assert_eq!(storage.capacity, "1Gi");
    assert_eq!(storage.storage_class, "standard");
}

#[test]
fn test_missing_node_count_rejected() {
    assert_eq!(
        ClusterBuilder::new("crdb").build(),
        Err(SpecificationError::MissingNodeCount)
    );
}

#[test]
fn test_zero_and_negative_nodes_rejected() {
    assert_eq!(
        ClusterBuilder::new("crdb").with_node_count(0).build(),
        Err(SpecificationError::ZeroNodes(0))
    );
    assert_eq!(
        ClusterBuilder::new("crdb").with_node_count(-2).build(),
        Err(SpecificationError::ZeroNodes(-2))
    );
}

#[test]
fn test_empty_capacity_rejected() {
    let result = ClusterBuilder::new("crdb")
        .with_node_count(1)
        .with_pv_data_store("  ", "standard")
        .build();
    assert_eq!(result, Err(SpecificationError::EmptyStorageCapacity));
}

#[test]
fn test_invalid_names_rejected() {
    assert_eq!(
        ClusterBuilder::new("").with_node_count(1).build(),
        Err(SpecificationError::EmptyName)
    );
    assert!(matches!(
        ClusterBuilder::new("My_Cluster").with_node_count(1).build(),
        Err(SpecificationError::InvalidName(_))
    ));
}

#[test]
fn test_image_is_not_validated() {
    let spec = ClusterBuilder::new("crdb")
        .with_node_count(1)
        .with_image("nginx:latest")
        .build()
        .unwrap();
    assert_eq!(spec.image(), "nginx:latest");
}

#[test]
fn test_builder_is_reusable() {
    let base = ClusterBuilder::new("crdb").with_node_count(3);
    let insecure = base.build().unwrap();
    let secure = base.clone().with_tls().build().unwrap();

    assert!(!insecure.tls_enabled());
    assert!(secure.tls_enabled());
    assert_eq!(insecure.image(), DEFAULT_IMAGE);
}

#[test]
fn test_resource_rendering() {
    let labels = BTreeMap::from([("team".to_string(), "db".to_string())]);
    let spec = ClusterBuilder::new("crdb")
        .with_node_count(3)
        .with_tls()
        .with_image_pull_policy("IfNotPresent")
        .with_pv_data_store("1Gi", "standard")
        .with_labels(labels)
        .build()
        .unwrap();

    let cr = spec.to_resource("crdb-secure-1234abcd");
    assert_eq!(cr.metadata.name.as_deref(), Some("crdb"));
    assert_eq!(cr.metadata.namespace.as_deref(), Some("crdb-secure-1234abcd"));
    assert_eq!(
        cr.metadata.labels.as_ref().unwrap().get("team").map(String::as_str),
        Some("db")
    );

    let json = serde_json::to_value(&cr).unwrap();
    assert_eq!(json["apiVersion"], "crdb.cockroachlabs.com/v1alpha1");
    assert_eq!(json["kind"], "CrdbCluster");
    assert_eq!(json["spec"]["nodes"], 3);
    assert_eq!(json["spec"]["tlsEnabled"], true);
    assert_eq!(json["spec"]["image"]["pullPolicy"], "IfNotPresent");
    assert_eq!(
        json["spec"]["dataStore"]["pvc"]["spec"]["resources"]["requests"]["storage"],
        "1Gi"
    );
    assert_eq!(
        json["spec"]["dataStore"]["pvc"]["spec"]["storageClassName"],
        "standard"
    );
}

#[test]
fn test_derived_names() {
    let spec = ClusterBuilder::new("crdb").with_node_count(3).build().unwrap();
    assert_eq!(spec.statefulset_name(), "crdb");
    assert_eq!(spec.root_client_secret(), "crdb-root");
    assert_eq!(spec.data_pvc_name(2), "datadir-crdb-2");
}
