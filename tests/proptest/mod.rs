// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for the specification builder and state classification
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. Every valid builder configuration reads back exactly as configured
//! 2. Non-positive node counts are always rejected, never panicking
//! 3. Rendering into a CrdbCluster preserves the submitted fields
//! 4. A failed status dominates every other observation

use proptest::prelude::*;

use crdb_e2e::crd::{CLUSTER_STATUS_FAILED, CrdbClusterStatus};
use crdb_e2e::observe::PodSnapshot;
use crdb_e2e::{ClusterBuilder, ClusterSnapshot, ClusterState, SpecificationError};

fn name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,20}[a-z0-9]"
}

fn image_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,12}/[a-z]{1,12}:v[0-9]{1,2}\\.[0-9]{1,2}\\.[0-9]{1,3}"
}

fn capacity_strategy() -> impl Strategy<Value = String> {
    (1u32..512, prop_oneof![Just("Mi"), Just("Gi")]).prop_map(|(n, unit)| format!("{}{}", n, unit))
}

fn storage_class_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,15}"
}

proptest! {
    #[test]
    fn builder_round_trip(
        name in name_strategy(),
        nodes in 1i32..=64,
        tls in any::<bool>(),
        image in image_strategy(),
        storage in proptest::option::of((capacity_strategy(), storage_class_strategy())),
    ) {
        let mut builder = ClusterBuilder::new(&name).with_node_count(nodes).with_image(&image);
        if tls {
            builder = builder.with_tls();
        }
        if let Some((capacity, class)) = &storage {
            builder = builder.with_pv_data_store(capacity, class);
        }

        let spec = builder.build().unwrap();

        prop_assert_eq!(spec.name(), name.as_str());
        prop_assert_eq!(spec.node_count(), nodes);
        prop_assert_eq!(spec.tls_enabled(), tls);
        prop_assert_eq!(spec.image(), image.as_str());
        match (&storage, spec.storage()) {
            (Some((capacity, class)), Some(params)) => {
                prop_assert_eq!(&params.capacity, capacity);
                prop_assert_eq!(&params.storage_class, class);
            }
            (None, None) => {}
            (want, got) => prop_assert!(false, "storage mismatch: {:?} vs {:?}", want, got),
        }
    }

    #[test]
    fn non_positive_node_counts_rejected(nodes in i32::MIN..=0) {
        let result = ClusterBuilder::new("crdb").with_node_count(nodes).build();
        prop_assert_eq!(result, Err(SpecificationError::ZeroNodes(nodes)));
    }

    #[test]
    fn rendering_preserves_submitted_fields(
        nodes in 1i32..=64,
        tls in any::<bool>(),
        image in image_strategy(),
        namespace in "[a-z]{1,10}-[0-9a-f]{8}",
    ) {
        let mut builder = ClusterBuilder::new("crdb").with_node_count(nodes).with_image(&image);
        if tls {
            builder = builder.with_tls();
        }
        let cr = builder.build().unwrap().to_resource(&namespace);

        prop_assert_eq!(cr.spec.nodes, nodes);
        prop_assert_eq!(cr.spec.tls_enabled, tls);
        prop_assert_eq!(&cr.spec.image.name, &image);
        prop_assert_eq!(cr.metadata.namespace.as_deref(), Some(namespace.as_str()));
        prop_assert!(cr.status.is_none());
    }

    #[test]
    fn failed_status_dominates(
        nodes in 1i32..=5,
        ready in 0i32..=5,
        backoff in any::<bool>(),
    ) {
        let waiting: Vec<String> = if backoff {
            vec!["ImagePullBackOff".to_string()]
        } else {
            Vec::new()
        };
        let snapshot = ClusterSnapshot {
            cluster: "crdb".to_string(),
            exists: true,
            desired_nodes: Some(nodes),
            status: Some(CrdbClusterStatus {
                cluster_status: Some(CLUSTER_STATUS_FAILED.to_string()),
                ..Default::default()
            }),
            statefulset_ready_replicas: Some(ready),
            pods: (0..ready)
                .map(|i| PodSnapshot {
                    name: format!("crdb-{}", i),
                    phase: Some("Running".to_string()),
                    ready: true,
                    waiting_reasons: waiting.clone(),
                })
                .collect(),
            pvcs: Vec::new(),
        };

        prop_assert_eq!(snapshot.state(), ClusterState::Failed);
    }
}
