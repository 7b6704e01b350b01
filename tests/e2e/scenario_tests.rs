//! Cluster creation scenarios
//!
//! Run with: cargo test --test e2e -- --ignored

use tokio_util::sync::CancellationToken;

use crdb_e2e::{DeployedOperator, RunConfig, Scenario, run_scenario};

use crate::init_test;

async fn run(scenario: Scenario) {
    let env = init_test().await;
    let config = RunConfig::from_env();

    let report = run_scenario(&env, scenario, DeployedOperator, &config, &CancellationToken::new())
        .await
        .unwrap_or_else(|e| panic!("scenario {} failed: {}", scenario, e));

    if !report.skipped {
        assert!(!report.executed.is_empty());
    }
}

/// 3-node insecure cluster becomes ready and serves SQL without TLS
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_create_insecure_cluster() {
    run(Scenario::InsecureCluster).await;
}

/// 3-node TLS cluster becomes ready and serves SQL with the root client cert
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_create_secure_cluster() {
    run(Scenario::SecureCluster).await;
}

/// An unpublished image tag backs off pulling and the cluster is marked failed
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_create_secure_cluster_with_invalid_version() {
    run(Scenario::InvalidVersion).await;
}

/// An image that is not CockroachDB ends in the failed state
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_create_secure_cluster_with_non_crdb_image() {
    run(Scenario::NonDatabaseImage).await;
}
