// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! End-to-end tests for the CockroachDB operator
//!
//! These tests require a running Kubernetes cluster accessible via kubeconfig
//! with the operator deployed and watching all namespaces. Tests are marked
//! with #[ignore] and must be run explicitly:
//!
//! ```bash
//! cargo test --test e2e -- --ignored --test-threads=1
//! ```
//!
//! `CRDB_E2E_PVC=1` adds the data volume checks, `CRDB_E2E_SHORT=1` skips the
//! scenarios and `CRDB_E2E_NO_INSTALL_CRD=1` leaves the operator's CRD alone.
//! Each test gets its own namespace, but sequential runs remain the
//! recommended mode.

mod scenario_tests;

use std::sync::Arc;

use crdb_e2e::{Environment, EnvironmentConfig, RunConfig, SharedEnvironment};

/// Initialize tracing and get the shared environment
pub async fn init_test() -> Arc<Environment> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,kube=warn")
        .with_test_writer()
        .try_init();

    crdb_e2e::probe::sql::ensure_crypto_provider();

    let config = EnvironmentConfig {
        install_crd: RunConfig::from_env().install_crd,
        ..EnvironmentConfig::default()
    };
    SharedEnvironment::get(config)
        .await
        .expect("Failed to start test environment")
}
