//! End-to-end verification harness for the CockroachDB Kubernetes operator.
//!
//! An [`Environment`] provides a control plane, a [`Sandbox`] gives each test
//! a namespace with its own controller, [`ClusterBuilder`] describes the
//! `CrdbCluster` to submit, and [`Steps`] runs the convergence assertions in
//! [`assertions`] in order.

pub mod assertions;
pub mod builder;
pub mod cli;
pub mod config;
pub mod controller;
pub mod crd;
pub mod environment;
pub mod error;
pub mod observe;
pub mod probe;
pub mod sandbox;
pub mod scenarios;
pub mod steps;
pub mod wait;

pub use assertions::{
    require_condition, require_database_functional, require_failed_state,
    require_image_pull_backoff, require_pvcs_bound, require_ready_eventually,
};
pub use builder::{ClusterBuilder, ClusterSpecification, SecurityMode, StorageParams};
pub use cli::Cli;
pub use config::{RunConfig, Timeouts};
pub use controller::{ControllerFactory, ControllerScope, DeployedOperator, ScopedController};
pub use crd::{CrdbCluster, CrdbClusterSpec, CrdbClusterStatus};
pub use environment::{Environment, EnvironmentConfig, Provider, SharedEnvironment};
pub use error::{Error, Result, SpecificationError, StepFailure, TimeoutError};
pub use observe::{
    ClusterObserver, ClusterSnapshot, ClusterState, ObserveError, StateTracker, StateTransition,
};
pub use sandbox::Sandbox;
pub use scenarios::{Scenario, ScenarioOutcome, run_scenario, run_scenarios};
pub use steps::{Step, StepReport, Steps};
pub use wait::{PollError, PollPolicy, Sample, poll_until};
