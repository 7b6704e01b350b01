//! Cluster creation scenarios
//!
//! Each scenario builds one specification, gets its own sandbox, attaches the
//! controller, runs its steps and always tears the sandbox down.

use std::fmt;
use std::str::FromStr;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::assertions::{
    require_database_functional, require_failed_state, require_image_pull_backoff,
    require_pvcs_bound, require_ready_eventually,
};
use crate::builder::{ClusterBuilder, ClusterSpecification};
use crate::config::RunConfig;
use crate::controller::ControllerFactory;
use crate::environment::Environment;
use crate::error::{Error, Result, SpecificationError};
use crate::sandbox::Sandbox;
use crate::steps::{Step, StepReport, Steps};

/// Name of the cluster every scenario creates
pub const CLUSTER_NAME: &str = "crdb";

pub const NODE_COUNT: i32 = 3;

pub const STORAGE_CAPACITY: &str = "1Gi";

pub const INSECURE_IMAGE: &str = "cockroachdb/cockroach:v21.1.6";
pub const SECURE_IMAGE: &str = "cockroachdb/cockroach:v20.2.10";
/// A tag that was never published
pub const INVALID_VERSION_IMAGE: &str = "cockroachdb/cockroach:v20.2.555";
/// Pullable, but not a CockroachDB binary
pub const NON_DATABASE_IMAGE: &str = "nginx:latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// 3-node insecure cluster becomes ready and serves SQL
    InsecureCluster,
    /// 3-node TLS cluster becomes ready and serves SQL over TLS
    SecureCluster,
    /// Nonexistent image tag backs off pulling, then fails
    InvalidVersion,
    /// Image that is not CockroachDB fails
    NonDatabaseImage,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::InsecureCluster,
        Scenario::SecureCluster,
        Scenario::InvalidVersion,
        Scenario::NonDatabaseImage,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::InsecureCluster => "insecure",
            Scenario::SecureCluster => "secure",
            Scenario::InvalidVersion => "invalid-version",
            Scenario::NonDatabaseImage => "non-crdb-image",
        }
    }

    /// Prefix of the sandbox namespace
    pub fn namespace_prefix(self) -> String {
        format!("crdb-{}", self.name())
    }

    pub fn image(self) -> &'static str {
        match self {
            Scenario::InsecureCluster => INSECURE_IMAGE,
            Scenario::SecureCluster => SECURE_IMAGE,
            Scenario::InvalidVersion => INVALID_VERSION_IMAGE,
            Scenario::NonDatabaseImage => NON_DATABASE_IMAGE,
        }
    }

    /// Whether the scenario expects the cluster to come up
    pub fn expects_ready(self) -> bool {
        matches!(self, Scenario::InsecureCluster | Scenario::SecureCluster)
    }

    pub fn specification(
        self,
        config: &RunConfig,
    ) -> Result<ClusterSpecification, SpecificationError> {
        let builder = ClusterBuilder::new(CLUSTER_NAME)
            .with_node_count(NODE_COUNT)
            .with_image(self.image())
            .with_pv_data_store(STORAGE_CAPACITY, &config.storage_class);

        match self {
            Scenario::InsecureCluster => builder.build(),
            _ => builder.with_tls().build(),
        }
    }

    /// Steps for this scenario against a sandbox whose controller is running
    pub fn steps<'a>(
        self,
        sandbox: &'a Sandbox,
        spec: &'a ClusterSpecification,
        config: &'a RunConfig,
        cancel: &'a CancellationToken,
    ) -> Steps<'a> {
        let timeouts = config.timeouts;
        let cluster = spec.name();

        let submit_label = format!(
            "creates {}-node {} cluster{}",
            spec.node_count(),
            if spec.tls_enabled() { "secure" } else { "insecure" },
            if self.expects_ready() { "" } else { " with invalid image" }
        );
        let steps = Steps::new().step(Step::new(&submit_label, move || async move {
            sandbox.create(spec).await.map(drop)
        }));

        match self {
            Scenario::InsecureCluster | Scenario::SecureCluster => {
                let mut steps = steps.step(Step::new("cluster becomes ready", move || async move {
                    require_ready_eventually(sandbox, cluster, timeouts.ready_policy(), cancel)
                        .await
                        .map(drop)
                }));

                if config.pvc {
                    steps = steps.step(
                        Step::new("data volumes bound", move || async move {
                            require_pvcs_bound(sandbox, spec, timeouts.ready_policy(), cancel)
                                .await
                                .map(drop)
                        })
                        .parallel(),
                    );
                }

                let probe_label = if spec.tls_enabled() {
                    "database functional over TLS"
                } else {
                    "database functional without TLS"
                };
                steps.step(
                    Step::new(probe_label, move || async move {
                        require_database_functional(sandbox, spec, timeouts.probe_policy(), cancel)
                            .await
                    })
                    .parallel(),
                )
            }
            Scenario::InvalidVersion => steps
                .step(Step::new("image pull backs off", move || async move {
                    require_image_pull_backoff(sandbox, cluster, timeouts.failure_policy(), cancel)
                        .await
                        .map(drop)
                }))
                .step(Step::new("cluster marked failed", move || async move {
                    require_failed_state(sandbox, cluster, timeouts.failure_policy(), cancel)
                        .await
                        .map(drop)
                })),
            Scenario::NonDatabaseImage => {
                steps.step(Step::new("cluster marked failed", move || async move {
                    require_failed_state(sandbox, cluster, timeouts.failure_policy(), cancel)
                        .await
                        .map(drop)
                }))
            }
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Scenario::ALL.iter().map(|s| s.name()).collect();
                format!("unknown scenario {:?}, expected one of: {}", s, known.join(", "))
            })
    }
}

/// Result of one scenario run
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub scenario: Scenario,
    pub result: Result<StepReport>,
}

impl ScenarioOutcome {
    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run one scenario in a fresh sandbox of `env`
pub async fn run_scenario<F>(
    env: &Environment,
    scenario: Scenario,
    factory: F,
    config: &RunConfig,
    cancel: &CancellationToken,
) -> Result<StepReport>
where
    F: ControllerFactory,
{
    if config.short {
        tracing::info!(scenario = %scenario, "Skipping scenario in short mode");
        return Ok(StepReport {
            executed: Vec::new(),
            skipped: true,
        });
    }

    let spec = scenario.specification(config)?;
    let span = tracing::info_span!("scenario", name = scenario.name());
    let mut sandbox = Sandbox::new(env, &scenario.namespace_prefix(), span.clone()).await?;

    let result = async {
        sandbox.start_manager(factory).await?;
        let steps = scenario.steps(&sandbox, &spec, config, cancel);
        Ok::<_, Error>(steps.run(config).await?)
    }
    .instrument(span.clone())
    .await;

    if let Err(e) = sandbox.teardown().await {
        tracing::warn!(parent: &span, error = %e, "Sandbox teardown failed");
    }

    result
}

/// Run `scenarios`, sequentially unless `config.parallel` is set.
///
/// Every scenario runs to completion regardless of the others' outcome.
pub async fn run_scenarios<F>(
    env: &Environment,
    scenarios: &[Scenario],
    factory: F,
    config: &RunConfig,
    cancel: &CancellationToken,
) -> Vec<ScenarioOutcome>
where
    F: ControllerFactory + Clone,
{
    if config.parallel {
        tracing::info!(count = scenarios.len(), "Running scenarios in parallel");
        return join_all(scenarios.iter().map(|&scenario| {
            let factory = factory.clone();
            let cancel = cancel.child_token();
            async move {
                let result = run_scenario(env, scenario, factory, config, &cancel).await;
                ScenarioOutcome { scenario, result }
            }
        }))
        .await;
    }

    let mut outcomes = Vec::with_capacity(scenarios.len());
    for &scenario in scenarios {
        let cancel = cancel.child_token();
        let result = run_scenario(env, scenario, factory.clone(), config, &cancel).await;
        outcomes.push(ScenarioOutcome { scenario, result });
    }
    outcomes
}
