//! Command line entry point

use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::controller::DeployedOperator;
use crate::environment::{Environment, EnvironmentConfig};
use crate::error::Result;
use crate::scenarios::{Scenario, run_scenarios};

/// End-to-end checks for the CockroachDB operator
#[derive(Parser, Debug)]
#[command(name = "crdb-e2e")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Run scenarios concurrently (each still gets its own namespace)
    #[arg(long)]
    pub parallel: bool,

    /// Also check the data volumes of clusters that come up
    #[arg(long)]
    pub pvc: bool,

    /// Skip the long-running scenarios
    #[arg(long)]
    pub short: bool,

    /// Launch or reuse a kind cluster with this name instead of using the
    /// current kubeconfig
    #[arg(long, value_name = "NAME")]
    pub kind: Option<String>,

    /// Scenario to run; repeat to run several. Runs all when omitted
    #[arg(long = "scenario", value_name = "NAME")]
    pub scenarios: Vec<Scenario>,

    /// Storage class for data volumes
    #[arg(long, value_name = "CLASS")]
    pub storage_class: Option<String>,

    /// Budget for a cluster to become ready, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub ready_timeout: Option<u64>,

    /// Interval between cluster state samples, in seconds
    #[arg(long, value_name = "SECONDS", value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_interval: Option<u64>,

    /// Leave the CrdbCluster CRD alone; it must already be installed
    #[arg(long)]
    pub no_install_crd: bool,
}

impl Cli {
    /// Flags override the `CRDB_E2E_*` environment variables
    pub fn run_config(&self) -> RunConfig {
        let mut config = RunConfig::from_env();
        config.parallel |= self.parallel;
        config.pvc |= self.pvc;
        config.short |= self.short;
        config.install_crd &= !self.no_install_crd;
        if let Some(class) = &self.storage_class {
            config.storage_class = class.clone();
        }
        if let Some(secs) = self.ready_timeout {
            config.timeouts.ready = Duration::from_secs(secs);
        }
        if let Some(secs) = self.poll_interval {
            config.timeouts.poll_interval = Duration::from_secs(secs);
        }
        config
    }

    pub fn environment_config(&self, config: &RunConfig) -> EnvironmentConfig {
        let base = match &self.kind {
            Some(name) => EnvironmentConfig::kind(name),
            None => EnvironmentConfig::default(),
        };
        EnvironmentConfig {
            startup_timeout: config.timeouts.startup,
            install_crd: config.install_crd,
            ..base
        }
    }

    fn selected_scenarios(&self) -> Vec<Scenario> {
        if self.scenarios.is_empty() {
            Scenario::ALL.to_vec()
        } else {
            self.scenarios.clone()
        }
    }

    /// Run the selected scenarios, returning whether all of them passed
    pub async fn run(self) -> Result<bool> {
        let config = self.run_config();
        let scenarios = self.selected_scenarios();

        let env = Environment::start(self.environment_config(&config)).await?;

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling running scenarios");
                on_interrupt.cancel();
            }
        });

        let outcomes = run_scenarios(&env, &scenarios, DeployedOperator, &config, &cancel).await;

        let mut all_passed = true;
        for outcome in &outcomes {
            match &outcome.result {
                Ok(report) if report.skipped => {
                    tracing::info!(scenario = %outcome.scenario, "SKIPPED")
                }
                Ok(report) => tracing::info!(
                    scenario = %outcome.scenario,
                    steps = report.executed.len(),
                    "PASSED"
                ),
                Err(e) => {
                    all_passed = false;
                    tracing::error!(scenario = %outcome.scenario, error = %e, "FAILED");
                }
            }
        }

        env.stop().await?;
        Ok(all_passed)
    }
}
