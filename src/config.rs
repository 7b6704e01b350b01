//! Run configuration
//!
//! Everything that toggles harness behavior is carried explicitly in a
//! [`RunConfig`]. The CLI builds one from flags; test binaries build one from
//! environment variables with [`RunConfig::from_env`].

use std::time::Duration;

use crate::wait::{CONVERGENCE_TIMEOUT, DEFAULT_POLL_INTERVAL, PollPolicy};

/// Run top-level scenarios concurrently
pub const PARALLEL_ENV: &str = "CRDB_E2E_PARALLEL";

/// Enable the persistent-volume-claim scenario variants
pub const PVC_ENV: &str = "CRDB_E2E_PVC";

/// Skip long-running scenarios
pub const SHORT_ENV: &str = "CRDB_E2E_SHORT";

/// Skip installing the CrdbCluster CRD, for clusters where the operator
/// already installed its own
pub const NO_INSTALL_CRD_ENV: &str = "CRDB_E2E_NO_INSTALL_CRD";

/// Storage class of the default kind provisioner
pub const DEFAULT_STORAGE_CLASS: &str = "standard";

/// Time budgets used by the scenarios
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Sampling interval of every convergence assertion
    pub poll_interval: Duration,
    /// Budget for a cluster to become ready
    pub ready: Duration,
    /// Budget for a cluster to reach an image pull failure or a failed state
    pub failure: Duration,
    /// Budget of the SQL functional probe
    pub probe: Duration,
    /// Budget for the control plane to answer after launch
    pub startup: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            ready: CONVERGENCE_TIMEOUT,
            failure: CONVERGENCE_TIMEOUT,
            probe: Duration::from_secs(120),
            startup: Duration::from_secs(120),
        }
    }
}

impl Timeouts {
    pub fn ready_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval, self.ready)
    }

    pub fn failure_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval, self.failure)
    }

    pub fn probe_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval, self.probe)
    }
}

/// Switches for one harness invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Run top-level scenarios concurrently. Off by default: scenarios sharing
    /// one environment have interfered with each other.
    pub parallel: bool,
    /// Run the PVC scenario variants
    pub pvc: bool,
    /// Skip long-running step lists entirely
    pub short: bool,
    /// Install the CrdbCluster CRD when the environment starts and it is absent
    pub install_crd: bool,
    pub storage_class: String,
    pub timeouts: Timeouts,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            pvc: false,
            short: false,
            install_crd: true,
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
            timeouts: Timeouts::default(),
        }
    }
}

impl RunConfig {
    /// Build a config from `CRDB_E2E_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).map(|v| parse_flag(&v)).unwrap_or(false);
        Self {
            parallel: flag(PARALLEL_ENV),
            pvc: flag(PVC_ENV),
            short: flag(SHORT_ENV),
            install_crd: !flag(NO_INSTALL_CRD_ENV),
            ..Self::default()
        }
    }
}

/// Accepts the usual truthy spellings; anything else is false
fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
