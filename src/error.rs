//! Error types for the e2e harness

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::observe::{ClusterSnapshot, StateTransition};

/// Failures surfaced by the harness.
///
/// `Timeout` is the dominant failure mode of a convergence assertion;
/// `FunctionalProbe` means the cluster reported ready but could not serve SQL.
#[derive(Error, Debug)]
pub enum Error {
    #[error("environment failed to start: {0}")]
    EnvironmentStartup(String),

    #[error("submission of {cluster} rejected: {source}")]
    Submission {
        cluster: String,
        #[source]
        source: kube::Error,
    },

    #[error("invalid cluster specification: {0}")]
    Specification(#[from] SpecificationError),

    #[error(transparent)]
    Timeout(Box<TimeoutError>),

    #[error("functional probe against {cluster} failed: {reason}")]
    FunctionalProbe { cluster: String, reason: String },

    #[error("wait for {condition} cancelled after {polls} polls")]
    Cancelled { condition: String, polls: u32 },

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Step(Box<StepFailure>),
}

impl Error {
    /// Last snapshot observed before the failure, if the failure carries one
    pub fn last_observed(&self) -> Option<&ClusterSnapshot> {
        match self {
            Error::Timeout(t) => t.last_observed.as_ref(),
            Error::Step(failure) => failure.source.last_observed(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Step(failure) => failure.source.is_timeout(),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Rejections raised by [`crate::builder::ClusterBuilder::build`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecificationError {
    #[error("node count is required")]
    MissingNodeCount,

    #[error("node count must be at least 1, got {0}")]
    ZeroNodes(i32),

    #[error("cluster name must not be empty")]
    EmptyName,

    #[error("cluster name {0:?} is not a valid DNS-1123 label")]
    InvalidName(String),

    #[error("storage capacity must not be empty")]
    EmptyStorageCapacity,
}

/// A convergence assertion that did not see its target state before the deadline.
///
/// Always carries whatever the harness saw last so a failed run can be triaged
/// without re-running it.
#[derive(Debug)]
pub struct TimeoutError {
    /// Human-readable name of the awaited condition
    pub condition: String,
    /// Cluster the assertion was made against
    pub cluster: String,
    pub timeout: Duration,
    pub elapsed: Duration,
    pub polls: u32,
    pub last_observed: Option<ClusterSnapshot>,
    /// Most recent transient read error, if the last polls could not read state
    pub last_error: Option<String>,
    /// State transitions recorded by the sandbox up to the deadline
    pub history: Vec<StateTransition>,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timed out after {:?} (budget {:?}, {} polls) waiting for {} on {}",
            self.elapsed, self.timeout, self.polls, self.condition, self.cluster
        )?;
        match &self.last_observed {
            Some(snapshot) => write!(f, "; last observed: {}", snapshot)?,
            None => write!(f, "; cluster state never observed")?,
        }
        if let Some(err) = &self.last_error {
            write!(f, "; last read error: {}", err)?;
        }
        if !self.history.is_empty() {
            let path: Vec<String> = self
                .history
                .iter()
                .map(|t| format!("{}@{:?}", t.to, t.at))
                .collect();
            write!(f, "; transitions: {}", path.join(" -> "))?;
        }
        Ok(())
    }
}

impl std::error::Error for TimeoutError {}

impl From<TimeoutError> for Error {
    fn from(e: TimeoutError) -> Self {
        Error::Timeout(Box::new(e))
    }
}

/// A step that failed, as reported by [`crate::steps::Steps::run`]
#[derive(Error, Debug)]
#[error("step {index} \"{step}\" failed: {source}")]
pub struct StepFailure {
    pub step: String,
    pub index: usize,
    #[source]
    pub source: Error,
}

impl From<StepFailure> for Error {
    fn from(e: StepFailure) -> Self {
        Error::Step(Box::new(e))
    }
}
