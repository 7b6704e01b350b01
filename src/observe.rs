//! Observed cluster state
//!
//! A [`ClusterSnapshot`] is one best-effort read of the custom resource and the
//! objects the operator derives from it. Snapshots are never cached: every poll
//! of a convergence assertion takes a fresh one.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::crd::CrdbClusterStatus;

/// Container waiting reasons that mean the image could not be pulled
pub const IMAGE_PULL_FAILURE_REASONS: [&str; 2] = ["ErrImagePull", "ImagePullBackOff"];

#[derive(Error, Debug)]
pub enum ObserveError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("cluster state unavailable: {0}")]
    Unavailable(String),
}

/// Something that can sample the current state of a named cluster.
///
/// The sandbox implements this against the API server; tests script it.
pub trait ClusterObserver {
    fn observe(
        &self,
        cluster: &str,
    ) -> impl Future<Output = Result<ClusterSnapshot, ObserveError>> + Send;

    /// State transitions recorded so far, attached to timeout diagnostics
    fn transitions(&self) -> Vec<StateTransition> {
        Vec::new()
    }
}

/// Externally observed lifecycle state of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterState {
    /// Not yet ready and not known to be failing
    Initializing,
    Ready,
    /// At least one container cannot pull its image
    ImagePullBackoff,
    /// The operator marked the cluster as failed
    Failed,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterState::Initializing => write!(f, "Initializing"),
            ClusterState::Ready => write!(f, "Ready"),
            ClusterState::ImagePullBackoff => write!(f, "ImagePullBackoff"),
            ClusterState::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodSnapshot {
    pub name: String,
    /// Pod phase (Pending, Running, ...)
    pub phase: Option<String>,
    /// Ready condition is True
    pub ready: bool,
    /// Waiting reasons of containers that are not running
    pub waiting_reasons: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PvcSnapshot {
    pub name: String,
    /// PVC phase (Pending, Bound, Lost)
    pub phase: Option<String>,
    pub capacity: Option<String>,
    pub storage_class: Option<String>,
}

impl PvcSnapshot {
    pub fn is_bound(&self) -> bool {
        self.phase.as_deref() == Some("Bound")
    }
}

/// One read of everything the harness judges a cluster by
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterSnapshot {
    pub cluster: String,
    /// Whether the custom resource exists at all
    pub exists: bool,
    /// `spec.nodes` of the custom resource
    pub desired_nodes: Option<i32>,
    pub status: Option<CrdbClusterStatus>,
    /// `None` when the StatefulSet does not exist yet
    pub statefulset_ready_replicas: Option<i32>,
    pub pods: Vec<PodSnapshot>,
    pub pvcs: Vec<PvcSnapshot>,
}

impl ClusterSnapshot {
    /// Snapshot of a cluster whose custom resource is absent
    pub fn missing(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            ..Default::default()
        }
    }

    pub fn ready_pods(&self) -> usize {
        self.pods.iter().filter(|p| p.ready).count()
    }

    /// StatefulSet and pods report every desired node ready
    pub fn is_ready(&self) -> bool {
        let Some(desired) = self.desired_nodes else {
            return false;
        };
        let sts_ready = self
            .statefulset_ready_replicas
            .is_some_and(|ready| ready >= desired);
        sts_ready && self.ready_pods() >= desired as usize
    }

    /// Any container is stuck on an image pull
    pub fn has_image_pull_failure(&self) -> bool {
        self.pods.iter().any(|p| {
            p.waiting_reasons
                .iter()
                .any(|r| IMAGE_PULL_FAILURE_REASONS.contains(&r.as_str()))
        })
    }

    /// The operator reports the cluster as failed
    pub fn is_failed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.is_failed())
    }

    /// Classify this snapshot.
    ///
    /// Failure wins over everything, then an image pull failure, then readiness.
    pub fn state(&self) -> ClusterState {
        if self.is_failed() {
            ClusterState::Failed
        } else if self.has_image_pull_failure() {
            ClusterState::ImagePullBackoff
        } else if self.is_ready() {
            ClusterState::Ready
        } else {
            ClusterState::Initializing
        }
    }
}

impl fmt::Display for ClusterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.exists {
            return write!(f, "{} (custom resource not found)", self.cluster);
        }
        write!(
            f,
            "{} state={} nodes={} sts_ready={} pods_ready={}/{}",
            self.cluster,
            self.state(),
            self.desired_nodes.map_or("?".to_string(), |n| n.to_string()),
            self.statefulset_ready_replicas
                .map_or("-".to_string(), |n| n.to_string()),
            self.ready_pods(),
            self.pods.len(),
        )?;
        if let Some(status) = self.status.as_ref().and_then(|s| s.cluster_status.as_ref()) {
            write!(f, " clusterStatus={}", status)?;
        }
        let waiting: Vec<String> = self
            .pods
            .iter()
            .filter(|p| !p.waiting_reasons.is_empty())
            .map(|p| format!("{}:{}", p.name, p.waiting_reasons.join("|")))
            .collect();
        if !waiting.is_empty() {
            write!(f, " waiting=[{}]", waiting.join(", "))?;
        }
        Ok(())
    }
}

/// A change of classified state seen by a [`StateTracker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: Option<ClusterState>,
    pub to: ClusterState,
    /// Time since the tracker was created
    pub at: Duration,
}

/// Records state transitions of the clusters observed in one sandbox
#[derive(Debug)]
pub struct StateTracker {
    started: Instant,
    current: Option<ClusterState>,
    transitions: Vec<StateTransition>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            current: None,
            transitions: Vec::new(),
        }
    }

    /// Record a snapshot, returning the transition if its state differs from
    /// the previous one
    pub fn record(&mut self, snapshot: &ClusterSnapshot) -> Option<StateTransition> {
        let state = snapshot.state();
        if self.current == Some(state) {
            return None;
        }

        let transition = StateTransition {
            from: self.current,
            to: state,
            at: self.started.elapsed(),
        };
        self.current = Some(state);
        self.transitions.push(transition.clone());
        Some(transition)
    }

    pub fn current(&self) -> Option<ClusterState> {
        self.current
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }
}
