//! Scripted stand-ins for the cluster

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crdb_e2e::crd::{CLUSTER_STATUS_FAILED, CrdbClusterStatus};
use crdb_e2e::observe::{PodSnapshot, StateTracker};
use crdb_e2e::{ClusterObserver, ClusterSnapshot, ClusterState, ObserveError, StateTransition};

/// One scripted answer of [`ScriptedObserver`]
#[derive(Clone, Debug)]
pub enum Reading {
    Snapshot(ClusterSnapshot),
    Error(&'static str),
    /// The read never completes
    Hang,
}

/// Replays a fixed sequence of readings, repeating the last one forever
pub struct ScriptedObserver {
    script: Mutex<VecDeque<Reading>>,
    last: Mutex<Option<Reading>>,
    tracker: Mutex<StateTracker>,
    calls: AtomicU32,
}

impl ScriptedObserver {
    pub fn new(readings: Vec<Reading>) -> Self {
        Self {
            script: Mutex::new(readings.into()),
            last: Mutex::new(None),
            tracker: Mutex::new(StateTracker::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// States the observer moved through, in order
    pub fn states(&self) -> Vec<ClusterState> {
        self.transitions().into_iter().map(|t| t.to).collect()
    }

    fn next_reading(&self) -> Reading {
        let mut last = self.last.lock().unwrap();
        if let Some(reading) = self.script.lock().unwrap().pop_front() {
            *last = Some(reading);
        }
        last.clone().expect("script must not be empty")
    }
}

impl ClusterObserver for ScriptedObserver {
    async fn observe(&self, _cluster: &str) -> Result<ClusterSnapshot, ObserveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_reading() {
            Reading::Snapshot(snapshot) => {
                self.tracker.lock().unwrap().record(&snapshot);
                Ok(snapshot)
            }
            Reading::Error(msg) => Err(ObserveError::Unavailable(msg.to_string())),
            Reading::Hang => std::future::pending().await,
        }
    }

    fn transitions(&self) -> Vec<StateTransition> {
        self.tracker.lock().unwrap().transitions().to_vec()
    }
}

fn pod(ordinal: usize, ready: bool, waiting: &[&str]) -> PodSnapshot {
    PodSnapshot {
        name: format!("crdb-{}", ordinal),
        phase: Some(if ready { "Running" } else { "Pending" }.to_string()),
        ready,
        waiting_reasons: waiting.iter().map(|s| s.to_string()).collect(),
    }
}

/// Custom resource exists, `ready` of `nodes` pods are ready
pub fn starting(nodes: i32, ready: i32) -> Reading {
    Reading::Snapshot(ClusterSnapshot {
        cluster: "crdb".to_string(),
        exists: true,
        desired_nodes: Some(nodes),
        statefulset_ready_replicas: Some(ready),
        pods: (0..nodes as usize)
            .map(|i| pod(i, (i as i32) < ready, &[]))
            .collect(),
        ..Default::default()
    })
}

pub fn ready(nodes: i32) -> Reading {
    starting(nodes, nodes)
}

pub fn image_pull_backoff(nodes: i32) -> Reading {
    Reading::Snapshot(ClusterSnapshot {
        cluster: "crdb".to_string(),
        exists: true,
        desired_nodes: Some(nodes),
        statefulset_ready_replicas: Some(0),
        pods: (0..nodes as usize)
            .map(|i| pod(i, false, &["ImagePullBackOff"]))
            .collect(),
        ..Default::default()
    })
}

pub fn failed(nodes: i32) -> Reading {
    let Reading::Snapshot(mut snapshot) = image_pull_backoff(nodes) else {
        unreachable!()
    };
    snapshot.status = Some(CrdbClusterStatus {
        cluster_status: Some(CLUSTER_STATUS_FAILED.to_string()),
        ..Default::default()
    });
    Reading::Snapshot(snapshot)
}
