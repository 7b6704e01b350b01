//! Per-test namespace with its own scoped controller
//!
//! Every test gets a fresh namespace named `{prefix}-{uuid8}`, one controller
//! watching only that namespace, and a [`StateTracker`] recording how the
//! clusters in it move between states. Teardown deletes the namespace, which
//! cascades to everything the operator created inside it.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use kube::api::{DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::core::ObjectMeta;
use kube::{Api, Client};
use tracing::Span;
use uuid::Uuid;

use crate::builder::ClusterSpecification;
use crate::controller::{ControllerFactory, ControllerScope, ScopedController};
use crate::crd::CrdbCluster;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::observe::{
    ClusterObserver, ClusterSnapshot, ObserveError, PodSnapshot, PvcSnapshot, StateTracker,
    StateTransition,
};

/// Label marking namespaces created by the harness
pub const SANDBOX_LABEL: &str = "crdb-e2e.cockroachlabs.com/sandbox";

/// Label the operator puts on every pod of a cluster
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Isolated scope for one test
pub struct Sandbox {
    client: Client,
    namespace: String,
    span: Span,
    controller: Option<ScopedController>,
    tracker: Mutex<StateTracker>,
    torn_down: AtomicBool,
}

impl Sandbox {
    /// Create a uniquely named namespace in `env`
    pub async fn new(env: &Environment, prefix: &str, span: Span) -> Result<Self> {
        let client = env.client()?;
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        let namespace = format!("{}-{}", prefix, suffix);

        let labels = BTreeMap::from([
            (SANDBOX_LABEL.to_string(), "true".to_string()),
            ("test-prefix".to_string(), prefix.to_string()),
        ]);

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };

        let namespaces: Api<Namespace> = Api::all(client.clone());
        namespaces.create(&PostParams::default(), &ns).await?;

        tracing::info!(parent: &span, namespace = %namespace, "Created sandbox namespace");

        Ok(Self {
            client,
            namespace,
            span,
            controller: None,
            tracker: Mutex::new(StateTracker::new()),
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Attach the reconciliation controller for this sandbox.
    ///
    /// Exactly one controller may be attached; it only sees this namespace.
    pub async fn start_manager<F>(&mut self, factory: F) -> Result<()>
    where
        F: ControllerFactory,
    {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(Error::Sandbox(format!(
                "sandbox {} is already torn down",
                self.namespace
            )));
        }
        if self.controller.is_some() {
            return Err(Error::Sandbox(format!(
                "a controller is already attached to {}",
                self.namespace
            )));
        }

        let scope = ControllerScope {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            span: self.span.clone(),
        };
        self.controller = Some(ScopedController::start(factory, scope).await);
        Ok(())
    }

    /// Submit `spec` as a new CrdbCluster in this namespace
    pub async fn create(&self, spec: &ClusterSpecification) -> Result<CrdbCluster> {
        if self.controller.is_none() {
            return Err(Error::Sandbox(format!(
                "no controller attached to {}; {} would never converge",
                self.namespace,
                spec.name()
            )));
        }

        let api: Api<CrdbCluster> = Api::namespaced(self.client.clone(), &self.namespace);
        let created = api
            .create(&PostParams::default(), &spec.to_resource(&self.namespace))
            .await
            .map_err(|source| Error::Submission {
                cluster: spec.name().to_string(),
                source,
            })?;

        tracing::info!(
            parent: &self.span,
            cluster = spec.name(),
            nodes = spec.node_count(),
            tls = spec.tls_enabled(),
            image = spec.image(),
            "Submitted CrdbCluster"
        );
        Ok(created)
    }

    /// State transitions observed so far
    pub fn history(&self) -> Vec<StateTransition> {
        self.tracker
            .lock()
            .map(|t| t.transitions().to_vec())
            .unwrap_or_default()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Stop the controller and delete the namespace. Safe to call more than once.
    ///
    /// Deletion is initiated with background propagation and not awaited;
    /// Kubernetes garbage collects the contents.
    pub async fn teardown(&mut self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(mut controller) = self.controller.take() {
            controller.stop();
        }

        delete_namespace(self.client.clone(), &self.namespace).await?;
        tracing::info!(parent: &self.span, namespace = %self.namespace, "Sandbox torn down");
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut controller) = self.controller.take() {
            controller.stop();
        }

        // Best effort: needs a live runtime to issue the delete
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                let namespace = self.namespace.clone();
                handle.spawn(async move {
                    if let Err(e) = delete_namespace(client, &namespace).await {
                        tracing::warn!(
                            namespace = %namespace,
                            error = %e,
                            "Sandbox cleanup failed"
                        );
                    }
                });
            }
            Err(_) => tracing::warn!(
                namespace = %self.namespace,
                "No runtime available, sandbox namespace left behind"
            ),
        }
    }
}

async fn delete_namespace(client: Client, namespace: &str) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(client);
    let dp = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    };

    match namespaces.delete(namespace, &dp).await {
        Ok(_) => {
            tracing::debug!(namespace = %namespace, "Namespace deletion initiated");
            Ok(())
        }
        // Already deleted
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(Error::Kube(e)),
    }
}

impl ClusterObserver for Sandbox {
    async fn observe(&self, cluster: &str) -> Result<ClusterSnapshot, ObserveError> {
        let snapshot = read_snapshot(&self.client, &self.namespace, cluster).await?;

        if let Ok(mut tracker) = self.tracker.lock() {
            if let Some(t) = tracker.record(&snapshot) {
                tracing::info!(
                    parent: &self.span,
                    cluster = cluster,
                    from = ?t.from,
                    to = %t.to,
                    at = ?t.at,
                    "Cluster state changed"
                );
            }
        }
        Ok(snapshot)
    }

    fn transitions(&self) -> Vec<StateTransition> {
        self.history()
    }
}

/// Read the custom resource and its dependents into one snapshot
async fn read_snapshot(
    client: &Client,
    namespace: &str,
    cluster: &str,
) -> Result<ClusterSnapshot, ObserveError> {
    let clusters: Api<CrdbCluster> = Api::namespaced(client.clone(), namespace);
    let Some(cr) = clusters.get_opt(cluster).await? else {
        return Ok(ClusterSnapshot::missing(cluster));
    };

    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    let statefulset_ready_replicas = statefulsets
        .get_opt(cluster)
        .await?
        .map(|sts| sts.status.and_then(|s| s.ready_replicas).unwrap_or(0));

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let selector = format!("{}={}", INSTANCE_LABEL, cluster);
    let pods = pods
        .list(&ListParams::default().labels(&selector))
        .await?
        .items
        .iter()
        .map(pod_snapshot)
        .collect();

    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let pvc_prefix = format!("datadir-{}-", cluster);
    let pvcs = pvcs
        .list(&ListParams::default())
        .await?
        .items
        .iter()
        .filter(|pvc| {
            pvc.metadata
                .name
                .as_deref()
                .is_some_and(|n| n.starts_with(&pvc_prefix))
        })
        .map(pvc_snapshot)
        .collect();

    Ok(ClusterSnapshot {
        cluster: cluster.to_string(),
        exists: true,
        desired_nodes: Some(cr.spec.nodes),
        status: cr.status,
        statefulset_ready_replicas,
        pods,
        pvcs,
    })
}

pub(crate) fn pod_snapshot(pod: &Pod) -> PodSnapshot {
    let status = pod.status.as_ref();

    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });

    let waiting_reasons = status
        .into_iter()
        .flat_map(|s| {
            s.init_container_statuses
                .iter()
                .flatten()
                .chain(s.container_statuses.iter().flatten())
        })
        .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.clone())
        .collect();

    PodSnapshot {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()),
        ready,
        waiting_reasons,
    }
}

pub(crate) fn pvc_snapshot(pvc: &PersistentVolumeClaim) -> PvcSnapshot {
    PvcSnapshot {
        name: pvc.metadata.name.clone().unwrap_or_default(),
        phase: pvc.status.as_ref().and_then(|s| s.phase.clone()),
        capacity: pvc
            .status
            .as_ref()
            .and_then(|s| s.capacity.as_ref())
            .and_then(|c| c.get("storage"))
            .map(|q| q.0.clone()),
        storage_class: pvc.spec.as_ref().and_then(|s| s.storage_class_name.clone()),
    }
}
