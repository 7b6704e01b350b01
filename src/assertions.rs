//! Convergence assertions
//!
//! Each `require_*` function samples cluster state through a
//! [`ClusterObserver`] with [`poll_until`] until its condition holds or the
//! policy's budget runs out. Read errors during polling only mean "not yet";
//! they surface in the [`TimeoutError`] when the deadline passes.

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::builder::ClusterSpecification;
use crate::error::{Error, Result, TimeoutError};
use crate::observe::{ClusterObserver, ClusterSnapshot};
use crate::probe::sql::{self, ConnectionMode, DbConnection, ProbeError};
use crate::sandbox::Sandbox;
use crate::wait::{PollError, PollPolicy, Sample, poll_until};

/// Condition that holds once every desired node is ready
pub fn is_ready() -> impl Fn(&ClusterSnapshot) -> bool + Sync {
    |s: &ClusterSnapshot| s.is_ready()
}

/// Condition that holds while a container cannot pull its image
pub fn has_image_pull_failure() -> impl Fn(&ClusterSnapshot) -> bool + Sync {
    |s: &ClusterSnapshot| s.has_image_pull_failure()
}

/// Condition that holds once the operator reports `clusterStatus: Failed`
pub fn is_failed() -> impl Fn(&ClusterSnapshot) -> bool + Sync {
    |s: &ClusterSnapshot| s.is_failed()
}

/// Condition that holds once every data PVC of `spec` is bound with the
/// requested capacity and storage class
pub fn pvcs_bound(spec: &ClusterSpecification) -> impl Fn(&ClusterSnapshot) -> bool + Sync {
    let expected: Vec<String> = (0..spec.node_count())
        .map(|ordinal| spec.data_pvc_name(ordinal))
        .collect();
    let storage = spec.storage().cloned();

    move |s: &ClusterSnapshot| {
        expected.iter().all(|name| {
            s.pvcs.iter().any(|pvc| {
                pvc.name == *name
                    && pvc.is_bound()
                    && storage.as_ref().is_none_or(|want| {
                        pvc.capacity.as_deref() == Some(want.capacity.as_str())
                            && pvc.storage_class.as_deref() == Some(want.storage_class.as_str())
                    })
            })
        })
    }
}

/// Latest observation kept across polls for diagnostics
#[derive(Default)]
struct Progress {
    snapshot: Option<ClusterSnapshot>,
    error: Option<String>,
}

/// Poll `observer` until `condition` holds for `cluster`
pub async fn require_condition<O, C>(
    observer: &O,
    cluster: &str,
    description: &str,
    condition: C,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<ClusterSnapshot>
where
    O: ClusterObserver + Sync + ?Sized,
    C: Fn(&ClusterSnapshot) -> bool + Sync,
{
    let progress = Mutex::new(Progress::default());
    let progress_ref = &progress;
    let condition = &condition;

    tracing::debug!(
        cluster = cluster,
        condition = description,
        interval = ?policy.interval,
        timeout = ?policy.timeout,
        "Waiting for condition"
    );

    let outcome = poll_until(policy, cancel, move || async move {
        match observer.observe(cluster).await {
            Ok(snapshot) if condition(&snapshot) => Sample::Done(snapshot),
            Ok(snapshot) => {
                tracing::trace!(%snapshot, "Condition not met yet");
                if let Ok(mut p) = progress_ref.lock() {
                    p.snapshot = Some(snapshot);
                }
                Sample::Pending(())
            }
            Err(e) => {
                tracing::debug!(cluster = cluster, error = %e, "Transient read error");
                if let Ok(mut p) = progress_ref.lock() {
                    p.error = Some(e.to_string());
                }
                Sample::Pending(())
            }
        }
    })
    .await;

    match outcome {
        Ok(snapshot) => {
            tracing::info!(cluster = cluster, condition = description, "Condition met");
            Ok(snapshot)
        }
        Err(PollError::TimedOut { elapsed, polls, .. }) => {
            let progress = progress.into_inner().unwrap_or_default();
            Err(TimeoutError {
                condition: description.to_string(),
                cluster: cluster.to_string(),
                timeout: policy.timeout,
                elapsed,
                polls,
                last_observed: progress.snapshot,
                last_error: progress.error,
                history: observer.transitions(),
            }
            .into())
        }
        Err(PollError::Cancelled { polls, .. }) => Err(Error::Cancelled {
            condition: description.to_string(),
            polls,
        }),
    }
}

/// Wait until the StatefulSet and every pod of `cluster` report ready
pub async fn require_ready_eventually<O>(
    observer: &O,
    cluster: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<ClusterSnapshot>
where
    O: ClusterObserver + Sync + ?Sized,
{
    require_condition(observer, cluster, "ready", is_ready(), policy, cancel).await
}

/// Wait until a container of `cluster` is stuck pulling its image
pub async fn require_image_pull_backoff<O>(
    observer: &O,
    cluster: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<ClusterSnapshot>
where
    O: ClusterObserver + Sync + ?Sized,
{
    require_condition(
        observer,
        cluster,
        "image pull backoff",
        has_image_pull_failure(),
        policy,
        cancel,
    )
    .await
}

/// Wait until the operator marks `cluster` as failed, whatever the cause
pub async fn require_failed_state<O>(
    observer: &O,
    cluster: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<ClusterSnapshot>
where
    O: ClusterObserver + Sync + ?Sized,
{
    require_condition(observer, cluster, "failed state", is_failed(), policy, cancel).await
}

/// Wait until every data PVC of `spec` is bound with the requested storage.
///
/// Only meaningful for specifications with a persistent data store.
pub async fn require_pvcs_bound<O>(
    observer: &O,
    spec: &ClusterSpecification,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<ClusterSnapshot>
where
    O: ClusterObserver + Sync + ?Sized,
{
    if spec.storage().is_none() {
        return Err(Error::Sandbox(format!(
            "{} has no persistent data store to check",
            spec.name()
        )));
    }
    require_condition(
        observer,
        spec.name(),
        "data PVCs bound",
        pvcs_bound(spec),
        policy,
        cancel,
    )
    .await
}

/// Connect over SQL and write and read back a few rows, retrying within
/// `policy`.
///
/// Insecure clusters are reached as `root` without TLS; TLS clusters with the
/// root client certificate from the `{name}-root` secret.
pub async fn require_database_functional(
    sandbox: &Sandbox,
    spec: &ClusterSpecification,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    let client = sandbox.client();
    let namespace = sandbox.namespace();
    let cluster = spec.name();

    let outcome = poll_until(policy, cancel, || {
        let client = client.clone();
        async move {
            match probe_once(&client, namespace, spec).await {
                Ok(()) => Sample::Done(()),
                Err(e) => {
                    tracing::debug!(cluster = cluster, error = %e, "SQL probe not successful yet");
                    Sample::Pending(e.to_string())
                }
            }
        }
    })
    .await;

    match outcome {
        Ok(()) => {
            tracing::info!(cluster = cluster, tls = spec.tls_enabled(), "Database is functional");
            Ok(())
        }
        Err(PollError::TimedOut { elapsed, polls, last }) => Err(Error::FunctionalProbe {
            cluster: cluster.to_string(),
            reason: format!(
                "no successful probe in {:?} ({} attempts): {}",
                elapsed,
                polls,
                last.unwrap_or_else(|| "no attempt completed".to_string())
            ),
        }),
        Err(PollError::Cancelled { polls, .. }) => Err(Error::Cancelled {
            condition: "database functional".to_string(),
            polls,
        }),
    }
}

async fn probe_once(
    client: &kube::Client,
    namespace: &str,
    spec: &ClusterSpecification,
) -> Result<(), ProbeError> {
    let mode = if spec.tls_enabled() {
        let certs =
            sql::fetch_client_certificates(client, namespace, &spec.root_client_secret()).await?;
        ConnectionMode::Tls(certs)
    } else {
        ConnectionMode::Insecure
    };

    let conn = DbConnection::connect(client, namespace, spec.name(), mode).await?;
    sql::ensure_security(&conn, spec.tls_enabled())?;
    sql::run_smoke_queries(&conn).await
}
