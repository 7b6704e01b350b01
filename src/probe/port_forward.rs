//! Port forwarding to database pods
//!
//! `PortForward` uses kube-rs native port-forwarding. When it goes out of
//! scope the forwarding stops.

use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::sandbox::INSTANCE_LABEL;

#[derive(Error, Debug)]
pub enum PortForwardError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No running pods found for cluster: {0}")]
    NoPodsFound(String),

    #[error("Port forward stream unavailable")]
    StreamUnavailable,

    #[error("Port forward join error: {0}")]
    JoinError(String),
}

/// RAII wrapper for a port forward to one pod
pub struct PortForward {
    local_port: u16,
    pod: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _handle: JoinHandle<()>,
    cleanup_initiated: AtomicBool,
}

impl PortForward {
    /// Forward a free local port to `remote_port` on a running pod of `cluster`
    pub async fn to_cluster(
        client: Client,
        namespace: &str,
        cluster: &str,
        remote_port: u16,
    ) -> Result<Self, PortForwardError> {
        let pod = resolve_running_pod(&client, namespace, cluster).await?;
        Self::to_pod(client, namespace, &pod, remote_port).await
    }

    /// Forward a free local port to `remote_port` on `pod`
    pub async fn to_pod(
        client: Client,
        namespace: &str,
        pod: &str,
        remote_port: u16,
    ) -> Result<Self, PortForwardError> {
        let local_port = get_available_port()?;

        // Bind before returning so the first connect cannot race the listener
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", local_port)).await?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let pods: Api<Pod> = Api::namespaced(client, namespace);
        let pod_name = pod.to_string();

        let handle = tokio::spawn(async move {
            run_port_forward(pods, pod_name, listener, remote_port, shutdown_rx).await;
        });

        tracing::debug!(
            namespace = namespace,
            pod = pod,
            local_port = local_port,
            remote_port = remote_port,
            "Port-forward established"
        );

        Ok(Self {
            local_port,
            pod: pod.to_string(),
            shutdown_tx: Some(shutdown_tx),
            _handle: handle,
            cleanup_initiated: AtomicBool::new(false),
        })
    }

    /// Get the local port that is forwarding to the remote target
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn pod(&self) -> &str {
        &self.pod
    }

    /// Stop the port-forward
    pub fn stop(&mut self) {
        if self.cleanup_initiated.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!(local_port = self.local_port, "Stopping port-forward");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pick a running pod of the cluster, preferring the lowest ordinal
async fn resolve_running_pod(
    client: &Client,
    namespace: &str,
    cluster: &str,
) -> Result<String, PortForwardError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let selector = format!("{}={}", INSTANCE_LABEL, cluster);

    let mut running: Vec<String> = pods
        .list(&ListParams::default().labels(&selector))
        .await?
        .items
        .into_iter()
        .filter(|p| {
            p.status
                .as_ref()
                .and_then(|s| s.phase.as_ref())
                .is_some_and(|phase| phase == "Running")
        })
        .filter_map(|p| p.metadata.name)
        .collect();
    running.sort();

    running
        .into_iter()
        .next()
        .ok_or_else(|| PortForwardError::NoPodsFound(cluster.to_string()))
}

/// Accept local connections until shutdown, forwarding each one
async fn run_port_forward(
    pods: Api<Pod>,
    pod_name: String,
    listener: tokio::net::TcpListener,
    remote_port: u16,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                tracing::debug!("Port forward shutdown requested");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::trace!(client_addr = %addr, "New port forward connection");
                        let pods = pods.clone();
                        let pod_name = pod_name.clone();
                        tokio::spawn(async move {
                            let forwarded =
                                handle_connection(pods, &pod_name, remote_port, stream).await;
                            if let Err(e) = forwarded {
                                tracing::warn!(error = %e, "Port forward connection error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Port forward accept error");
                    }
                }
            }
        }
    }
}

/// Pipe one local connection through a pod port-forward stream
async fn handle_connection(
    pods: Api<Pod>,
    pod_name: &str,
    remote_port: u16,
    mut local_stream: TcpStream,
) -> Result<(), PortForwardError> {
    let mut pf = pods.portforward(pod_name, &[remote_port]).await?;
    let mut upstream = pf
        .take_stream(remote_port)
        .ok_or(PortForwardError::StreamUnavailable)?;

    match tokio::io::copy_bidirectional(&mut local_stream, &mut upstream).await {
        Ok((sent, received)) => {
            tracing::trace!(pod = pod_name, sent, received, "Port forward connection closed")
        }
        Err(e) => tracing::debug!(pod = pod_name, error = %e, "Port forward connection reset"),
    }
    drop(upstream);

    pf.join()
        .await
        .map_err(|e| PortForwardError::JoinError(e.to_string()))?;

    Ok(())
}

/// Find an available local port by binding to port 0
pub fn get_available_port() -> Result<u16, PortForwardError> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    Ok(port)
}
