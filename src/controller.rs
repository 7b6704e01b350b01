//! Reconciliation controller attachment
//!
//! The harness does not reconcile anything itself. A [`ControllerFactory`]
//! turns a [`ControllerScope`] into a long-running future, which the sandbox
//! runs on its own task until the sandbox is torn down.

use std::future::Future;
use std::time::Duration;

use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

/// Grace period for a freshly spawned controller to establish its watches
const CONTROLLER_WARMUP: Duration = Duration::from_millis(100);

/// What a controller is allowed to see and where it logs
#[derive(Clone)]
pub struct ControllerScope {
    pub client: Client,
    /// The only namespace the controller may watch
    pub namespace: String,
    /// Span of the owning test; the controller's events are recorded under it
    pub span: Span,
}

/// Builds a controller bound to one sandbox namespace.
///
/// Any `FnOnce(ControllerScope) -> impl Future<Output = ()>` works, e.g. a
/// closure calling an operator's `run_controller_scoped(client, Some(ns))`.
pub trait ControllerFactory: Send + 'static {
    type Controller: Future<Output = ()> + Send + 'static;

    fn build(self, scope: ControllerScope) -> Self::Controller;
}

impl<F, Fut> ControllerFactory for F
where
    F: FnOnce(ControllerScope) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    type Controller = Fut;

    fn build(self, scope: ControllerScope) -> Fut {
        self(scope)
    }
}

/// The operator already runs inside the target cluster (e.g. deployed with its
/// manifests), so nothing is started in-process.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeployedOperator;

impl ControllerFactory for DeployedOperator {
    type Controller = std::future::Pending<()>;

    fn build(self, scope: ControllerScope) -> Self::Controller {
        tracing::debug!(
            parent: &scope.span,
            namespace = %scope.namespace,
            "Relying on the in-cluster operator"
        );
        std::future::pending()
    }
}

/// A controller that runs for the lifetime of one sandbox
pub struct ScopedController {
    handle: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    namespace: String,
}

impl ScopedController {
    /// Spawn the controller built by `factory` on its own task
    pub async fn start<F>(factory: F, scope: ControllerScope) -> Self
    where
        F: ControllerFactory,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let namespace = scope.namespace.clone();
        let span = scope.span.clone();

        tracing::info!(parent: &span, namespace = %namespace, "Starting scoped controller");

        let controller = factory.build(scope);
        let handle = tokio::spawn(
            async move {
                tokio::select! {
                    _ = controller => {
                        tracing::debug!("Controller exited on its own");
                    }
                    _ = shutdown_rx => {
                        tracing::debug!("Controller received shutdown signal");
                    }
                }
            }
            .instrument(span),
        );

        tokio::time::sleep(CONTROLLER_WARMUP).await;

        Self {
            handle,
            shutdown_tx: Some(shutdown_tx),
            namespace,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether the controller task has ended
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal shutdown and abort the task. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            // Receiver is gone if the controller already exited
            let _ = tx.send(());
            tracing::debug!(namespace = %self.namespace, "Stopping scoped controller");
        }
        self.handle.abort();
    }
}

impl Drop for ScopedController {
    fn drop(&mut self) {
        self.stop();
    }
}
