//! Control-plane lifecycle for e2e runs
//!
//! An [`Environment`] is either an existing cluster reached through the
//! ambient kubeconfig (~/.kube/config or KUBECONFIG), or a kind cluster the
//! harness launches itself. Either way `start` only returns once the API
//! server answers and the CrdbCluster CRD is established.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Api, Client, Config, CustomResourceExt, Resource};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::crd::CrdbCluster;
use crate::error::{Error, Result};
use crate::wait::{PollPolicy, Sample, poll_until};

/// Field manager used for server-side apply of the CRD
const FIELD_MANAGER: &str = "crdb-e2e";

/// Budget for the CRD to become Established
const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between API server readiness checks during startup
const STARTUP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How the control plane is obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    /// Use whatever cluster the ambient kubeconfig points at
    Kubeconfig,
    /// Launch (or reuse) a kind cluster with this name
    Kind { cluster_name: String },
}

#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub provider: Provider,
    /// Budget for the API server to answer once launched
    pub startup_timeout: Duration,
    /// Install the CrdbCluster CRD on start
    pub install_crd: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Kubeconfig,
            startup_timeout: Duration::from_secs(120),
            install_crd: true,
        }
    }
}

impl EnvironmentConfig {
    pub fn kind(cluster_name: &str) -> Self {
        Self {
            provider: Provider::Kind {
                cluster_name: cluster_name.to_string(),
            },
            ..Self::default()
        }
    }
}

/// A running control plane
pub struct Environment {
    kube_config: Config,
    /// Kind cluster this environment launched and must delete on stop
    owned_kind_cluster: Option<String>,
    /// Holds the generated kubeconfig of an owned kind cluster
    temp_dir: Mutex<Option<TempDir>>,
    stopped: AtomicBool,
}

impl Environment {
    /// Bring up the control plane and block until it accepts requests
    pub async fn start(config: EnvironmentConfig) -> Result<Self> {
        let (kube_config, owned_kind_cluster, temp_dir) = match &config.provider {
            Provider::Kubeconfig => {
                let kube_config = Config::infer()
                    .await
                    .map_err(|e| Error::EnvironmentStartup(format!("infer kubeconfig: {}", e)))?;
                (kube_config, None, None)
            }
            Provider::Kind { cluster_name } => launch_kind(cluster_name).await?,
        };

        let env = Self {
            kube_config,
            owned_kind_cluster,
            temp_dir: Mutex::new(temp_dir),
            stopped: AtomicBool::new(false),
        };

        if let Err(e) = env.wait_until_serving(config.startup_timeout).await {
            let _ = env.stop().await;
            return Err(e);
        }

        if config.install_crd {
            if let Err(e) = install_crd(env.client()?).await {
                let _ = env.stop().await;
                return Err(Error::EnvironmentStartup(format!("install CRD: {}", e)));
            }
        }

        Ok(env)
    }

    /// Create a fresh client for this control plane
    pub fn client(&self) -> Result<Client> {
        Ok(Client::try_from(self.kube_config.clone())?)
    }

    /// Kubeconfig written for a kind cluster this environment launched
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.temp_dir
            .lock()
            .ok()
            .and_then(|dir| dir.as_ref().map(|d| d.path().join("kubeconfig")))
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Tear the control plane down. Safe to call more than once.
    ///
    /// Only a kind cluster this environment created is deleted; a reused
    /// cluster is left running.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(name) = &self.owned_kind_cluster {
            tracing::info!(cluster = %name, "Deleting kind cluster");
            match Command::new("kind")
                .args(["delete", "cluster", "--name", name])
                .output()
                .await
            {
                Ok(output) if output.status.success() => {}
                Ok(output) => tracing::warn!(
                    cluster = %name,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "kind delete cluster failed"
                ),
                Err(e) => tracing::warn!(cluster = %name, error = %e, "Failed to run kind"),
            }
        }

        self.drop_temp_dir();
        Ok(())
    }

    fn drop_temp_dir(&self) {
        if let Ok(mut dir) = self.temp_dir.lock() {
            dir.take();
        }
    }

    async fn wait_until_serving(&self, timeout: Duration) -> Result<()> {
        let client = self.client()?;
        let policy = PollPolicy::new(STARTUP_POLL_INTERVAL, timeout);

        let version = poll_until(policy, &CancellationToken::new(), || {
            let client = client.clone();
            async move {
                match client.apiserver_version().await {
                    Ok(version) => Sample::Done(version),
                    Err(e) => Sample::Pending(e.to_string()),
                }
            }
        })
        .await
        .map_err(|e| {
            let polls = e.polls();
            let last = e.into_last().unwrap_or_default();
            Error::EnvironmentStartup(format!(
                "API server not ready after {:?} ({} attempts): {}",
                timeout, polls, last
            ))
        })?;

        tracing::info!(
            "Connected to Kubernetes cluster: {} {}",
            version.platform,
            version.git_version
        );
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(name) = &self.owned_kind_cluster {
            // No runtime guarantees in drop, fall back to a blocking call
            match std::process::Command::new("kind")
                .args(["delete", "cluster", "--name", name])
                .output()
            {
                Ok(_) => tracing::debug!(cluster = %name, "Deleted kind cluster on drop"),
                Err(e) => tracing::warn!(cluster = %name, error = %e, "kind delete on drop failed"),
            }
        }
        self.drop_temp_dir();
    }
}

/// Start a kind cluster, or reuse an existing one with the same name
async fn launch_kind(name: &str) -> Result<(Config, Option<String>, Option<TempDir>)> {
    if kind_cluster_exists(name).await? {
        tracing::info!(cluster = %name, "Kind cluster already exists, reusing it");
        let output = run_kind(&["get", "kubeconfig", "--name", name]).await?;
        let kubeconfig = Kubeconfig::from_yaml(&output)
            .map_err(|e| Error::EnvironmentStartup(format!("parse kind kubeconfig: {}", e)))?;
        let config = config_from_kubeconfig(kubeconfig).await?;
        return Ok((config, None, None));
    }

    let temp_dir = tempfile::Builder::new()
        .prefix("crdb-e2e-")
        .tempdir()
        .map_err(|e| Error::EnvironmentStartup(format!("create temp dir: {}", e)))?;
    let kubeconfig_path = temp_dir.path().join("kubeconfig");

    tracing::info!(cluster = %name, "Creating kind cluster");
    run_kind(&[
        "create",
        "cluster",
        "--name",
        name,
        "--wait",
        "60s",
        "--kubeconfig",
        &path_str(&kubeconfig_path)?,
    ])
    .await?;

    let kubeconfig = Kubeconfig::read_from(&kubeconfig_path)
        .map_err(|e| Error::EnvironmentStartup(format!("read kind kubeconfig: {}", e)))?;
    let config = config_from_kubeconfig(kubeconfig).await?;

    Ok((config, Some(name.to_string()), Some(temp_dir)))
}

async fn kind_cluster_exists(name: &str) -> Result<bool> {
    let clusters = run_kind(&["get", "clusters"]).await?;
    Ok(clusters.lines().any(|line| line.trim() == name))
}

/// Run a kind subcommand and return its stdout
async fn run_kind(args: &[&str]) -> Result<String> {
    let output = Command::new("kind")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::EnvironmentStartup(format!("failed to run kind: {}", e)))?;

    if !output.status.success() {
        return Err(Error::EnvironmentStartup(format!(
            "kind {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn config_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Config> {
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::EnvironmentStartup(format!("load kubeconfig: {}", e)))
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| Error::EnvironmentStartup(format!("non UTF-8 path: {:?}", path)))
}

/// Make sure the CrdbCluster CRD exists and is established.
///
/// A CRD that is already present belongs to whoever installed it, usually the
/// deployed operator, and is never overwritten. It only has to serve the
/// version the harness submits.
pub async fn install_crd(client: Client) -> Result<()> {
    let crd = CrdbCluster::crd();
    let name = crd
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::EnvironmentStartup("generated CRD has no name".to_string()))?;

    let crds: Api<CustomResourceDefinition> = Api::all(client);

    match crds.get_opt(&name).await? {
        Some(existing) => {
            check_served_version(&existing, &CrdbCluster::version(&()))?;
            tracing::info!(crd = %name, "CRD already installed, leaving it as is");
        }
        None => {
            tracing::info!(crd = %name, "Installing CRD");
            crds.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&crd))
                .await?;
        }
    }

    let establish = await_condition(crds, &name, conditions::is_crd_established());
    tokio::time::timeout(CRD_ESTABLISH_TIMEOUT, establish)
        .await
        .map_err(|_| Error::EnvironmentStartup(format!("CRD {} not established", name)))?
        .map_err(|e| Error::EnvironmentStartup(format!("watch CRD {}: {}", name, e)))?;

    tracing::info!(crd = %name, "CRD established");
    Ok(())
}

/// An installed CRD must serve `version` for submissions to be accepted
fn check_served_version(crd: &CustomResourceDefinition, version: &str) -> Result<()> {
    let served = crd
        .spec
        .versions
        .iter()
        .any(|v| v.name == version && v.served);
    if served {
        Ok(())
    } else {
        Err(Error::EnvironmentStartup(format!(
            "installed CRD {} does not serve version {}",
            crd.metadata.name.as_deref().unwrap_or_default(),
            version
        )))
    }
}

/// Process-wide environment shared by every test in a binary
static SHARED_ENVIRONMENT: OnceCell<Arc<Environment>> = OnceCell::const_new();

/// Access to the environment shared across one test binary.
///
/// The shared environment lives in a static and is never stopped, so it can
/// only use a control plane that outlives the process: the ambient kubeconfig
/// or a kind cluster that already exists.
pub struct SharedEnvironment;

impl SharedEnvironment {
    /// Get or start the shared environment. Only the first call's config is used.
    ///
    /// A kind provider naming a cluster that does not exist yet is rejected,
    /// since nothing would ever delete the cluster it launches.
    pub async fn get(config: EnvironmentConfig) -> Result<Arc<Environment>> {
        if let Provider::Kind { cluster_name } = &config.provider {
            if SHARED_ENVIRONMENT.get().is_none() && !kind_cluster_exists(cluster_name).await? {
                return Err(Error::EnvironmentStartup(format!(
                    "kind cluster {} must exist before it can back a shared environment",
                    cluster_name
                )));
            }
        }

        SHARED_ENVIRONMENT
            .get_or_try_init(|| async { Environment::start(config).await.map(Arc::new) })
            .await
            .map(Arc::clone)
    }
}
