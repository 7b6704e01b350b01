//! SQL connections to a CrdbCluster through a port-forward
//!
//! CockroachDB speaks the PostgreSQL wire protocol, so the probe uses
//! tokio-postgres. Insecure clusters accept `root` without TLS; secure
//! clusters require the root client certificate the operator stores in the
//! `{cluster}-root` secret.
//!
//! When a `DbConnection` is dropped, both the SQL connection and the port
//! forward are closed.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio_postgres::{NoTls, Row};
use tokio_postgres_rustls_improved::MakeRustlsConnect;

use super::port_forward::{PortForward, PortForwardError};

/// SQL port of every CockroachDB node
pub const SQL_PORT: u16 = 26257;

pub const ROOT_USER: &str = "root";

pub const DEFAULT_DATABASE: &str = "defaultdb";

/// Database the probe writes into
const PROBE_DATABASE: &str = "e2e_probe";

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Connection failed: {0}")]
    Connection(#[from] tokio_postgres::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Port forward error: {0}")]
    PortForward(#[from] PortForwardError),

    #[error("Certificate secret not found: {0}")]
    SecretNotFound(String),

    #[error("Secret missing required key: {0}")]
    SecretMissingKey(String),

    #[error("Invalid UTF-8 in secret data")]
    InvalidUtf8,

    #[error("Query failed: {0}")]
    Query(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Expected {expected} rows, found {actual}")]
    UnexpectedRowCount { expected: i64, actual: i64 },

    #[error("Connection TLS is {actual}, cluster expects {expected}")]
    SecurityMismatch { expected: bool, actual: bool },
}

pub type ProbeResult<T> = Result<T, ProbeError>;

/// PEM material for a TLS client connection
#[derive(Clone)]
pub struct ClientCertificates {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for ClientCertificates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCertificates").finish_non_exhaustive()
    }
}

impl ClientCertificates {
    /// Extract `ca.crt`, `tls.crt` and `tls.key` from a TLS secret
    pub fn from_secret(secret: &Secret) -> ProbeResult<Self> {
        let data = secret
            .data
            .as_ref()
            .ok_or_else(|| ProbeError::SecretMissingKey("no data in secret".into()))?;

        let read = |key: &str| -> ProbeResult<String> {
            let bytes = data
                .get(key)
                .ok_or_else(|| ProbeError::SecretMissingKey(key.to_string()))?;
            String::from_utf8(bytes.0.clone()).map_err(|_| ProbeError::InvalidUtf8)
        };

        Ok(Self {
            ca_pem: read("ca.crt")?,
            cert_pem: read("tls.crt")?,
            key_pem: read("tls.key")?,
        })
    }
}

/// Fetch client certificates from a Kubernetes secret
pub async fn fetch_client_certificates(
    client: &Client,
    namespace: &str,
    secret_name: &str,
) -> ProbeResult<ClientCertificates> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);

    let secret = secrets.get(secret_name).await.map_err(|e| match &e {
        kube::Error::Api(api_err) if api_err.code == 404 => {
            ProbeError::SecretNotFound(secret_name.to_string())
        }
        _ => ProbeError::Kube(e),
    })?;

    ClientCertificates::from_secret(&secret)
}

/// How to talk to the cluster
#[derive(Debug, Clone)]
pub enum ConnectionMode {
    Insecure,
    Tls(ClientCertificates),
}

/// SQL connection via kube-rs port-forward
pub struct DbConnection {
    client: tokio_postgres::Client,
    tls: bool,
    _port_forward: PortForward,
}

impl DbConnection {
    /// Connect as root to a running node of `cluster`
    pub async fn connect(
        kube_client: &Client,
        namespace: &str,
        cluster: &str,
        mode: ConnectionMode,
    ) -> ProbeResult<Self> {
        let pf = PortForward::to_cluster(kube_client.clone(), namespace, cluster, SQL_PORT).await?;
        let local_port = pf.local_port();

        let (client, tls) = match &mode {
            ConnectionMode::Insecure => {
                let config = connection_string(local_port, "disable");
                let (client, connection) = tokio_postgres::connect(&config, NoTls).await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::trace!(error = %e, "SQL connection closed");
                    }
                });
                (client, false)
            }
            ConnectionMode::Tls(certs) => {
                let tls = build_tls_connector(certs)?;
                let config = connection_string(local_port, "require");
                let (client, connection) = tokio_postgres::connect(&config, tls).await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::trace!(error = %e, "SQL TLS connection closed");
                    }
                });
                (client, true)
            }
        };

        tracing::debug!(
            cluster = cluster,
            pod = pf.pod(),
            local_port = local_port,
            tls = tls,
            "SQL connection established"
        );

        Ok(Self {
            client,
            tls,
            _port_forward: pf,
        })
    }

    /// Whether this connection negotiated TLS
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub async fn batch_execute(&self, sql: &str) -> ProbeResult<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| ProbeError::Query(e.to_string()))
    }

    pub async fn query_one(&self, sql: &str) -> ProbeResult<Row> {
        self.client
            .query_one(sql, &[])
            .await
            .map_err(|e| ProbeError::Query(e.to_string()))
    }
}

/// Fail unless the connection's transport matches the cluster's security mode
pub fn ensure_security(conn: &DbConnection, expect_tls: bool) -> ProbeResult<()> {
    check_security(expect_tls, conn.is_tls())
}

fn check_security(expected: bool, actual: bool) -> ProbeResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ProbeError::SecurityMismatch { expected, actual })
    }
}

fn connection_string(local_port: u16, sslmode: &str) -> String {
    // `localhost` matches the SAN on operator-issued node certificates
    format!(
        "host=localhost port={} user={} dbname={} sslmode={} connect_timeout=10",
        local_port, ROOT_USER, DEFAULT_DATABASE, sslmode
    )
}

/// Write two rows and read them back
pub async fn run_smoke_queries(conn: &DbConnection) -> ProbeResult<()> {
    conn.batch_execute(&format!(
        "CREATE DATABASE IF NOT EXISTS {db};
         CREATE TABLE IF NOT EXISTS {db}.accounts (id INT PRIMARY KEY, balance INT);
         UPSERT INTO {db}.accounts (id, balance) VALUES (1, 1000), (2, 250);",
        db = PROBE_DATABASE
    ))
    .await?;

    let row = conn
        .query_one(&format!("SELECT count(*) FROM {}.accounts", PROBE_DATABASE))
        .await?;
    let count: i64 = row
        .try_get(0)
        .map_err(|e| ProbeError::Query(e.to_string()))?;

    if count != 2 {
        return Err(ProbeError::UnexpectedRowCount {
            expected: 2,
            actual: count,
        });
    }
    Ok(())
}

// =============================================================================
// TLS Configuration
// =============================================================================

/// Install the process-wide rustls crypto provider if none is set yet
pub fn ensure_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_none() {
        // Losing the race to another thread is fine
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

/// Parse PEM-encoded certificates into DER format
fn parse_pem_certificates(pem_data: &str) -> ProbeResult<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem_data.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            ProbeError::InvalidCertificate(format!("Failed to parse certificate: {}", e))
        })?;

    if certs.is_empty() {
        return Err(ProbeError::InvalidCertificate(
            "No certificates found in PEM data".to_string(),
        ));
    }

    Ok(certs)
}

fn parse_private_key(pem_data: &str) -> ProbeResult<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem_data.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProbeError::InvalidCertificate(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| ProbeError::InvalidCertificate("No private key found in PEM data".into()))
}

/// Build a rustls connector that verifies the server against the cluster CA
/// and authenticates with the client certificate
fn build_tls_connector(certs: &ClientCertificates) -> ProbeResult<MakeRustlsConnect> {
    ensure_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    for cert in parse_pem_certificates(&certs.ca_pem)? {
        root_store.add(cert).map_err(|e| {
            ProbeError::InvalidCertificate(format!("Failed to add CA cert: {}", e))
        })?;
    }

    let chain = parse_pem_certificates(&certs.cert_pem)?;
    let key = parse_private_key(&certs.key_pem)?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(Arc::new(root_store))
        .with_client_auth_cert(chain, key)
        .map_err(|e| ProbeError::TlsConfig(e.to_string()))?;

    Ok(MakeRustlsConnect::new(config))
}
