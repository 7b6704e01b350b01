pub mod port_forward;
pub mod sql;

pub use port_forward::{PortForward, PortForwardError};
pub use sql::{
    ClientCertificates, ConnectionMode, DbConnection, ProbeError, fetch_client_certificates,
};
