//! Error taxonomy for tunnel orchestration.
//!
//! Collaborators that only talk to the cluster return `anyhow::Result`;
//! the orchestrator wraps those failures with the step that produced them so
//! the user sees one line naming what went wrong.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TunnelError>;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("port forward not found: {0}")]
    SessionNotFound(String),

    #[error("service {namespace}/{service} not found")]
    ServiceNotFound { namespace: String, service: String },

    #[error("tunnel already registered: {0}")]
    AlreadyRegistered(String),

    #[error("port forward already exists: {0}")]
    SessionExists(String),

    #[error("no available port found starting from {0}")]
    NoAvailablePort(u16),

    #[error("service {namespace}/{service} cannot be tunneled: {reason}")]
    Ineligible {
        namespace: String,
        service: String,
        reason: &'static str,
    },

    #[error("no HTTP port found for service {namespace}/{service}")]
    NoHttpPort { namespace: String, service: String },

    #[error("no matching pods found for service {namespace}/{service}")]
    NoMatchingPods { namespace: String, service: String },

    #[error("could not determine pod port for service {namespace}/{service}")]
    NoPodPort { namespace: String, service: String },

    #[error("no services found to register in context {0}")]
    NoServicesRegistered(String),

    /// One service of a batch failed; every tunnel of the batch was rolled back.
    #[error("register {service}: {source} (batch rolled back)")]
    Batch {
        service: String,
        #[source]
        source: Box<TunnelError>,
    },

    #[error("cannot write hosts file {0} (run with sudo)")]
    HostsPermissionDenied(String),

    #[error("hosts file: {0}")]
    Hosts(#[from] std::io::Error),

    #[error("proxy: {0}")]
    Proxy(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Cluster API or stream setup failure, tagged with the failing step.
    #[error("{step}: {source:#}")]
    Cluster {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl TunnelError {
    pub fn cluster(step: &'static str, source: anyhow::Error) -> Self {
        TunnelError::Cluster { step, source }
    }

    /// Returns true for the not-found family, which teardown paths tolerate.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TunnelError::TunnelNotFound(_)
                | TunnelError::SessionNotFound(_)
                | TunnelError::ServiceNotFound { .. }
        )
    }
}
