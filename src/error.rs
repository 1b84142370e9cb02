use thiserror::Error;

/// Errors surfaced to a caller dispatching through the [`crate::router::Router`].
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("nonstandard grpc method: {method:?}")]
    NonstandardMethod { method: String },

    #[error("service not found: {service}")]
    ServiceNotFound { service: String },

    #[error("failed to construct connection pool for {addr}: {source}")]
    PoolConstruction { addr: String, #[source] source: DialError },

    #[error("downstream rpc failed")]
    Downstream(#[source] tonic::Status),
}

/// Errors from a single dial attempt made by a [`crate::pool::Dialer`].
#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial {0} timed out after {1:?}")]
    Timeout(String, std::time::Duration),

    #[error("dial {addr} failed: {source}")]
    Transport { addr: String, #[source] source: tonic::transport::Error },
}

/// Errors from the registry driver.
///
/// Per-event decode errors are logged and skipped (`spec.md` §7); this enum
/// only surfaces the bootstrap-fatal and renewal-fatal cases.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("malformed registry key: {key:?}")]
    Decode { key: String },

    #[error("registry transport error")]
    Transport(#[source] etcd_client::Error),

    #[error("lease not found")]
    LeaseNotFound,

    #[error("registry call {what} timed out")]
    Timeout { what: &'static str },
}
