//! Registers a process's own services with the registry, renews them for
//! the process's lifetime, and drains them on shutdown. See `spec.md` §4.5
//! ("collaborator, sketched for context") and
//! `examples/original_source/server/{server,addr}.go`.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;

use crate::error::RegistryError;
use crate::node::Node;
use crate::registry::{Deregister, RegistryDriver};

const DEFAULT_DRAIN_DURATION: Duration = Duration::from_secs(1);

const PRIVATE_BLOCKS: &[&str] =
    &["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "100.64.0.0/10", "fd00::/8"];

fn is_private_ip(ip: IpAddr) -> bool {
    PRIVATE_BLOCKS
        .iter()
        .filter_map(|cidr| IpNet::from_str(cidr).ok())
        .any(|block| block.contains(&ip))
}

/// Scans local interfaces for the first address inside one of the
/// well-known private blocks (`examples/original_source/server/addr.go`).
fn private_ip() -> Result<IpAddr, ServerError> {
    for iface in if_addrs::get_if_addrs().map_err(ServerError::Interfaces)? {
        let ip = iface.ip();
        if is_private_ip(ip) {
            return Ok(ip);
        }
    }
    Err(ServerError::NoPrivateIp)
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to enumerate local interfaces")]
    Interfaces(#[source] std::io::Error),

    #[error("no private IP address found on any local interface")]
    NoPrivateIp,

    #[error("listen address {0:?} has no port")]
    MissingPort(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub metadata: Vec<u8>,
    pub drain_duration: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self { metadata: Vec::new(), drain_duration: DEFAULT_DRAIN_DURATION }
    }
}

/// Registers this process's services under a single resolved listen
/// address, and deregisters them on graceful shutdown.
///
/// Construction resolves an address with an empty host to a local private
/// IP (`spec.md` §6); an address that already names a host is used as-is.
pub struct ServerRegistrar {
    addr: String,
    registry: std::sync::Arc<dyn RegistryDriver>,
    options: ServerOptions,
    deregister_hooks: Vec<Deregister>,
}

impl ServerRegistrar {
    pub fn new(
        addr: &str,
        registry: std::sync::Arc<dyn RegistryDriver>,
        options: ServerOptions,
    ) -> Result<Self, ServerError> {
        let addr = resolve_listen_addr(addr)?;
        Ok(Self { addr, registry, options, deregister_hooks: Vec::new() })
    }

    pub fn listen_addr(&self) -> &str {
        &self.addr
    }

    /// Registers one `(service, this process's addr)` node per name in
    /// `service_names`, storing each deregister hook bound to its own node
    /// (`examples/original_source/server/server.go::register` — the Go
    /// original's hooks close over a per-iteration binding too, but only
    /// because `:=` happens to rebind inside the loop body there; Rust's
    /// move closures make that correctness property structural rather than
    /// incidental).
    ///
    /// If any registration fails partway through, every hook already
    /// obtained in this call is fired before returning the error — the
    /// original's `defer g.deregister()` rolls back the same way rather
    /// than leaving earlier services live in etcd with no local record of
    /// them.
    pub async fn register(&mut self, service_names: &[&str]) -> Result<(), ServerError> {
        let mut obtained = Vec::new();
        for &service_name in service_names {
            let node = Node::new(service_name, self.addr.clone(), self.options.metadata.clone());
            match self.registry.register(node.clone()).await {
                Ok(deregister) => {
                    tracing::info!(?node, "register");
                    obtained.push(deregister);
                }
                Err(err) => {
                    tracing::error!(error = %err, ?node, "registration failed, rolling back prior registrations");
                    for hook in obtained {
                        hook.fire();
                    }
                    return Err(err.into());
                }
            }
        }
        self.deregister_hooks.extend(obtained);
        Ok(())
    }

    /// Fires every deregister hook, then sleeps the configured drain
    /// duration so in-flight calls routed to this node before the deletion
    /// propagates have a chance to complete (`spec.md` §4.5).
    pub async fn graceful_shutdown(self) {
        for hook in self.deregister_hooks {
            hook.fire();
        }
        tokio::time::sleep(self.options.drain_duration).await;
    }
}

fn resolve_listen_addr(addr: &str) -> Result<String, ServerError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ServerError::MissingPort(addr.to_string()))?;
    if host.is_empty() {
        let ip = private_ip()?;
        Ok(format!("{ip}:{port}"))
    } else {
        Ok(addr.to_string())
    }
}
