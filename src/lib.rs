//! Discovery-driven connection routing for tonic clients backed by a
//! pluggable registry (etcd by default).
//!
//! A [`router::Router`] resolves an outbound RPC's method string to a
//! service, asks that service's [`selector::Selector`] for a node, pools a
//! [`tonic::transport::Channel`] to that node's address, and hands it to a
//! caller-supplied [`call::Call`] implementation. Membership comes from a
//! [`registry::RegistryDriver`]; [`server::ServerRegistrar`] is the
//! collaborator a process uses to register its own services.

pub mod call;
pub mod error;
pub mod node;
pub mod pool;
pub mod registry;
pub mod router;
pub mod selector;
pub mod server;

pub use call::{Call, CallContext, PooledChannel, RoutingHint};
pub use error::{DialError, RegistryError, RouterError};
pub use node::{Event, EventKind, Node, ServiceSnapshot};
pub use pool::{ConnectionPool, Dialer, TcpDialer};
pub use registry::{Deregister, EtcdRegistry, EtcdRegistryOptions, EventStream, LogHook, RegistryDriver};
pub use router::{EventHook, Router, RouterOptions, SelectorFactory};
pub use selector::{Selector, UniversalSelector};
pub use server::{ServerError, ServerOptions, ServerRegistrar};
