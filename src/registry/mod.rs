//! The registry watch protocol: the contract between the discovery backend
//! and the router (`spec.md` §4.5).

mod etcd;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::RegistryError;
use crate::node::{Node, ServiceSnapshot};

pub use etcd::{EtcdRegistry, EtcdRegistryOptions};

/// A stream of membership events; closes when the underlying watch
/// terminates (`spec.md` §4.5).
pub type EventStream = ReceiverStream<crate::node::Event>;

/// Caller-supplied sink for background diagnostics that aren't fatal enough
/// to surface as an error (`spec.md` §6 "Client options" / §7: background
/// errors are "logged through the injected hook"). `Arc`-wrapped so the same
/// hook can be shared between a [`crate::router::RouterOptions`] and an
/// [`EtcdRegistryOptions`] and cloned into background tasks.
pub type LogHook = Arc<dyn Fn(&str, &dyn std::fmt::Debug) + Send + Sync>;

/// A live registration; dropping this without calling [`Deregister::fire`]
/// leaves the node registered until its lease expires on its own.
pub struct Deregister {
    inner: Box<dyn FnOnce() + Send>,
}

impl Deregister {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self { inner: Box::new(f) }
    }

    /// Stops the renewal ticker and best-effort deletes the key
    /// (`spec.md` §4.5 step 4). Safe to call at most once; the type is
    /// consumed so a second call is a compile error rather than a
    /// double-deregister race.
    pub fn fire(self) {
        (self.inner)()
    }
}

/// The contract the router depends on (`spec.md` §4.5): `watch_and_get` for
/// bootstrap + live updates, `register` for server-side liveness.
#[async_trait]
pub trait RegistryDriver: Send + Sync {
    async fn watch_and_get(&self) -> Result<(EventStream, ServiceSnapshot), RegistryError>;

    async fn register(&self, node: Node) -> Result<Deregister, RegistryError>;
}

/// An in-process `RegistryDriver`, analogous to the teacher's always-on
/// `inmemory` transport (not gated behind `cfg(test)`, so integration tests
/// under `tests/` — which link this crate as an ordinary dependency — can
/// use it too): lets router/selector/pool tests exercise the full
/// bootstrap + event-loop path without a live etcd.
pub mod fake {
    use super::*;
    use crate::node::Event;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    pub struct FakeRegistryDriver {
        snapshot: Mutex<ServiceSnapshot>,
        event_tx: mpsc::Sender<Event>,
        event_rx: Mutex<Option<mpsc::Receiver<Event>>>,
        registered: Mutex<Vec<Node>>,
    }

    impl FakeRegistryDriver {
        pub fn new(snapshot: ServiceSnapshot) -> Arc<Self> {
            let (event_tx, event_rx) = mpsc::channel(16);
            Arc::new(Self {
                snapshot: Mutex::new(snapshot),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                registered: Mutex::new(Vec::new()),
            })
        }

        /// Pushes an event to whoever is currently watching.
        pub async fn emit(&self, event: Event) {
            let _ = self.event_tx.send(event).await;
        }

        pub async fn registered_nodes(&self) -> Vec<Node> {
            self.registered.lock().await.clone()
        }
    }

    #[async_trait]
    impl RegistryDriver for FakeRegistryDriver {
        async fn watch_and_get(&self) -> Result<(EventStream, ServiceSnapshot), RegistryError> {
            let rx = self.event_rx.lock().await.take().expect("watch_and_get called twice on fake driver");
            Ok((ReceiverStream::new(rx), self.snapshot.lock().await.clone()))
        }

        async fn register(&self, node: Node) -> Result<Deregister, RegistryError> {
            self.registered.lock().await.push(node);
            Ok(Deregister::new(|| {}))
        }
    }
}
