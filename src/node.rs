use std::collections::HashMap;

/// A backend instance registered under some service name.
///
/// Identity within a service is `addr` alone; `metadata` is opaque to this
/// crate and carried verbatim from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub service_name: String,
    pub addr: String,
    pub metadata: Vec<u8>,
}

impl Node {
    pub fn new(service_name: impl Into<String>, addr: impl Into<String>, metadata: Vec<u8>) -> Self {
        Self { service_name: service_name.into(), addr: addr.into(), metadata }
    }
}

/// What happened to a [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

/// A single membership change, carrying exactly one node.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub node: Node,
}

impl Event {
    pub fn new(kind: EventKind, node: Node) -> Self {
        Self { kind, node }
    }
}

/// The full registry contents at a single moment, as returned by
/// `RegistryDriver::watch_and_get`'s initial snapshot.
#[derive(Debug, Clone, Default)]
pub struct ServiceSnapshot {
    pub services: HashMap<String, Vec<Node>>,
}

impl ServiceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Node) {
        self.services.entry(node.service_name.clone()).or_default().push(node);
    }
}
