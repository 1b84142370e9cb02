//! Per-service membership and selection strategy.
//!
//! `Selector` is a trait so a selector factory (`spec.md` §6 "Client
//! options") can substitute a different strategy per service, matching the
//! original's `WithSelectorFunc` (`examples/original_source/client/option.go`).
//! [`UniversalSelector`] is the default, implementing all four strategies
//! from `spec.md` §4.2.

mod ring;

use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use rand::Rng;

use crate::call::RoutingHint;
use crate::node::{Event, EventKind, Node};
use ring::ConsistentHashRing;

pub trait Selector: Send + Sync {
    /// Seeds membership from a bootstrap snapshot. Called at most once per
    /// selector, before any `on_event`.
    fn on_init(&self, nodes: Vec<Node>);

    /// Applies one membership change.
    fn on_event(&self, event: &Event);

    /// Picks a node for one call, honoring `hint` with the fixed precedence
    /// pinned > hash > round-robin > random (`spec.md` §4.2). Returns
    /// `None` on an empty node set, regardless of strategy.
    fn select(&self, hint: Option<&RoutingHint>) -> Option<Node>;

    /// Current membership snapshot; safe to call concurrently with
    /// `on_event` (copy-on-write, see `spec.md` §5).
    fn nodes(&self) -> Vec<Node>;
}

/// The default selector: a copy-on-write node list plus a consistent-hash
/// ring, both rebuilt together on every mutation.
pub struct UniversalSelector {
    nodes: ArcSwap<Vec<Node>>,
    ring: ArcSwap<ConsistentHashRing>,
    round_robin_counter: AtomicU64,
}

impl Default for UniversalSelector {
    fn default() -> Self {
        Self {
            nodes: ArcSwap::from_pointee(Vec::new()),
            ring: ArcSwap::from_pointee(ConsistentHashRing::build(Vec::new())),
            round_robin_counter: AtomicU64::new(0),
        }
    }
}

impl UniversalSelector {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, nodes: Vec<Node>) {
        let ring = ConsistentHashRing::build(nodes.clone());
        self.ring.store(std::sync::Arc::new(ring));
        self.nodes.store(std::sync::Arc::new(nodes));
    }
}

impl Selector for UniversalSelector {
    fn on_init(&self, nodes: Vec<Node>) {
        // Deduplicate by address, last-wins, per spec.md §4.2.
        let mut deduped: Vec<Node> = Vec::with_capacity(nodes.len());
        for node in nodes {
            deduped.retain(|n: &Node| n.addr != node.addr);
            deduped.push(node);
        }
        self.publish(deduped);
    }

    fn on_event(&self, event: &Event) {
        let mut nodes = (**self.nodes.load()).clone();
        match event.kind {
            EventKind::Create | EventKind::Update => {
                nodes.retain(|n| n.addr != event.node.addr);
                nodes.push(event.node.clone());
            }
            EventKind::Delete => {
                nodes.retain(|n| n.addr != event.node.addr);
            }
        }
        self.publish(nodes);
    }

    fn select(&self, hint: Option<&RoutingHint>) -> Option<Node> {
        let nodes = self.nodes.load();
        if nodes.is_empty() {
            return None;
        }
        match hint {
            Some(RoutingHint::PinnedAddr(addr)) => {
                nodes.iter().find(|n| &n.addr == addr).cloned()
            }
            Some(RoutingHint::ConsistentHash(key)) => {
                self.ring.load().lookup(key).cloned()
            }
            Some(RoutingHint::RoundRobin) => {
                let i = self.round_robin_counter.fetch_add(1, Ordering::Relaxed);
                Some(nodes[(i as usize) % nodes.len()].clone())
            }
            None => {
                let i = rand::thread_rng().gen_range(0..nodes.len());
                Some(nodes[i].clone())
            }
        }
    }

    fn nodes(&self) -> Vec<Node> {
        (**self.nodes.load()).clone()
    }
}
