use std::time::Instant;

use async_trait::async_trait;
use tonic::transport::Channel;

/// The Rust-native stand-in for the original's `context.WithValue` marker-key
/// pattern (`examples/original_source/client/selector/strategy.go`): exactly
/// one hint may be set per call, and precedence between hints is fixed (see
/// [`crate::selector::Selector::select`]).
#[derive(Debug, Clone)]
pub enum RoutingHint {
    PinnedAddr(String),
    ConsistentHash(String),
    RoundRobin,
}

/// Per-call routing input threaded through the router.
///
/// `deadline` starts absent; the router fills it in for unary calls that
/// didn't set one (`spec.md` §4.1 step 2). Streaming calls are never given
/// a default.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub deadline: Option<Instant>,
    pub hint: Option<RoutingHint>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_pinned_addr(mut self, addr: impl Into<String>) -> Self {
        self.hint = Some(RoutingHint::PinnedAddr(addr.into()));
        self
    }

    pub fn with_consistent_hash(mut self, key: impl Into<String>) -> Self {
        self.hint = Some(RoutingHint::ConsistentHash(key.into()));
        self
    }

    pub fn with_round_robin(mut self) -> Self {
        self.hint = Some(RoutingHint::RoundRobin);
        self
    }
}

/// The channel the router handed off for one dispatch, along with the
/// address it was pooled under (useful to callers that want to log or
/// assert which backend served a call).
#[derive(Clone)]
pub struct PooledChannel {
    pub addr: String,
    pub channel: Channel,
}

/// One RPC method's encode/send/decode, supplied by whatever sits on top of
/// this crate (a generated-client shim, out of scope for this crate itself).
///
/// The router's job ends at handing over a live, pooled [`Channel`]; what
/// happens on the wire is the caller's concern, matching `spec.md`'s framing
/// of the downstream RPC as an external interface reached "at its interface"
/// only. A real implementation would typically wrap `tonic::client::Grpc`
/// around `channel` with the method's prost codec.
#[async_trait]
pub trait Call: Send + Sync {
    type Output: Send;

    async fn dispatch(self, channel: PooledChannel) -> Result<Self::Output, tonic::Status>;
}
