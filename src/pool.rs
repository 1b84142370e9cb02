//! Per-address bundle of persistent connections. See `spec.md` §4.4.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};

use crate::error::DialError;

/// Dials one backend address into a usable [`Channel`].
///
/// Pluggable so tests can swap in a dialer that never touches the network —
/// mirroring the teacher's own pluggable `transport::Transport` /
/// `inmemory` pair (`examples/easwars-tonic/grpc/src/client/transport/mod.rs`,
/// `.../inmemory/mod.rs`).
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str, timeout: Duration) -> Result<Channel, DialError>;
}

/// Default dialer: connects a real `http://` endpoint with a blocking
/// connect and a 5s-by-default timeout (`spec.md` §4.4).
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str, timeout: Duration) -> Result<Channel, DialError> {
        let uri = format!("http://{addr}");
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|source| DialError::Transport { addr: addr.to_string(), source })?
            .connect_timeout(timeout);
        tokio::time::timeout(timeout, endpoint.connect())
            .await
            .map_err(|_| DialError::Timeout(addr.to_string(), timeout))?
            .map_err(|source| DialError::Transport { addr: addr.to_string(), source })
    }
}

/// A fixed-size bundle of channels to one address, dispatched round-robin.
///
/// Construction is all-or-nothing: if any dial fails, every channel already
/// opened is dropped and the error is surfaced (`spec.md` §3 invariant: "on
/// partial failure none are retained").
pub struct ConnectionPool {
    addr: String,
    channels: Vec<Channel>,
    counter: AtomicUsize,
}

impl ConnectionPool {
    pub async fn connect(
        addr: &str,
        size: usize,
        dial_timeout: Duration,
        dialer: &dyn Dialer,
    ) -> Result<Self, DialError> {
        let mut channels = Vec::with_capacity(size);
        for _ in 0..size {
            channels.push(dialer.dial(addr, dial_timeout).await?);
        }
        Ok(Self { addr: addr.to_string(), channels, counter: AtomicUsize::new(0) })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Round-robin dispatch; the counter always advances, even for a
    /// single-channel pool (`spec.md` §8 boundary behavior).
    pub fn get(&self) -> Channel {
        let i = self.counter.fetch_add(1, Ordering::Relaxed);
        self.channels[i % self.channels.len()].clone()
    }

    /// No-op beyond dropping the channels: `tonic::transport::Channel` has
    /// no explicit close, it tears down its connection on drop. Kept as an
    /// explicit method so call sites read the way `spec.md` §4.4 describes
    /// teardown, and so it is safe to call on a pool that failed partway
    /// through construction (there is none, by the invariant above, but
    /// callers that hold a `Vec<ConnectionPool>` during an abort path can
    /// still call this uniformly).
    pub fn close(self) {
        drop(self);
    }
}

/// A dialer that never performs I/O, for tests and examples that want the
/// router's full construction/dispatch path without a live listener —
/// mirroring the teacher's own always-available `inmemory` transport
/// rather than gating it behind `cfg(test)` (integration tests in `tests/`
/// link this crate as an ordinary dependency, where `cfg(test)` items are
/// invisible).
pub mod test_support {
    use super::*;

    /// `connect_lazy` defers the actual connection attempt to first use, so
    /// pool construction always succeeds regardless of whether `addr` is
    /// reachable. This is what lets `spec.md` §8's end-to-end scenarios run
    /// without a live listener.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct LazyDialer;

    #[async_trait]
    impl Dialer for LazyDialer {
        async fn dial(&self, addr: &str, _timeout: Duration) -> Result<Channel, DialError> {
            let uri = format!("http://{addr}");
            let endpoint = Endpoint::from_shared(uri)
                .map_err(|source| DialError::Transport { addr: addr.to_string(), source })?;
            Ok(endpoint.connect_lazy())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::LazyDialer;
    use super::*;

    #[tokio::test]
    async fn pool_of_one_reuses_same_channel_counter_still_advances() {
        let pool = ConnectionPool::connect("127.0.0.1:1", 1, Duration::from_secs(1), &LazyDialer)
            .await
            .unwrap();
        let before = pool.counter.load(Ordering::Relaxed);
        let _ = pool.get();
        let _ = pool.get();
        assert_eq!(pool.counter.load(Ordering::Relaxed), before + 2);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn pool_size_matches_requested_count() {
        let pool = ConnectionPool::connect("127.0.0.1:1", 4, Duration::from_secs(1), &LazyDialer)
            .await
            .unwrap();
        assert_eq!(pool.len(), 4);
    }
}
