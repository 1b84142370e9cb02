//! The interceptor: method parse → selector → pool → dispatch. See
//! `spec.md` §4.1.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::call::{Call, CallContext, PooledChannel};
use crate::error::RouterError;
use crate::node::{Event, EventKind};
use crate::pool::{ConnectionPool, Dialer, TcpDialer};
use crate::registry::{LogHook, RegistryDriver};
use crate::selector::{Selector, UniversalSelector};

const DEFAULT_UNARY_DEADLINE: Duration = Duration::from_secs(5);
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds a [`Selector`] for a service by name, so callers can substitute a
/// custom strategy per service (`spec.md` §6, the original's
/// `WithSelectorFunc`). The default factory always returns
/// [`UniversalSelector`].
pub type SelectorFactory = Box<dyn Fn(&str) -> Box<dyn Selector> + Send + Sync>;

/// Invoked after every membership event has been applied to its selector
/// (`spec.md` §4.1.3 step 3).
pub type EventHook = Box<dyn Fn(&Event) + Send + Sync>;

pub struct RouterOptions {
    pub selector_factory: SelectorFactory,
    pub dialer: Arc<dyn Dialer>,
    pub conn_size_per_addr: usize,
    pub dial_timeout: Duration,
    pub unary_deadline: Duration,
    pub event_hook: Option<EventHook>,
    /// Sink for background diagnostics the router itself emits (`spec.md`
    /// §6 "Client options", fifth item). Distinct from `event_hook`, which
    /// fires on every successfully-applied membership event regardless of
    /// health; this fires only when something the router can't surface to
    /// a caller goes wrong in the background, e.g. the registry event
    /// stream closing.
    pub log_hook: Option<LogHook>,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            selector_factory: Box::new(|_service| Box::new(UniversalSelector::new())),
            dialer: Arc::new(TcpDialer),
            conn_size_per_addr: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            unary_deadline: DEFAULT_UNARY_DEADLINE,
            event_hook: None,
            log_hook: None,
        }
    }
}

/// Discovery-driven channel-shaped router. Built once per registry; every
/// outbound call enters through [`Router::unary_call`] or
/// [`Router::server_streaming_call`] (`spec.md` §4.1).
pub struct Router {
    selectors: RwLock<HashMap<String, Arc<dyn Selector>>>,
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
    options: RouterOptions,
}

impl Router {
    /// Bootstraps from the registry's current snapshot, seeds every known
    /// service's selector, then spawns the long-lived event consumer
    /// (`spec.md` §4.1 "Bootstrap").
    pub async fn connect(
        registry: Arc<dyn RegistryDriver>,
        options: RouterOptions,
    ) -> Result<Arc<Self>, crate::error::RegistryError> {
        let (mut events, snapshot) = registry.watch_and_get().await?;

        let router = Arc::new(Self {
            selectors: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            options,
        });

        for (service, nodes) in snapshot.services {
            let selector = router.selector_for(&service);
            selector.on_init(nodes);
        }

        let router_for_task = router.clone();
        tokio::spawn(async move {
            use tokio_stream::StreamExt;
            while let Some(event) = events.next().await {
                router_for_task.handle_event(&event);
            }
            const MSG: &str = "registry event stream closed; router will stop receiving membership updates";
            tracing::warn!("{}", MSG);
            if let Some(hook) = &router_for_task.options.log_hook {
                hook(MSG, &());
            }
        });

        Ok(router)
    }

    fn selector_for(&self, service: &str) -> Arc<dyn Selector> {
        if let Some(sel) = self.selectors.read().get(service) {
            return sel.clone();
        }
        let mut selectors = self.selectors.write();
        selectors
            .entry(service.to_string())
            .or_insert_with(|| Arc::from((self.options.selector_factory)(service)))
            .clone()
    }

    /// Forwards an event to its service's selector unconditionally, then on
    /// `Delete` atomically drops that address's pool, then fires the
    /// user-supplied hook (`spec.md` §4.1.3). Update events deliberately
    /// never touch an existing pool — only a fresh dial does, per
    /// `spec.md` §9.
    fn handle_event(&self, event: &Event) {
        let selector = self.selector_for(&event.node.service_name);
        selector.on_event(event);

        if event.kind == EventKind::Delete {
            if let Some(pool) = self.pools.write().remove(&event.node.addr) {
                // Sole ownership means no in-flight dispatch still holds a
                // clone; close it right away rather than waiting on drop.
                // An in-flight caller's clone keeps the pool alive until it
                // finishes, then its own drop tears it down.
                if let Ok(pool) = Arc::try_unwrap(pool) {
                    pool.close();
                }
            }
        }

        if let Some(hook) = &self.options.event_hook {
            hook(event);
        }
    }

    async fn pool_for(&self, addr: &str) -> Result<Arc<ConnectionPool>, RouterError> {
        if let Some(pool) = self.pools.read().get(addr) {
            return Ok(pool.clone());
        }

        let pool = ConnectionPool::connect(
            addr,
            self.options.conn_size_per_addr.max(1),
            self.options.dial_timeout,
            self.options.dialer.as_ref(),
        )
        .await
        .map_err(|source| RouterError::PoolConstruction { addr: addr.to_string(), source })?;
        let pool = Arc::new(pool);

        let mut pools = self.pools.write();
        let pool = pools.entry(addr.to_string()).or_insert(pool).clone();
        Ok(pool)
    }

    /// Splits `/service/method` into its service component, rejecting
    /// anything that doesn't yield exactly three `/`-separated parts
    /// (`spec.md` §4.1 step 3).
    fn parse_service(method: &str) -> Result<&str, RouterError> {
        let parts: Vec<&str> = method.split('/').collect();
        match parts.as_slice() {
            ["", service, _method] if !service.is_empty() => Ok(service),
            _ => Err(RouterError::NonstandardMethod { method: method.to_string() }),
        }
    }

    async fn resolve(&self, method: &str, ctx: &CallContext) -> Result<PooledChannel, RouterError> {
        let service = Self::parse_service(method)?;

        let selector = self.selector_for(service);
        let node = selector
            .select(ctx.hint.as_ref())
            .ok_or_else(|| RouterError::ServiceNotFound { service: service.to_string() })?;

        let pool = self.pool_for(&node.addr).await?;
        Ok(PooledChannel { addr: node.addr.clone(), channel: pool.get() })
    }

    /// Unary dispatch: attaches the default deadline when `ctx` doesn't
    /// already carry one (`spec.md` §4.1 step 2).
    pub async fn unary_call<C: Call>(
        &self,
        method: &str,
        mut ctx: CallContext,
        call: C,
    ) -> Result<C::Output, RouterError> {
        if ctx.deadline.is_none() {
            ctx.deadline = Some(Instant::now() + self.options.unary_deadline);
        }
        let channel = self.resolve(method, &ctx).await?;
        call.dispatch(channel).await.map_err(RouterError::Downstream)
    }

    /// Streaming dispatch: never receives a default deadline (`spec.md`
    /// §5, "Streaming calls do not receive a default deadline").
    pub async fn server_streaming_call<C: Call>(
        &self,
        method: &str,
        ctx: CallContext,
        call: C,
    ) -> Result<C::Output, RouterError> {
        let channel = self.resolve(method, &ctx).await?;
        call.dispatch(channel).await.map_err(RouterError::Downstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Event, EventKind, Node, ServiceSnapshot};
    use crate::pool::test_support::LazyDialer;
    use crate::registry::fake::FakeRegistryDriver;
    use async_trait::async_trait;

    struct RecordAddr;

    #[async_trait]
    impl Call for RecordAddr {
        type Output = String;

        async fn dispatch(self, channel: PooledChannel) -> Result<String, tonic::Status> {
            Ok(channel.addr)
        }
    }

    fn test_options() -> RouterOptions {
        RouterOptions { dialer: Arc::new(LazyDialer), ..RouterOptions::default() }
    }

    #[tokio::test]
    async fn unary_call_round_robins_across_two_backends() {
        let mut snapshot = ServiceSnapshot::new();
        snapshot.insert(Node::new("svc", "127.0.0.1:1", vec![]));
        snapshot.insert(Node::new("svc", "127.0.0.1:2", vec![]));
        let registry = FakeRegistryDriver::new(snapshot);

        let router = Router::connect(registry, test_options()).await.unwrap();

        let mut addrs = std::collections::HashSet::new();
        for _ in 0..10 {
            let ctx = CallContext::new().with_round_robin();
            let addr = router
                .unary_call("/svc/Method", ctx, RecordAddr)
                .await
                .unwrap();
            addrs.insert(addr);
        }
        assert_eq!(addrs.len(), 2);
    }

    #[tokio::test]
    async fn pinned_address_absent_yields_service_not_found_style_none() {
        let mut snapshot = ServiceSnapshot::new();
        snapshot.insert(Node::new("svc", "127.0.0.1:1", vec![]));
        let registry = FakeRegistryDriver::new(snapshot);
        let router = Router::connect(registry, test_options()).await.unwrap();

        let ctx = CallContext::new().with_pinned_addr("127.0.0.1:9");
        let err = router
            .unary_call("/svc/Method", ctx, RecordAddr)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::ServiceNotFound { .. }));
    }

    #[tokio::test]
    async fn nonstandard_method_is_rejected_before_touching_any_selector() {
        let registry = FakeRegistryDriver::new(ServiceSnapshot::new());
        let router = Router::connect(registry, test_options()).await.unwrap();

        let err = router
            .unary_call("not-a-method", CallContext::new(), RecordAddr)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::NonstandardMethod { .. }));
    }

    #[tokio::test]
    async fn service_not_found_for_unknown_service() {
        let registry = FakeRegistryDriver::new(ServiceSnapshot::new());
        let router = Router::connect(registry, test_options()).await.unwrap();

        let err = router
            .unary_call("/missing/Method", CallContext::new(), RecordAddr)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::ServiceNotFound { .. }));
    }

    #[tokio::test]
    async fn delete_event_closes_pool_and_removes_node_from_selector() {
        let mut snapshot = ServiceSnapshot::new();
        snapshot.insert(Node::new("svc", "127.0.0.1:1", vec![]));
        let registry = FakeRegistryDriver::new(snapshot);
        let router = Router::connect(registry.clone(), test_options()).await.unwrap();

        // warm the pool
        router
            .unary_call("/svc/Method", CallContext::new(), RecordAddr)
            .await
            .unwrap();
        assert!(router.pools.read().contains_key("127.0.0.1:1"));

        registry
            .emit(Event::new(EventKind::Delete, Node::new("svc", "127.0.0.1:1", vec![])))
            .await;
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!router.pools.read().contains_key("127.0.0.1:1"));
        let err = router
            .unary_call("/svc/Method", CallContext::new(), RecordAddr)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::ServiceNotFound { .. }));
    }

    #[tokio::test]
    async fn unary_call_without_explicit_deadline_gets_a_default() {
        struct CheckDeadline;

        #[async_trait]
        impl Call for CheckDeadline {
            type Output = bool;

            async fn dispatch(self, _channel: PooledChannel) -> Result<bool, tonic::Status> {
                Ok(true)
            }
        }

        let mut snapshot = ServiceSnapshot::new();
        snapshot.insert(Node::new("svc", "127.0.0.1:1", vec![]));
        let registry = FakeRegistryDriver::new(snapshot);
        let router = Router::connect(registry, test_options()).await.unwrap();

        let ctx = CallContext::new();
        assert!(ctx.deadline.is_none());
        router.unary_call("/svc/Method", ctx, CheckDeadline).await.unwrap();
    }
}
