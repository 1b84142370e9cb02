//! etcd-backed [`super::RegistryDriver`]. Key layout, event mapping, and the
//! lease lifecycle mirror `examples/original_source/registry/etcdv3/etcdv3.go`
//! behaviorally; the shape is idiomatic async Rust.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions, WatchOptions,
};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::RegistryError;
use crate::node::{Event, EventKind, Node, ServiceSnapshot};

use super::{Deregister, EventStream, LogHook, RegistryDriver};

const DEFAULT_PREFIX: &str = "/services";
const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);
const CALL_DEADLINE: Duration = Duration::from_secs(5);
const KEEPALIVE_MAX_ATTEMPTS: u32 = 5;
const KEEPALIVE_INITIAL_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct EtcdRegistryOptions {
    pub prefix: String,
    pub renew_interval: Duration,
    pub ttl: Duration,
    pub log_hook: Option<LogHook>,
}

impl std::fmt::Debug for EtcdRegistryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdRegistryOptions")
            .field("prefix", &self.prefix)
            .field("renew_interval", &self.renew_interval)
            .field("ttl", &self.ttl)
            .field("log_hook", &self.log_hook.is_some())
            .finish()
    }
}

impl Default for EtcdRegistryOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            renew_interval: DEFAULT_RENEW_INTERVAL,
            ttl: DEFAULT_RENEW_INTERVAL * 3,
            log_hook: None,
        }
    }
}

/// Logs a background (non-fatal) diagnostic through both `tracing` and the
/// caller-supplied [`LogHook`], matching `spec.md` §7's disposition for
/// watch errors, decode errors, and keep-alive retries.
fn log_background(hook: &Option<LogHook>, msg: &str, detail: &dyn std::fmt::Debug) {
    if let Some(hook) = hook {
        hook(msg, detail);
    }
}

/// Grants/renews a lease and keeps its keep-alive stream alive across ticks.
/// Abstracted behind a trait so the renewal retry/re-grant state machine in
/// [`renewal_tick`] can be driven by a fake in tests, without a live etcd —
/// the same pluggable-seam idiom as [`crate::pool::Dialer`] and
/// [`crate::registry::fake::FakeRegistryDriver`].
#[async_trait]
trait LeaseBackend: Send + Sync {
    /// Grants a fresh lease with the given TTL, puts `key` under it, and
    /// arms the keep-alive stream for the returned lease id.
    async fn grant_and_put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<i64, RegistryError>;

    /// Sends one keep-alive on the lease currently armed by the last
    /// `grant_and_put`. `Err(RegistryError::LeaseNotFound)` means the lease
    /// is gone and a fresh `grant_and_put` is required.
    async fn keep_alive(&self, lease_id: i64) -> Result<(), RegistryError>;
}

struct EtcdLeaseBackend {
    client: Client,
    stream: Mutex<Option<(LeaseKeeper, LeaseKeepAliveStream)>>,
}

impl EtcdLeaseBackend {
    fn new(client: Client) -> Self {
        Self { client, stream: Mutex::new(None) }
    }
}

#[async_trait]
impl LeaseBackend for EtcdLeaseBackend {
    async fn grant_and_put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<i64, RegistryError> {
        let mut client = self.client.clone();
        let grant = client
            .lease_grant(ttl.as_secs() as i64, None)
            .await
            .map_err(RegistryError::Transport)?;
        client
            .put(key.to_string(), value.to_vec(), Some(PutOptions::new().with_lease(grant.id())))
            .await
            .map_err(RegistryError::Transport)?;
        let (keeper, stream) = client.lease_keep_alive(grant.id()).await.map_err(RegistryError::Transport)?;
        *self.stream.lock().await = Some((keeper, stream));
        Ok(grant.id())
    }

    async fn keep_alive(&self, _lease_id: i64) -> Result<(), RegistryError> {
        let mut guard = self.stream.lock().await;
        // No armed stream means no lease has been granted yet for this
        // backend; treat it the same as a missing lease so the caller
        // re-grants rather than panicking (`spec.md` §7: keep-alive errors
        // "never panic").
        let Some((keeper, stream)) = guard.as_mut() else {
            return Err(RegistryError::LeaseNotFound);
        };
        keeper.keep_alive().await.map_err(RegistryError::Transport)?;
        match stream.message().await.map_err(RegistryError::Transport)? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(RegistryError::LeaseNotFound),
        }
    }
}

/// One renewal-ticker tick (`spec.md` §4.5 step 3): keep-alive the current
/// lease; on `LeaseNotFound`, re-grant and re-put; on any other error, retry
/// with exponential backoff up to [`KEEPALIVE_MAX_ATTEMPTS`] before giving up
/// this tick. Returns the lease id to use on the next tick.
async fn renewal_tick(
    backend: &dyn LeaseBackend,
    current_lease: i64,
    key: &str,
    metadata: &[u8],
    ttl: Duration,
    node: &Node,
    log_hook: &Option<LogHook>,
) -> i64 {
    match backend.keep_alive(current_lease).await {
        Ok(()) => current_lease,
        Err(RegistryError::LeaseNotFound) => match backend.grant_and_put(key, metadata, ttl).await {
            Ok(new_lease) => new_lease,
            Err(err) => {
                tracing::error!(error = %err, node = ?node, "re-grant after lease expiry failed");
                log_background(log_hook, "re-grant after lease expiry failed", &err);
                current_lease
            }
        },
        Err(err) => {
            let mut backoff = KEEPALIVE_INITIAL_BACKOFF;
            let mut last_err = err;
            for attempt in 0..KEEPALIVE_MAX_ATTEMPTS {
                tracing::warn!(error = %last_err, attempt, node = ?node, "keep-alive failed, retrying");
                log_background(log_hook, "keep-alive failed, retrying", &last_err);
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                match backend.keep_alive(current_lease).await {
                    Ok(()) => return current_lease,
                    Err(RegistryError::LeaseNotFound) => {
                        return match backend.grant_and_put(key, metadata, ttl).await {
                            Ok(new_lease) => new_lease,
                            Err(err) => {
                                tracing::error!(error = %err, node = ?node, "re-grant after lease expiry failed");
                                log_background(log_hook, "re-grant after lease expiry failed", &err);
                                current_lease
                            }
                        };
                    }
                    Err(err) => last_err = err,
                }
            }
            current_lease
        }
    }
}

pub struct EtcdRegistry {
    client: Client,
    options: EtcdRegistryOptions,
}

impl EtcdRegistry {
    pub async fn connect(
        endpoints: Vec<String>,
        options: EtcdRegistryOptions,
    ) -> Result<Self, RegistryError> {
        let client = Client::connect(endpoints, None).await.map_err(RegistryError::Transport)?;
        Ok(Self { client, options })
    }

    fn key(&self, node: &Node) -> String {
        format!("{}/{}/{}", self.options.prefix, node.service_name, node.addr)
    }

    fn decode_ctx(&self) -> DecodeCtx {
        DecodeCtx { prefix: self.options.prefix.clone() }
    }
}

#[async_trait]
impl RegistryDriver for EtcdRegistry {
    async fn watch_and_get(&self) -> Result<(EventStream, ServiceSnapshot), RegistryError> {
        let mut watch_client = self.client.clone();
        let (watcher, mut watch_stream) = watch_client
            .watch(self.options.prefix.clone(), Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(RegistryError::Transport)?;

        let (tx, rx) = mpsc::channel(64);
        let decode = self.decode_ctx();
        let log_hook = self.options.log_hook.clone();
        tokio::spawn(async move {
            // The watcher must stay alive for as long as we read from the
            // stream; dropping it would cancel the watch.
            let _watcher = watcher;
            loop {
                match watch_stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            break;
                        }
                        for ev in resp.events() {
                            let Some(kv) = ev.kv() else { continue };
                            let Some(node) = decode.decode(kv.key(), kv.value()) else {
                                tracing::warn!(key = ?kv.key(), "registry watch: malformed key, skipping");
                                log_background(&log_hook, "registry watch: malformed key, skipping", &kv.key());
                                continue;
                            };
                            let kind = match ev.event_type() {
                                EventType::Put => {
                                    if kv.create_revision() == kv.mod_revision() {
                                        EventKind::Create
                                    } else {
                                        EventKind::Update
                                    }
                                }
                                EventType::Delete => EventKind::Delete,
                            };
                            if tx.send(Event::new(kind, node)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "registry watch error, continuing");
                        log_background(&log_hook, "registry watch error, continuing", &err);
                    }
                }
            }
        });

        let mut get_client = self.client.clone();
        let resp = tokio::time::timeout(
            CALL_DEADLINE,
            get_client.get(self.options.prefix.clone(), Some(GetOptions::new().with_prefix())),
        )
        .await
        .map_err(|_| RegistryError::Timeout { what: "bootstrap get" })?
        .map_err(RegistryError::Transport)?;

        let ctx = self.decode_ctx();
        let mut snapshot = ServiceSnapshot::new();
        for kv in resp.kvs() {
            let node = ctx
                .decode(kv.key(), kv.value())
                .ok_or_else(|| RegistryError::Decode { key: String::from_utf8_lossy(kv.key()).into_owned() })?;
            snapshot.insert(node);
        }

        Ok((ReceiverStream::new(rx), snapshot))
    }

    async fn register(&self, node: Node) -> Result<Deregister, RegistryError> {
        let backend: Arc<dyn LeaseBackend> = Arc::new(EtcdLeaseBackend::new(self.client.clone()));
        let key = self.key(&node);
        let ttl = self.options.ttl;
        let lease_id = backend.grant_and_put(&key, &node.metadata, ttl).await?;

        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
        let interval = self.options.renew_interval;
        let node_for_task = node.clone();
        let key_for_task = key.clone();
        let log_hook = self.options.log_hook.clone();
        let backend_for_task = backend.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut current_lease = lease_id;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = ticker.tick() => {}
                }
                current_lease = renewal_tick(
                    backend_for_task.as_ref(),
                    current_lease,
                    &key_for_task,
                    &node_for_task.metadata,
                    ttl,
                    &node_for_task,
                    &log_hook,
                )
                .await;
            }
        });

        let deregister_client = self.client.clone();
        let deregister_key = key;
        Ok(Deregister::new(move || {
            let _ = stop_tx.send(());
            let mut client = deregister_client;
            let key = deregister_key;
            tokio::spawn(async move {
                let _ = tokio::time::timeout(CALL_DEADLINE, client.delete(key, None)).await;
            });
        }))
    }
}

struct DecodeCtx {
    prefix: String,
}

impl DecodeCtx {
    fn decode(&self, key: &[u8], value: &[u8]) -> Option<Node> {
        let key = std::str::from_utf8(key).ok()?;
        let rest = key.strip_prefix(&self.prefix)?;
        let parts: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() != 2 {
            return None;
        }
        Some(Node::new(parts[0], parts[1], value.to_vec()))
    }
}
