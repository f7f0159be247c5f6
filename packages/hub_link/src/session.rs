//! One logical hub session: a physical transport plus its own reconnect loop.
//!
//! The session owns a driver task (reader/writer select loop) while a
//! transport is up. On a transient drop the driver walks the [`RetryPolicy`]
//! on its own and reports progress through the lifecycle callbacks; the owner
//! only mirrors those into its state. Capability flags live with each
//! physical link, so every reconnect starts from a clean, optimistic map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryPolicy;
use crate::capability::{CapabilityFlags, is_missing_method};
use crate::error::TransportError;
use crate::event::ServerError;
use crate::protocol::{Completion, HubFrame, Invocation};
use crate::transport::{ConnectRequest, Connector, HubTransport, TransportKind};

const OUTBOUND_CAPACITY: usize = 100;

/// Supplies the bearer credential at every (re)connect.
pub type CredentialFn = Arc<dyn Fn() -> Option<String> + Send + Sync>;

type InboundHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Completion>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: String,
    /// Preferred transports, tried in order on every (re)connect.
    pub transports: Vec<TransportKind>,
    pub retry: RetryPolicy,
    pub invoke_timeout: Duration,
}

impl SessionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            transports: TransportKind::default_order(),
            retry: RetryPolicy::default(),
            invoke_timeout: Duration::from_secs(30),
        }
    }
}

/// Why an invoke resolved without reaching the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotConnected,
    Unsupported,
}

/// Result of a best-effort outbound call. Never an error to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOutcome {
    Completed(Value),
    Skipped(SkipReason),
    Failed(String),
}

impl InvokeOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, InvokeOutcome::Completed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, InvokeOutcome::Skipped(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectAttempt {
    pub attempt: u32,
    pub delay: Duration,
}

#[derive(Default)]
struct Handlers {
    inbound: HashMap<String, InboundHandler>,
    malformed: Option<Arc<dyn Fn(ServerError) + Send + Sync>>,
    reconnecting: Option<Arc<dyn Fn(ReconnectAttempt) + Send + Sync>>,
    reconnected: Option<Arc<dyn Fn() + Send + Sync>>,
    closed: Option<Arc<dyn Fn(Option<&TransportError>) + Send + Sync>>,
}

/// Outbound side of the live physical link.
#[derive(Clone)]
struct Link {
    kind: TransportKind,
    outbound: mpsc::Sender<String>,
    pending: PendingMap,
    capabilities: Arc<Mutex<CapabilityFlags>>,
}

/// Driver-side ends of a link.
struct LinkIo {
    outbound: mpsc::Receiver<String>,
    pending: PendingMap,
}

struct Shared {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    credentials: CredentialFn,
    handlers: RwLock<Handlers>,
    link: Mutex<Option<Link>>,
    next_invocation: AtomicU64,
    opened: AtomicBool,
    cancel: CancellationToken,
}

pub struct TransportSession {
    shared: Arc<Shared>,
}

impl TransportSession {
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>, credentials: CredentialFn) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                credentials,
                handlers: RwLock::new(Handlers::default()),
                link: Mutex::new(None),
                next_invocation: AtomicU64::new(1),
                opened: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn handlers(&self) -> std::sync::RwLockWriteGuard<'_, Handlers> {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle server invocations of `target` (case-insensitive).
    pub fn on<F>(&self, target: &str, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.handlers()
            .inbound
            .insert(target.to_ascii_lowercase(), Arc::new(handler));
    }

    /// Records that could not be decoded.
    pub fn on_malformed<F>(&self, handler: F)
    where
        F: Fn(ServerError) + Send + Sync + 'static,
    {
        self.handlers().malformed = Some(Arc::new(handler));
    }

    pub fn on_reconnecting<F>(&self, handler: F)
    where
        F: Fn(ReconnectAttempt) + Send + Sync + 'static,
    {
        self.handlers().reconnecting = Some(Arc::new(handler));
    }

    pub fn on_reconnected<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers().reconnected = Some(Arc::new(handler));
    }

    /// Terminal close: server refused reconnection or the retry policy ran out.
    /// Not fired for [`close`](Self::close).
    pub fn on_closed<F>(&self, handler: F)
    where
        F: Fn(Option<&TransportError>) + Send + Sync + 'static,
    {
        self.handlers().closed = Some(Arc::new(handler));
    }

    /// Connect using the first transport that works, then hand the link to a
    /// background driver. Can only be called once per session.
    pub async fn open(&self) -> Result<TransportKind, TransportError> {
        if self.shared.opened.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyOpened);
        }

        let transport = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return Err(TransportError::Cancelled),
            result = establish(&self.shared) => result?,
        };

        let kind = transport.kind();
        let io = self.shared.go_live(kind);
        info!(transport = %kind, endpoint = %self.shared.config.endpoint, "hub session open");
        tokio::spawn(drive(self.shared.clone(), transport, io));
        Ok(kind)
    }

    /// Stop the session. Returns immediately; the socket closes in the background.
    pub fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.go_dead();
    }

    pub fn is_live(&self) -> bool {
        lock(&self.shared.link).is_some()
    }

    pub fn transport(&self) -> Option<TransportKind> {
        lock(&self.shared.link).as_ref().map(|l| l.kind)
    }

    /// Snapshot of the live link's capability flags.
    pub fn capabilities(&self) -> Option<CapabilityFlags> {
        lock(&self.shared.link)
            .as_ref()
            .map(|l| lock(&l.capabilities).clone())
    }

    /// Call a hub method and wait for its completion.
    ///
    /// Methods already known to be missing, and calls made without a live
    /// link, resolve as [`InvokeOutcome::Skipped`] without touching the network.
    pub async fn invoke(&self, method: &str, arguments: Vec<Value>) -> InvokeOutcome {
        let Some(link) = lock(&self.shared.link).clone() else {
            debug!(method, "invoke skipped: not connected");
            return InvokeOutcome::Skipped(SkipReason::NotConnected);
        };
        if !lock(&link.capabilities).is_supported(method) {
            debug!(method, "invoke skipped: unsupported by server");
            return InvokeOutcome::Skipped(SkipReason::Unsupported);
        }

        let id = self
            .shared
            .next_invocation
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let (tx, rx) = oneshot::channel();
        lock(&link.pending).insert(id.clone(), tx);

        let record = HubFrame::invocation(Some(id.clone()), method, arguments).encode();
        if link.outbound.send(record).await.is_err() {
            lock(&link.pending).remove(&id);
            return InvokeOutcome::Skipped(SkipReason::NotConnected);
        }

        let completion = match tokio::time::timeout(self.shared.config.invoke_timeout, rx).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => return InvokeOutcome::Failed("connection lost before completion".into()),
            Err(_) => {
                lock(&link.pending).remove(&id);
                return InvokeOutcome::Failed(format!(
                    "no completion within {:?}",
                    self.shared.config.invoke_timeout
                ));
            }
        };

        if is_missing_method(&completion) {
            info!(method, "server does not implement method; disabling for this connection");
            lock(&link.capabilities).mark_unsupported(method);
            return InvokeOutcome::Skipped(SkipReason::Unsupported);
        }
        match completion.error {
            Some(error) => InvokeOutcome::Failed(error),
            None => InvokeOutcome::Completed(completion.result.unwrap_or(Value::Null)),
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    fn go_live(&self, kind: TransportKind) -> LinkIo {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        *lock(&self.link) = Some(Link {
            kind,
            outbound: tx,
            pending: pending.clone(),
            capabilities: Arc::new(Mutex::new(CapabilityFlags::new())),
        });
        LinkIo {
            outbound: rx,
            pending,
        }
    }

    fn go_dead(&self) {
        lock(&self.link).take();
    }

    fn read_handlers(&self) -> std::sync::RwLockReadGuard<'_, Handlers> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch_invocation(&self, invocation: &Invocation) {
        let handler = self
            .read_handlers()
            .inbound
            .get(&invocation.target.to_ascii_lowercase())
            .cloned();
        match handler {
            Some(handler) => handler(&invocation.arguments),
            None => debug!(target = %invocation.target, "no handler for server invocation"),
        }
    }

    fn fire_malformed(&self, err: ServerError) {
        let handler = self.read_handlers().malformed.clone();
        if let Some(handler) = handler {
            handler(err);
        }
    }

    fn fire_reconnecting(&self, attempt: ReconnectAttempt) {
        let handler = self.read_handlers().reconnecting.clone();
        if let Some(handler) = handler {
            handler(attempt);
        }
    }

    fn fire_reconnected(&self) {
        let handler = self.read_handlers().reconnected.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn fire_closed(&self, err: Option<&TransportError>) {
        let handler = self.read_handlers().closed.clone();
        if let Some(handler) = handler {
            handler(err);
        }
    }
}

/// Try each configured transport in order with a freshly read credential.
async fn establish(shared: &Shared) -> Result<Box<dyn HubTransport>, TransportError> {
    let mut last = TransportError::NoTransport;
    for &kind in &shared.config.transports {
        let request = ConnectRequest {
            endpoint: shared.config.endpoint.clone(),
            kind,
            access_token: (shared.credentials)(),
        };
        match shared.connector.connect(request).await {
            Ok(transport) => return Ok(transport),
            Err(e) => {
                warn!(transport = %kind, error = %e, "transport unavailable, trying next");
                last = e;
            }
        }
    }
    Err(last)
}

enum Ended {
    Cancelled,
    /// Server closed and does not want us back.
    Closed(Option<String>),
    Dropped(TransportError),
}

async fn drive(shared: Arc<Shared>, mut transport: Box<dyn HubTransport>, mut io: LinkIo) {
    loop {
        let ended = pump(&shared, transport.as_mut(), &mut io).await;
        shared.go_dead();
        // In-flight invokes hold a `Link` clone that keeps the map alive;
        // dropping the senders fails them now instead of at their timeout.
        let pending = io.pending.clone();
        drop(io);
        lock(&pending).clear();
        transport.close().await;

        let reason = match ended {
            Ended::Cancelled => {
                debug!("hub session closed locally");
                return;
            }
            Ended::Closed(message) => {
                let err = TransportError::ServerClosed(
                    message.unwrap_or_else(|| "closed by server".to_string()),
                );
                info!(error = %err, "hub session closed by server");
                shared.fire_closed(Some(&err));
                return;
            }
            Ended::Dropped(err) => err,
        };

        warn!(error = %reason, "hub transport dropped, reconnecting");
        match reconnect(&shared, reason).await {
            Some((next, next_io)) => {
                transport = next;
                io = next_io;
                shared.fire_reconnected();
            }
            None => return,
        }
    }
}

async fn pump(shared: &Shared, transport: &mut dyn HubTransport, io: &mut LinkIo) -> Ended {
    enum Step {
        Cancelled,
        Outbound(Option<String>),
        Inbound(Result<Option<String>, TransportError>),
    }

    loop {
        let step = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Step::Cancelled,
            out = io.outbound.recv() => Step::Outbound(out),
            inbound = transport.recv() => Step::Inbound(inbound),
        };

        match step {
            Step::Cancelled | Step::Outbound(None) => return Ended::Cancelled,
            Step::Outbound(Some(record)) => {
                if let Err(e) = transport.send(record).await {
                    return Ended::Dropped(e);
                }
            }
            Step::Inbound(Ok(Some(record))) => {
                if let Some(ended) = handle_record(shared, io, &record) {
                    return ended;
                }
            }
            Step::Inbound(Ok(None)) => {
                return Ended::Dropped(TransportError::lost("transport closed"));
            }
            Step::Inbound(Err(e)) => return Ended::Dropped(e),
        }
    }
}

fn handle_record(shared: &Shared, io: &LinkIo, record: &str) -> Option<Ended> {
    match HubFrame::decode(record) {
        Ok(HubFrame::Invocation(invocation)) => shared.dispatch_invocation(&invocation),
        Ok(HubFrame::Completion(completion)) => {
            let waiter = lock(&io.pending).remove(&completion.invocation_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(completion);
                }
                None => debug!(id = %completion.invocation_id, "completion for unknown invocation"),
            }
        }
        Ok(HubFrame::Ping) => {}
        Ok(HubFrame::Close(close)) if close.allow_reconnect => {
            return Some(Ended::Dropped(TransportError::ServerClosed(
                close
                    .error
                    .unwrap_or_else(|| "server asked client to reconnect".to_string()),
            )));
        }
        Ok(HubFrame::Close(close)) => return Some(Ended::Closed(close.error)),
        Ok(HubFrame::Other { kind }) => debug!(kind, "ignoring unsupported frame type"),
        Err(e) => {
            warn!(error = %e, "malformed hub frame");
            shared.fire_malformed(ServerError::malformed("frame", &e));
        }
    }
    None
}

async fn reconnect(
    shared: &Shared,
    reason: TransportError,
) -> Option<(Box<dyn HubTransport>, LinkIo)> {
    let mut attempt = 0u32;
    let mut last = reason;
    loop {
        let Some(delay) = shared.config.retry.next_delay(attempt) else {
            error!(attempts = attempt, error = %last, "reconnect attempts exhausted");
            shared.fire_closed(Some(&last));
            return None;
        };

        shared.fire_reconnecting(ReconnectAttempt { attempt, delay });
        debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");

        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return None,
            result = async {
                tokio::time::sleep(delay).await;
                establish(shared).await
            } => result,
        };

        match result {
            Ok(transport) => {
                let kind = transport.kind();
                let io = shared.go_live(kind);
                info!(attempt, transport = %kind, "hub session reconnected");
                return Some((transport, io));
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
                last = e;
                attempt += 1;
            }
        }
    }
}
