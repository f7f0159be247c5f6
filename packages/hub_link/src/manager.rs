//! Authentication-driven owner of one hub session.
//!
//! The manager is the public face of the crate: UI code flips
//! [`set_authenticated`](ConnectionManager::set_authenticated), watches
//! [`ConnectionState`], subscribes to [`Channel`]s and invokes hub methods.
//! Every session it creates carries a generation number; callbacks from a
//! session that has since been superseded are dropped on the floor.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::RetryPolicy;
use crate::error::TransportError;
use crate::event::{Channel, HubTargets, InboundEvent};
use crate::registry::{SubscriberRegistry, Subscription};
use crate::session::{InvokeOutcome, SessionConfig, SkipReason, TransportSession};
use crate::transport::{Connector, TransportKind};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Bearer credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Everything one manager needs to reach its hub.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub endpoint: String,
    pub transports: Vec<TransportKind>,
    pub retry: RetryPolicy,
    pub invoke_timeout: Duration,
    pub targets: HubTargets,
    /// Method invoked once after each successful open; its outcome is ignored.
    pub liveness_probe: Option<String>,
}

impl ManagerConfig {
    pub fn new(endpoint: impl Into<String>, targets: HubTargets) -> Self {
        Self {
            endpoint: endpoint.into(),
            transports: TransportKind::default_order(),
            retry: RetryPolicy::default(),
            invoke_timeout: Duration::from_secs(30),
            targets,
            liveness_probe: Some("Ping".to_string()),
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            endpoint: self.endpoint.clone(),
            transports: self.transports.clone(),
            retry: self.retry.clone(),
            invoke_timeout: self.invoke_timeout,
        }
    }
}

struct Inner {
    state: ConnectionState,
    generation: u64,
    connecting: bool,
    session: Option<Arc<TransportSession>>,
}

struct Core {
    inner: Mutex<Inner>,
    events: SubscriberRegistry<Channel, InboundEvent>,
    state_listeners: SubscriberRegistry<(), ConnectionState>,
}

impl Core {
    fn is_current(&self, generation: u64) -> bool {
        lock(&self.inner).generation == generation
    }

    /// Apply `update` and move to `to`, unless `generation` is stale.
    /// Listeners hear about actual changes only.
    fn transition(
        &self,
        generation: Option<u64>,
        to: ConnectionState,
        update: impl FnOnce(&mut Inner),
    ) -> bool {
        let from = {
            let mut inner = lock(&self.inner);
            if generation.is_some_and(|g| g != inner.generation) {
                return false;
            }
            update(&mut inner);
            std::mem::replace(&mut inner.state, to)
        };
        if from != to {
            debug!(%from, %to, "connection state");
            self.state_listeners.dispatch(&(), &to);
        }
        true
    }

    fn deliver(&self, generation: u64, event: InboundEvent) {
        if self.is_current(generation) {
            self.events.dispatch(&event.channel(), &event);
        } else {
            debug!(generation, "dropping event from superseded session");
        }
    }
}

pub struct ConnectionManager {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    credential: Arc<RwLock<Option<Credential>>>,
    core: Arc<Core>,
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            credential: Arc::new(RwLock::new(None)),
            core: Arc::new(Core {
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    connecting: false,
                    session: None,
                }),
                events: SubscriberRegistry::new(),
                state_listeners: SubscriberRegistry::new(),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn get_state(&self) -> ConnectionState {
        lock(&self.core.inner).state
    }

    /// Notified on every actual state change. No initial replay.
    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.core.state_listeners.add((), listener)
    }

    /// Listen on `channel`. Valid in any state; survives reconnects and re-logins.
    pub fn subscribe<F>(&self, channel: Channel, listener: F) -> Subscription
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.core.events.add(channel, listener)
    }

    pub fn listener_count(&self, channel: Channel) -> usize {
        self.core.events.listener_count(&channel)
    }

    /// Drive the connection from authentication state.
    ///
    /// `Some` connects if nothing is connecting or connected; a newer
    /// credential while connected is only stored for the next reconnect.
    /// `None` tears the session down synchronously.
    pub fn set_authenticated(&self, credential: Option<Credential>) {
        let Some(credential) = credential else {
            self.teardown();
            return;
        };

        *self
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(credential);

        let (generation, session) = {
            let mut inner = lock(&self.core.inner);
            if inner.connecting || inner.session.is_some() {
                debug!("already connecting or connected, credential updated");
                return;
            }
            inner.generation += 1;
            inner.connecting = true;
            let session = Arc::new(self.build_session(inner.generation));
            inner.session = Some(session.clone());
            (inner.generation, session)
        };

        if !self
            .core
            .transition(Some(generation), ConnectionState::Connecting, |_| {})
        {
            return;
        }
        info!(generation, endpoint = %self.config.endpoint, "connecting to hub");

        tokio::spawn(run_connect(
            self.core.clone(),
            session,
            generation,
            self.config.liveness_probe.clone(),
        ));
    }

    fn build_session(&self, generation: u64) -> TransportSession {
        let store = self.credential.clone();
        let session = TransportSession::new(
            self.config.session_config(),
            self.connector.clone(),
            Arc::new(move || {
                store
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_ref()
                    .map(|c| c.expose().to_string())
            }),
        );

        for target in self.config.targets.targets() {
            let core = Arc::downgrade(&self.core);
            let targets = self.config.targets.clone();
            let name = target.to_string();
            session.on(target, move |arguments: &[Value]| {
                let Some(core) = core.upgrade() else { return };
                if let Some(event) = targets.decode(&name, arguments) {
                    core.deliver(generation, event);
                }
            });
        }

        let core = Arc::downgrade(&self.core);
        session.on_malformed(move |err| {
            if let Some(core) = core.upgrade() {
                core.deliver(generation, InboundEvent::ServerError(err));
            }
        });

        let core = Arc::downgrade(&self.core);
        session.on_reconnecting(move |attempt| {
            if let Some(core) = core.upgrade() {
                debug!(attempt = attempt.attempt, "hub reconnecting");
                core.transition(Some(generation), ConnectionState::Reconnecting, |_| {});
            }
        });

        let core = Arc::downgrade(&self.core);
        session.on_reconnected(move || {
            if let Some(core) = core.upgrade() {
                core.transition(Some(generation), ConnectionState::Connected, |_| {});
            }
        });

        let core = Arc::downgrade(&self.core);
        session.on_closed(move |err: Option<&TransportError>| {
            if let Some(core) = core.upgrade() {
                warn!(error = ?err.map(ToString::to_string), "hub session closed");
                core.transition(Some(generation), ConnectionState::Disconnected, |inner| {
                    inner.connecting = false;
                    inner.session = None;
                });
            }
        });

        session
    }

    fn teardown(&self) {
        *self
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;

        let mut session = None;
        self.core.transition(None, ConnectionState::Disconnected, |inner| {
            inner.generation += 1;
            inner.connecting = false;
            session = inner.session.take();
        });
        if let Some(session) = session {
            info!("hub session torn down");
            session.close();
        }
    }

    /// Best-effort call on the live session. Never fails loudly.
    pub async fn invoke(&self, method: &str, arguments: Vec<Value>) -> InvokeOutcome {
        let session = lock(&self.core.inner).session.clone();
        match session {
            Some(session) => session.invoke(method, arguments).await,
            None => InvokeOutcome::Skipped(SkipReason::NotConnected),
        }
    }

    /// Methods the live server has reported missing.
    pub fn unsupported_methods(&self) -> Vec<String> {
        let session = lock(&self.core.inner).session.clone();
        let mut names: Vec<String> = session
            .and_then(|s| s.capabilities())
            .map(|caps| caps.unsupported().map(String::from).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Keep the connection in step with an authentication source.
    ///
    /// Applies the current value immediately, then every change. When the
    /// sender goes away the manager is logged out.
    pub fn follow_auth(
        self: &Arc<Self>,
        mut auth: watch::Receiver<Option<Credential>>,
    ) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let credential = auth.borrow_and_update().clone();
                match manager.upgrade() {
                    Some(m) => m.set_authenticated(credential),
                    None => return,
                }
                if auth.changed().await.is_err() {
                    if let Some(m) = manager.upgrade() {
                        m.set_authenticated(None);
                    }
                    return;
                }
            }
        })
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn run_connect(
    core: Arc<Core>,
    session: Arc<TransportSession>,
    generation: u64,
    probe: Option<String>,
) {
    match session.open().await {
        Ok(kind) => {
            let current = core.transition(Some(generation), ConnectionState::Connected, |inner| {
                inner.connecting = false;
            });
            if !current {
                debug!(generation, "connect finished for superseded session");
                session.close();
                return;
            }
            info!(generation, transport = %kind, "hub connected");
            if let Some(method) = probe {
                let outcome = session.invoke(&method, Vec::new()).await;
                debug!(method, ?outcome, "liveness probe");
            }
        }
        Err(TransportError::Cancelled) => debug!(generation, "connect cancelled"),
        Err(e) => {
            warn!(generation, error = %e, "hub connect failed");
            core.transition(Some(generation), ConnectionState::Disconnected, |inner| {
                inner.connecting = false;
                inner.session = None;
            });
        }
    }
}
