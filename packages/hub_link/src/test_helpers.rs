use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::TransportError;
use crate::protocol::{CloseFrame, Completion, HubFrame, RECORD_SEPARATOR, split_records};
use crate::transport::{ConnectRequest, Connector, HubTransport, TransportKind};

type Inbound = mpsc::UnboundedSender<Result<String, TransportError>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap()
}

fn record(frame: HubFrame) -> String {
    frame.encode().trim_end_matches(RECORD_SEPARATOR).to_string()
}

struct LinkSide {
    to_client: Inbound,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct HubState {
    unreachable: bool,
    failing: HashSet<TransportKind>,
    missing: HashSet<String>,
    rejected: HashMap<String, String>,
    hold_completions: bool,
    connects: Vec<ConnectRequest>,
    invocations: Vec<(String, Vec<Value>)>,
    links: Vec<LinkSide>,
}

/// Scripted in-process hub. Completes every invocation unless told otherwise.
pub struct MockHub {
    state: Arc<Mutex<HubState>>,
    gate: watch::Sender<bool>,
}

impl MockHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(HubState::default())),
            gate: watch::channel(false).0,
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).unreachable = !reachable;
    }

    pub fn fail_transport(&self, kind: TransportKind) {
        lock(&self.state).failing.insert(kind);
    }

    /// Park every connect attempt until [`release_connects`](Self::release_connects).
    pub fn hold_connects(&self) {
        self.gate.send_replace(true);
    }

    pub fn release_connects(&self) {
        self.gate.send_replace(false);
    }

    pub fn missing_method(&self, method: &str) {
        lock(&self.state).missing.insert(method.to_string());
    }

    pub fn reject_method(&self, method: &str, error: &str) {
        lock(&self.state)
            .rejected
            .insert(method.to_string(), error.to_string());
    }

    /// Record invocations but never answer them.
    pub fn hold_completions(&self) {
        lock(&self.state).hold_completions = true;
    }

    fn live_link(&self) -> Option<(Inbound, Arc<AtomicBool>)> {
        lock(&self.state)
            .links
            .iter()
            .rev()
            .find(|l| l.alive.load(Ordering::SeqCst))
            .map(|l| (l.to_client.clone(), l.alive.clone()))
    }

    pub fn push_raw(&self, raw: &str) {
        if let Some((tx, _)) = self.live_link() {
            let _ = tx.send(Ok(raw.to_string()));
        }
    }

    /// Server-side invocation of a client handler.
    pub fn push(&self, target: &str, arguments: Vec<Value>) {
        self.push_raw(&record(HubFrame::invocation(None, target, arguments)));
    }

    /// Sever the newest live link as a network failure would.
    pub fn drop_connection(&self) {
        if let Some((tx, alive)) = self.live_link() {
            alive.store(false, Ordering::SeqCst);
            let _ = tx.send(Err(TransportError::lost("dropped by mock hub")));
        }
    }

    pub fn close_from_server(&self, allow_reconnect: bool) {
        self.push_raw(&record(HubFrame::Close(CloseFrame {
            error: Some("server shutting down".to_string()),
            allow_reconnect,
        })));
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects.len()
    }

    pub fn connect_kinds(&self) -> Vec<TransportKind> {
        lock(&self.state).connects.iter().map(|c| c.kind).collect()
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        lock(&self.state)
            .connects
            .iter()
            .map(|c| c.access_token.clone())
            .collect()
    }

    pub fn invocations(&self, method: &str) -> Vec<Vec<Value>> {
        lock(&self.state)
            .invocations
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn invocation_count(&self, method: &str) -> usize {
        self.invocations(method).len()
    }

    pub fn open_links(&self) -> usize {
        lock(&self.state)
            .links
            .iter()
            .filter(|l| l.alive.load(Ordering::SeqCst))
            .count()
    }
}

impl Connector for MockHub {
    fn connect(
        &self,
        request: ConnectRequest,
    ) -> BoxFuture<'_, Result<Box<dyn HubTransport>, TransportError>> {
        Box::pin(async move {
            let kind = request.kind;
            let mut gate = self.gate.subscribe();
            lock(&self.state).connects.push(request);
            let _ = gate.wait_for(|held| !*held).await;

            let mut state = lock(&self.state);
            if state.unreachable || state.failing.contains(&kind) {
                return Err(TransportError::connect(kind, "refused by mock hub"));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let alive = Arc::new(AtomicBool::new(true));
            state.links.push(LinkSide {
                to_client: tx.clone(),
                alive: alive.clone(),
            });
            Ok(Box::new(MockTransport {
                kind,
                state: self.state.clone(),
                loopback: tx,
                inbound: rx,
                alive,
            }) as Box<dyn HubTransport>)
        })
    }
}

struct MockTransport {
    kind: TransportKind,
    state: Arc<Mutex<HubState>>,
    loopback: Inbound,
    inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    alive: Arc<AtomicBool>,
}

impl MockTransport {
    fn answer(&self, raw: &str) {
        let Ok(HubFrame::Invocation(inv)) = HubFrame::decode(raw) else {
            return;
        };
        let completion = {
            let mut state = lock(&self.state);
            state
                .invocations
                .push((inv.target.clone(), inv.arguments.clone()));
            let Some(id) = inv.invocation_id else {
                return;
            };
            if state.hold_completions {
                return;
            }
            let error = if state.missing.contains(&inv.target) {
                Some(format!(
                    "Failed to invoke '{}' due to an error on the server. HubException: Method does not exist.",
                    inv.target
                ))
            } else {
                state.rejected.get(&inv.target).cloned()
            };
            Completion {
                invocation_id: id,
                result: None,
                error,
                error_code: None,
            }
        };
        let _ = self
            .loopback
            .send(Ok(record(HubFrame::Completion(completion))));
    }
}

impl HubTransport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn send(&mut self, records: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if !self.alive.load(Ordering::SeqCst) {
                return Err(TransportError::lost("mock link closed"));
            }
            for raw in split_records(&records) {
                self.answer(raw);
            }
            Ok(())
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Option<String>, TransportError>> {
        Box::pin(async move {
            match self.inbound.recv().await {
                Some(Ok(raw)) => Ok(Some(raw)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        self.alive.store(false, Ordering::SeqCst);
        Box::pin(async {})
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Poll `cond` on the (usually paused) tokio clock until it holds.
pub async fn eventually<F: Fn() -> bool>(cond: F) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met within the polling window");
}
