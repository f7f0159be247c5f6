//! In-memory notification feed fed by hub pushes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::event::{Channel, InboundEvent, MessageEnvelope, id_from_any};
use crate::manager::ConnectionManager;
use crate::registry::{SubscriberRegistry, Subscription};
use crate::session::InvokeOutcome;

pub const DEFAULT_CAPACITY: usize = 100;
pub const MARK_AS_READ: &str = "MarkAsRead";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "body", alias = "content")]
    pub message: Option<String>,
    #[serde(default, alias = "type")]
    pub kind: Option<String>,
    #[serde(default, alias = "read")]
    pub is_read: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn from_envelope(env: &MessageEnvelope) -> Result<Self, serde_json::Error> {
        serde_json::from_value(env.raw.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub title: String,
    pub body: String,
}

impl From<&Notification> for Toast {
    fn from(n: &Notification) -> Self {
        Self {
            title: n
                .title
                .clone()
                .unwrap_or_else(|| "New notification".to_string()),
            body: n.message.clone().unwrap_or_default(),
        }
    }
}

/// Transient user-facing popup surface.
pub trait ToastSink: Send + Sync {
    fn show(&self, toast: &Toast);
}

/// Toasts as log lines, for headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogToast;

impl ToastSink for LogToast {
    fn show(&self, toast: &Toast) {
        info!(title = %toast.title, body = %toast.body, "notification");
    }
}

struct FeedState {
    items: VecDeque<Notification>,
    capacity: usize,
}

impl FeedState {
    fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|n| n.id == id)
    }

    /// Newest first; the oldest entries fall off past capacity.
    fn push_front(&mut self, n: Notification) -> bool {
        if self.contains(&n.id) {
            return false;
        }
        self.items.push_front(n);
        self.items.truncate(self.capacity);
        true
    }
}

/// Live notification list with unread tracking and toasts.
pub struct NotificationFeed {
    manager: Arc<ConnectionManager>,
    state: Arc<Mutex<FeedState>>,
    listeners: SubscriberRegistry<(), Notification>,
    subscriptions: Vec<Subscription>,
}

impl NotificationFeed {
    pub fn new(manager: Arc<ConnectionManager>, toasts: Arc<dyn ToastSink>) -> Self {
        Self::with_capacity(manager, toasts, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(
        manager: Arc<ConnectionManager>,
        toasts: Arc<dyn ToastSink>,
        capacity: usize,
    ) -> Self {
        let state = Arc::new(Mutex::new(FeedState {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }));
        let listeners: SubscriberRegistry<(), Notification> = SubscriberRegistry::new();

        let feed_state = state.clone();
        let feed_listeners = listeners.clone();
        let on_message = manager.subscribe(Channel::Message, move |event| {
            let InboundEvent::Message(env) = event else {
                return;
            };
            let notification = match Notification::from_envelope(env) {
                Ok(n) => n,
                Err(e) => {
                    warn!(id = %env.id, error = %e, "unreadable notification");
                    return;
                }
            };
            if !lock(&feed_state).push_front(notification.clone()) {
                debug!(id = %notification.id, "notification already present");
                return;
            }
            toasts.show(&Toast::from(&notification));
            feed_listeners.dispatch(&(), &notification);
        });

        let on_error = manager.subscribe(Channel::Error, |event| {
            if let InboundEvent::ServerError(err) = event {
                warn!(message = %err.message, code = ?err.code, "notification server error");
            }
        });

        Self {
            manager,
            state,
            listeners,
            subscriptions: vec![on_message, on_error],
        }
    }

    /// Seed from history, newest first. No toasts; ids already held are skipped.
    pub fn hydrate(&self, history: impl IntoIterator<Item = Notification>) {
        let mut state = lock(&self.state);
        for n in history {
            if state.items.len() >= state.capacity {
                break;
            }
            if !state.contains(&n.id) {
                state.items.push_back(n);
            }
        }
    }

    pub fn items(&self) -> Vec<Notification> {
        lock(&self.state).items.iter().cloned().collect()
    }

    pub fn unread_count(&self) -> usize {
        lock(&self.state).items.iter().filter(|n| !n.is_read).count()
    }

    pub fn on_notification<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.listeners.add((), listener)
    }

    /// Mark locally, then tell the server. The server call is best-effort.
    pub async fn mark_as_read(&self, id: &str) -> InvokeOutcome {
        if let Some(n) = lock(&self.state).items.iter_mut().find(|n| n.id == id) {
            n.is_read = true;
        }
        let arg = id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(id));
        self.manager.invoke(MARK_AS_READ, vec![arg]).await
    }
}

impl Drop for NotificationFeed {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.listeners.clear();
    }
}
