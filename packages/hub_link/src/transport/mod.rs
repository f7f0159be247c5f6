//! Physical transports to the messaging hub.
//!
//! Submodules:
//! - `negotiate`: HTTP negotiate round trip (connection token, offered transports)
//! - `websocket`: full-duplex transport over tokio-tungstenite
//! - `sse`: server-push transport (event-stream GET + POST for outbound records)
//!
//! [`Connector`] and [`HubTransport`] are the seams the session talks to; tests
//! swap in a scripted hub behind them.

pub mod negotiate;
pub mod sse;
pub mod websocket;

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TransportError;

/// Transport flavours, in the order a client should normally prefer them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    WebSockets,
    ServerSentEvents,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSockets => "WebSockets",
            TransportKind::ServerSentEvents => "ServerSentEvents",
        }
    }

    pub fn default_order() -> Vec<TransportKind> {
        vec![TransportKind::WebSockets, TransportKind::ServerSentEvents]
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt to bring up a specific transport.
#[derive(Clone)]
pub struct ConnectRequest {
    pub endpoint: String,
    pub kind: TransportKind,
    pub access_token: Option<String>,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("endpoint", &self.endpoint)
            .field("kind", &self.kind)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// An open, handshaken connection carrying hub records.
pub trait HubTransport: Send {
    fn kind(&self) -> TransportKind;

    /// Send one encoded record (separator included).
    fn send(&mut self, record: String) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Next inbound record without its separator; `Ok(None)` once the peer has closed.
    ///
    /// Must be cancel-safe: dropping the future may not lose a record.
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<String>, TransportError>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens transports. Implementations perform negotiation and the hub handshake.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        request: ConnectRequest,
    ) -> BoxFuture<'_, Result<Box<dyn HubTransport>, TransportError>>;
}

/// Network connector: negotiate over HTTP, then WebSockets or server-sent events.
#[derive(Clone)]
pub struct HubConnector {
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl Default for HubConnector {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl HubConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn establish(
        &self,
        request: ConnectRequest,
    ) -> Result<Box<dyn HubTransport>, TransportError> {
        let negotiated = negotiate::negotiate(
            &self.http,
            &request.endpoint,
            request.access_token.as_deref(),
        )
        .await?;

        if !negotiated.offers(request.kind) {
            return Err(TransportError::Unavailable(request.kind));
        }
        debug!(
            transport = %request.kind,
            endpoint = %negotiated.endpoint,
            "negotiated"
        );

        let token = negotiated.access_token.as_deref();
        let id = negotiated.connection_token.as_deref();
        match request.kind {
            TransportKind::WebSockets => {
                let t = websocket::WebSocketTransport::connect(&negotiated.endpoint, id, token)
                    .await?;
                Ok(Box::new(t))
            }
            TransportKind::ServerSentEvents => {
                let t = sse::SseTransport::connect(self.http.clone(), &negotiated.endpoint, id, token)
                    .await?;
                Ok(Box::new(t))
            }
        }
    }
}

impl Connector for HubConnector {
    fn connect(
        &self,
        request: ConnectRequest,
    ) -> BoxFuture<'_, Result<Box<dyn HubTransport>, TransportError>> {
        Box::pin(async move {
            let kind = request.kind;
            match tokio::time::timeout(self.connect_timeout, self.establish(request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::connect(
                    kind,
                    format!("timed out after {:?}", self.connect_timeout),
                )),
            }
        })
    }
}

/// Append `id=<connection token>` to an endpoint URL.
pub(crate) fn with_connection_id(
    endpoint: &str,
    connection_token: Option<&str>,
) -> Result<reqwest::Url, TransportError> {
    let mut url =
        reqwest::Url::parse(endpoint).map_err(|e| TransportError::Negotiate(e.to_string()))?;
    if let Some(id) = connection_token {
        url.query_pairs_mut().append_pair("id", id);
    }
    Ok(url)
}
