//! Full-duplex transport over a WebSocket.

use std::collections::VecDeque;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{HubTransport, TransportKind, with_connection_id};
use crate::error::TransportError;
use crate::protocol::{handshake_request, parse_handshake_response, split_records};

const KIND: TransportKind = TransportKind::WebSockets;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketTransport {
    stream: WsStream,
    pending: VecDeque<String>,
}

/// `http(s)://…` → `ws(s)://…` with the connection id in the query.
pub fn ws_url(endpoint: &str, connection_token: Option<&str>) -> Result<String, TransportError> {
    let mut url = with_connection_id(endpoint, connection_token)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::connect(KIND, format!("cannot use {scheme} for {endpoint}")))?;
    Ok(url.into())
}

impl WebSocketTransport {
    pub async fn connect(
        endpoint: &str,
        connection_token: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<Self, TransportError> {
        let url = ws_url(endpoint, connection_token)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::connect(KIND, e))?;
        if let Some(token) = access_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::connect(KIND, e))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(response) => TransportError::connect(
                    KIND,
                    format!("HTTP {}", response.status().as_u16()),
                ),
                other => TransportError::connect(KIND, other),
            })?;

        let mut transport = Self {
            stream,
            pending: VecDeque::new(),
        };
        transport.handshake().await?;
        debug!(url = %url, "websocket transport open");
        Ok(transport)
    }

    async fn handshake(&mut self) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(handshake_request().into()))
            .await
            .map_err(|e| TransportError::connect(KIND, e))?;

        match self.next_record().await? {
            Some(reply) => Ok(parse_handshake_response(&reply)?),
            None => Err(TransportError::lost("closed during handshake")),
        }
    }

    async fn next_record(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(Some(record));
            }
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.pending
                        .extend(split_records(text.as_str()).map(String::from));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "websocket closed by peer");
                    return Ok(None);
                }
                Some(Ok(Message::Binary(_))) => debug!("ignoring binary websocket message"),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::lost(e)),
                None => return Ok(None),
            }
        }
    }
}

impl HubTransport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        KIND
    }

    fn send(&mut self, record: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.stream
                .send(Message::Text(record.into()))
                .await
                .map_err(TransportError::lost)
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Option<String>, TransportError>> {
        Box::pin(self.next_record())
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.stream.close(None).await {
                debug!(error = %e, "websocket close");
            }
        })
    }
}
