//! Server-push transport: records arrive on a `text/event-stream` GET, outbound
//! records are POSTed to the same endpoint.

use std::collections::VecDeque;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::debug;

use super::{HubTransport, TransportKind, with_connection_id};
use crate::error::TransportError;
use crate::protocol::{handshake_request, parse_handshake_response, split_records};

const KIND: TransportKind = TransportKind::ServerSentEvents;

/// Incremental `text/event-stream` parser yielding the `data` of each event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = self.buf.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&raw[..end]);
            let data: Vec<&str> = text
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
                .collect();
            if !data.is_empty() {
                events.push(data.join("\n"));
            }
        }
        events
    }
}

pub struct SseTransport {
    http: reqwest::Client,
    url: reqwest::Url,
    access_token: Option<String>,
    events: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
}

impl SseTransport {
    pub async fn connect(
        http: reqwest::Client,
        endpoint: &str,
        connection_token: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<Self, TransportError> {
        let url = with_connection_id(endpoint, connection_token)?;

        let mut request = http.get(url.clone()).header(ACCEPT, "text/event-stream");
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TransportError::connect(KIND, e))?;

        let events = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();

        let mut transport = Self {
            http,
            url,
            access_token: access_token.map(String::from),
            events,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
        };

        transport.post(handshake_request()).await?;
        match transport.next_record().await? {
            Some(reply) => parse_handshake_response(&reply)?,
            None => return Err(TransportError::lost("event stream ended during handshake")),
        }
        debug!(url = %transport.url, "event-stream transport open");
        Ok(transport)
    }

    async fn post(&mut self, record: String) -> Result<(), TransportError> {
        let mut request = self
            .http
            .post(self.url.clone())
            .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(record);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map(|_| ())
            .map_err(TransportError::lost)
    }

    async fn next_record(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(Some(record));
            }
            match self.events.next().await {
                Some(Ok(chunk)) => {
                    for data in self.decoder.push(&chunk) {
                        self.pending.extend(split_records(&data).map(String::from));
                    }
                }
                Some(Err(e)) => return Err(TransportError::lost(e)),
                None => return Ok(None),
            }
        }
    }
}

impl HubTransport for SseTransport {
    fn kind(&self) -> TransportKind {
        KIND
    }

    fn send(&mut self, record: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.post(record))
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Option<String>, TransportError>> {
        Box::pin(self.next_record())
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.events = stream::empty().boxed();
            self.pending.clear();
        })
    }
}
