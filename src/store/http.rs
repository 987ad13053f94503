//! PocketBase-compatible HTTP record store.
//!
//! DESIGN
//! ======
//! CRUD maps onto `/api/collections/{collection}/records`. Realtime uses the
//! server-sent-events endpoint `/api/realtime`: the first event
//! (`PB_CONNECT`) carries a client id, which is then bound to a subscription
//! topic with a POST. A background task parses the stream and feeds the sink
//! until the handle is closed or the connection drops.
//!
//! CRUD, auth and the subscription POST are bounded by the configured
//! request timeout. The event stream itself is not.

use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    AuthResponse, ChangeAction, EventSink, FeedEvent, ListQuery, ListResult, RealtimeHandle, Record, RecordStore,
    StoreError,
};
use crate::config::StoreConfig;

pub struct HttpRecordStore {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRecordStore {
    /// Build a store client from config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| StoreError::Request(e.to_string()))?;
        Ok(Self { client, base_url: config.base_url.trim_end_matches('/').to_owned(), timeout })
    }

    /// Request with the whole exchange, body included, under the timeout.
    fn bounded(&self, req: RequestBuilder) -> RequestBuilder {
        req.timeout(self.timeout)
    }

    fn records_url(&self, collection: &str) -> String {
        format!("{}/api/collections/{collection}/records", self.base_url)
    }

    fn record_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}", self.records_url(collection), urlencoding::encode(id))
    }

    /// Bounded request carrying the caller's token, if any.
    fn with_token(&self, req: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        let req = self.bounded(req);
        match token {
            Some(token) => req.header(AUTHORIZATION, token),
            None => req,
        }
    }

    async fn send(req: RequestBuilder) -> Result<Response, StoreError> {
        let resp = req.send().await.map_err(request_error)?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::Response { status, message: error_message(&body) })
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, StoreError> {
        resp.json::<T>().await.map_err(|e| {
            if e.is_timeout() { StoreError::Timeout } else { StoreError::Parse(e.to_string()) }
        })
    }
}

fn request_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() { StoreError::Timeout } else { StoreError::Request(err.to_string()) }
}

/// Pull the `message` field out of an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| body.to_owned())
}

fn not_found(err: StoreError, collection: &str, id: &str) -> StoreError {
    match err {
        StoreError::Response { status: 404, .. } => {
            StoreError::NotFound { collection: collection.to_owned(), id: id.to_owned() }
        }
        other => other,
    }
}

#[async_trait::async_trait]
impl RecordStore for HttpRecordStore {
    async fn authenticate(&self, collection: &str, identity: &str, secret: &str) -> Result<AuthResponse, StoreError> {
        let url = format!("{}/api/collections/{collection}/auth-with-password", self.base_url);
        let req = self
            .bounded(self.client.post(url))
            .json(&serde_json::json!({ "identity": identity, "password": secret }));
        match Self::send(req).await {
            Ok(resp) => Self::json(resp).await,
            Err(StoreError::Response { status: 400, .. }) => Err(StoreError::InvalidCredentials),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, token: Option<&str>, collection: &str, query: &ListQuery) -> Result<ListResult, StoreError> {
        let mut params = vec![("page", query.page.to_string()), ("perPage", query.per_page.to_string())];
        if let Some(sort) = &query.sort {
            params.push(("sort", sort.clone()));
        }
        if let Some(filter) = &query.filter {
            params.push(("filter", filter.to_expression()));
        }
        let req = self.with_token(self.client.get(self.records_url(collection)), token).query(&params);
        Self::json(Self::send(req).await?).await
    }

    async fn get_one(&self, token: Option<&str>, collection: &str, id: &str) -> Result<Record, StoreError> {
        let req = self.with_token(self.client.get(self.record_url(collection, id)), token);
        let resp = Self::send(req)
            .await
            .map_err(|e| not_found(e, collection, id))?;
        Self::json(resp).await
    }

    async fn create(&self, token: Option<&str>, collection: &str, data: &Value) -> Result<Record, StoreError> {
        let req = self.with_token(self.client.post(self.records_url(collection)), token).json(data);
        Self::json(Self::send(req).await?).await
    }

    async fn update(&self, token: Option<&str>, collection: &str, id: &str, data: &Value) -> Result<Record, StoreError> {
        let req = self.with_token(self.client.patch(self.record_url(collection, id)), token).json(data);
        let resp = Self::send(req)
            .await
            .map_err(|e| not_found(e, collection, id))?;
        Self::json(resp).await
    }

    async fn delete(&self, token: Option<&str>, collection: &str, id: &str) -> Result<(), StoreError> {
        let req = self.with_token(self.client.delete(self.record_url(collection, id)), token);
        Self::send(req)
            .await
            .map_err(|e| not_found(e, collection, id))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        token: Option<&str>,
        collection: &str,
        topic: &str,
        sink: EventSink,
    ) -> Result<Box<dyn RealtimeHandle>, StoreError> {
        let url = format!("{}/api/realtime", self.base_url);
        let resp = Self::send(self.client.get(&url).header(ACCEPT, "text/event-stream"))
            .await
            .map_err(|e| StoreError::Realtime(e.to_string()))?;
        let mut stream = Box::pin(resp.bytes_stream());
        let mut parser = SseParser::default();

        let client_id = 'connect: loop {
            let Some(chunk) = stream.next().await else {
                return Err(StoreError::Realtime("stream closed before PB_CONNECT".into()));
            };
            let chunk = chunk.map_err(|e| StoreError::Realtime(e.to_string()))?;
            for event in parser.push(&chunk) {
                if event.event == "PB_CONNECT" {
                    let client_id = serde_json::from_str::<Value>(&event.data)
                        .ok()
                        .and_then(|v| v.get("clientId").and_then(Value::as_str).map(str::to_owned))
                        .ok_or_else(|| StoreError::Realtime("PB_CONNECT without clientId".into()))?;
                    break 'connect client_id;
                }
            }
        };

        let subscription = format!("{collection}/{topic}");
        let req = self.with_token(self.client.post(&url), token)
            .json(&serde_json::json!({ "clientId": client_id, "subscriptions": [subscription] }));
        Self::send(req)
            .await
            .map_err(|e| StoreError::Realtime(e.to_string()))?;
        debug!(%client_id, %subscription, "realtime: subscribed");

        let task = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        for event in parser.push(&chunk) {
                            if event.event != subscription {
                                continue;
                            }
                            match parse_change(&event.data) {
                                Some(change) => sink(change),
                                None => warn!(%subscription, "realtime: unparseable event dropped"),
                            }
                        }
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream closed".to_owned(),
                }
            };
            sink(FeedEvent::Disconnected { reason });
        });

        Ok(Box::new(HttpRealtimeHandle { task: Some(task) }))
    }
}

fn parse_change(data: &str) -> Option<FeedEvent> {
    #[derive(serde::Deserialize)]
    struct Payload {
        action: ChangeAction,
        record: Record,
    }
    let payload: Payload = serde_json::from_str(data).ok()?;
    Some(FeedEvent::Change { action: payload.action, record: payload.record })
}

struct HttpRealtimeHandle {
    task: Option<JoinHandle<()>>,
}

impl RealtimeHandle for HttpRealtimeHandle {
    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HttpRealtimeHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// SSE PARSER
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Feed raw chunks, get whole events.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buf: Vec<u8>,
}

impl SseParser {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buf.drain(..end + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent { event: "message".into(), data: String::new() };
    let mut has_data = false;
    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => value.clone_into(&mut event.event),
            "data" => {
                if has_data {
                    event.data.push('\n');
                }
                event.data.push_str(value);
                has_data = true;
            }
            _ => {}
        }
    }
    has_data.then_some(event)
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
