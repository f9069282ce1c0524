//! SSE streaming client.
//!
//! Maintains a long-lived `text/event-stream` response body, decodes each
//! event through the configured [`Codec`], and hands the resulting
//! [`Message`] to a handler. On read errors or EOF the client reconnects
//! with the pluggable backoff, resuming from the last decoded message id
//! via the `Last-Event-Id-List` header. Cancellation closes the body and
//! returns without reconnecting.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL};
use reqwest::{Method, Response};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::HandlerError;
use crate::codec::Codec;
use crate::message::Message;
use crate::utils::retry::{RetryConfig, RetryFunc};

mod parser;

pub use parser::STREAM_HEADER;

use parser::FrameAccumulator;

/// Header carrying the semicolon-joined list of last-seen event ids on
/// resume.
pub const LAST_EVENT_ID_LIST_HEADER: &str = "last-event-id-list";

/// Result type for SSE operations.
pub type Result<T> = std::result::Result<T, SseError>;

/// Errors from the SSE client.
#[derive(Debug, thiserror::Error)]
pub enum SseError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid header value: {0}")]
    Header(String),
}

/// Handler for decoded stream messages.
///
/// Implemented for closures of the same shape. Errors are logged; they do
/// not tear the stream down.
pub trait SseHandler: Send + Sync {
    fn handle(&self, msg: Message) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F> SseHandler for F
where
    F: Fn(Message) -> BoxFuture<'static, std::result::Result<(), HandlerError>> + Send + Sync,
{
    fn handle(&self, msg: Message) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        (self)(msg)
    }
}

/// Configuration for SSE streams.
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// Consecutive reconnect failures before the client terminates.
    pub max_retries: u32,
    /// Reconnect backoff shape.
    pub retry: RetryConfig,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry: RetryConfig::default(),
        }
    }
}

/// Connection factory for [`SseClient`]s.
///
/// Carries the HTTP client, codec, and retry policy; each `get`/`post`/...
/// call opens one live stream.
pub struct SseConnector {
    client: reqwest::Client,
    codec: Arc<dyn Codec>,
    retry_fn: RetryFunc,
    max_retries: u32,
    cancel: CancellationToken,
}

impl SseConnector {
    pub fn new(
        client: reqwest::Client,
        codec: Arc<dyn Codec>,
        config: SseConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            codec,
            retry_fn: config.retry.retry_func(),
            max_retries: config.max_retries,
            cancel,
        }
    }

    /// Override the backoff function.
    pub fn with_retry_func(mut self, retry_fn: RetryFunc) -> Self {
        self.retry_fn = retry_fn;
        self
    }

    pub async fn get(
        &self,
        url: impl Into<String>,
        handler: Arc<dyn SseHandler>,
        last_event_ids: &[String],
    ) -> Result<SseClient> {
        self.request(Method::GET, url, None, handler, last_event_ids)
            .await
    }

    pub async fn post(
        &self,
        url: impl Into<String>,
        body: Vec<u8>,
        handler: Arc<dyn SseHandler>,
        last_event_ids: &[String],
    ) -> Result<SseClient> {
        self.request(Method::POST, url, Some(body), handler, last_event_ids)
            .await
    }

    pub async fn put(
        &self,
        url: impl Into<String>,
        body: Vec<u8>,
        handler: Arc<dyn SseHandler>,
        last_event_ids: &[String],
    ) -> Result<SseClient> {
        self.request(Method::PUT, url, Some(body), handler, last_event_ids)
            .await
    }

    pub async fn patch(
        &self,
        url: impl Into<String>,
        body: Vec<u8>,
        handler: Arc<dyn SseHandler>,
        last_event_ids: &[String],
    ) -> Result<SseClient> {
        self.request(Method::PATCH, url, Some(body), handler, last_event_ids)
            .await
    }

    pub async fn delete(
        &self,
        url: impl Into<String>,
        handler: Arc<dyn SseHandler>,
        last_event_ids: &[String],
    ) -> Result<SseClient> {
        self.request(Method::DELETE, url, None, handler, last_event_ids)
            .await
    }

    /// Open a stream with an arbitrary method. The initial request carries
    /// `last_event_ids` (semicolon-joined) when non-empty; reconnects carry
    /// the id of the last decoded message instead.
    pub async fn request(
        &self,
        method: Method,
        url: impl Into<String>,
        body: Option<Vec<u8>>,
        handler: Arc<dyn SseHandler>,
        last_event_ids: &[String],
    ) -> Result<SseClient> {
        let url = url.into();
        let headers = stream_headers(last_event_ids)?;

        let mut request = self.client.request(method.clone(), &url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SseError::Request(e.to_string()))?;

        info!(url = %url, method = %method, "event stream connected");

        let cancel = self.cancel.child_token();
        let (done, _) = watch::channel(false);
        let client = SseClient {
            cancel: cancel.clone(),
            done: done.subscribe(),
        };

        let worker = StreamWorker {
            client: self.client.clone(),
            codec: self.codec.clone(),
            handler,
            retry_fn: self.retry_fn.clone(),
            max_retries: self.max_retries,
            method,
            url,
            initial_ids: last_event_ids.to_vec(),
            last_id: None,
            cancel,
            done,
        };
        tokio::spawn(worker.run(response));

        Ok(client)
    }
}

/// One live event stream.
pub struct SseClient {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl SseClient {
    /// Cancel the stream and wait for the reader task to exit. No reconnect
    /// is attempted.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.wait().await;
    }

    /// Block until the reader task exits (cancellation, or retry budget
    /// exhausted).
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }
}

fn stream_headers(last_event_ids: &[String]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    if !last_event_ids.is_empty() {
        let joined = last_event_ids.join(";");
        headers.insert(
            HeaderName::from_static(LAST_EVENT_ID_LIST_HEADER),
            HeaderValue::from_str(&joined).map_err(|e| SseError::Header(e.to_string()))?,
        );
    }
    Ok(headers)
}

enum ReadEnd {
    Cancelled,
    Disconnected,
}

struct StreamWorker {
    client: reqwest::Client,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn SseHandler>,
    retry_fn: RetryFunc,
    max_retries: u32,
    method: Method,
    url: String,
    initial_ids: Vec<String>,
    last_id: Option<Uuid>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

impl StreamWorker {
    async fn run(mut self, mut response: Response) {
        let mut backoff = Duration::ZERO;
        let mut failures: u32 = 0;

        'stream: loop {
            match self.read_stream(response).await {
                ReadEnd::Cancelled => break 'stream,
                ReadEnd::Disconnected => loop {
                    backoff = (self.retry_fn)(backoff);
                    debug!(
                        url = %self.url,
                        backoff_ms = backoff.as_millis() as u64,
                        "reconnecting event stream"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break 'stream,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    match self.reconnect().await {
                        Ok(next) => {
                            failures = 0;
                            backoff = Duration::ZERO;
                            info!(url = %self.url, "event stream reconnected");
                            response = next;
                            continue 'stream;
                        }
                        Err(err) => {
                            failures += 1;
                            if failures >= self.max_retries {
                                error!(
                                    url = %self.url,
                                    error = %err,
                                    attempts = failures,
                                    "reconnect failed; giving up"
                                );
                                break 'stream;
                            }
                            warn!(url = %self.url, error = %err, "reconnect failed; retrying");
                        }
                    }
                },
            }
        }

        let _ = self.done.send(true);
    }

    /// Consume one response body until cancellation, error, or EOF.
    async fn read_stream(&mut self, response: Response) -> ReadEnd {
        let mut stream = response.bytes_stream();
        let mut accumulator = FrameAccumulator::new();
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return ReadEnd::Cancelled,
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    pending.extend_from_slice(&bytes);
                    // Split on newlines only; a multi-byte char never spans a
                    // line boundary.
                    while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                        let raw: Vec<u8> = pending.drain(..=newline).collect();
                        let line = String::from_utf8_lossy(&raw);
                        if let Some(frame) = accumulator.push_line(line.trim_end_matches('\n')) {
                            self.handle_frame(&frame).await;
                        }
                    }
                }
                Some(Err(err)) => {
                    warn!(url = %self.url, error = %err, "stream read failed");
                    return ReadEnd::Disconnected;
                }
                None => {
                    debug!(url = %self.url, "stream ended");
                    return ReadEnd::Disconnected;
                }
            }
        }
    }

    /// Decode one event body and hand it to the handler. Decode failures
    /// skip the event; framing state survives.
    async fn handle_frame(&mut self, frame: &[u8]) {
        match self.codec.decode(frame) {
            Ok(msg) => {
                self.last_id = Some(msg.id);
                if let Err(err) = self.handler.handle(msg).await {
                    error!(url = %self.url, error = %err, "stream handler failed");
                }
            }
            Err(err) => {
                error!(url = %self.url, error = %err, "failed to decode event; skipped");
            }
        }
    }

    /// Re-issue the original method and URL, resuming from the last decoded
    /// message id when one is known.
    async fn reconnect(&self) -> Result<Response> {
        let ids: Vec<String> = match self.last_id {
            Some(id) => vec![id.to_string()],
            None => self.initial_ids.clone(),
        };
        let headers = stream_headers(&ids)?;
        self.client
            .request(self.method.clone(), &self.url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| SseError::Request(e.to_string()))
    }
}
