//! SSE client end-to-end tests against a local event-stream server.
//!
//! The server is a bare TCP listener speaking just enough HTTP/1.1 to hand
//! the client a `text/event-stream` body, which keeps full control over
//! disconnects and lets the tests capture the exact request headers.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use relaybus::sse::STREAM_HEADER;
use relaybus::{Codec, HandlerError, JsonCodec, Message, RetryConfig, SseConfig, SseConnector};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type HandlerResult = std::result::Result<(), HandlerError>;

const RESPONSE_HEAD: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn frame(msg: &Message) -> Vec<u8> {
    let encoded = JsonCodec.encode(msg).expect("encode failed");
    let mut out = Vec::new();
    out.extend_from_slice(STREAM_HEADER.as_bytes());
    out.extend_from_slice(b"\n");
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(&encoded);
    out.extend_from_slice(b"\n\n");
    out
}

/// Serve one response per body: accept a connection, capture its request
/// head, send the body, close. Drops the listener afterwards so further
/// connects are refused.
fn serve(
    listener: TcpListener,
    bodies: Vec<Vec<u8>>,
    request_tx: mpsc::UnboundedSender<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        for body in bodies {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut head = String::new();
            let mut buf = [0u8; 2048];
            while !head.contains("\r\n\r\n") {
                let Ok(n) = socket.read(&mut buf).await else {
                    return;
                };
                if n == 0 {
                    break;
                }
                head.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            let _ = request_tx.send(head);

            let _ = socket.write_all(RESPONSE_HEAD.as_bytes()).await;
            let _ = socket.write_all(&body).await;
            let _ = socket.shutdown().await;
        }
    })
}

fn collecting_handler(tx: mpsc::UnboundedSender<Message>) -> Arc<dyn relaybus::SseHandler> {
    Arc::new(move |msg: Message| -> BoxFuture<'static, HandlerResult> {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(msg);
            Ok(())
        })
    })
}

fn fast_retry() -> SseConfig {
    SseConfig {
        max_retries: 2,
        retry: RetryConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: 0.0,
        },
    }
}

#[tokio::test]
async fn test_delivery_resume_and_exhaustion() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/events", listener.local_addr().unwrap());

    let message = Message::new("updates", "server", "alex");
    let (request_tx, mut request_rx) = mpsc::unbounded_channel();
    // First connection delivers one event then hits EOF; the second serves
    // nothing and closes; after that connects are refused.
    let server = serve(
        listener,
        vec![frame(&message), Vec::new()],
        request_tx,
    );

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let connector = SseConnector::new(
        reqwest::Client::new(),
        Arc::new(JsonCodec),
        fast_retry(),
        cancel.clone(),
    );

    let client = connector
        .get(&url, collecting_handler(msg_tx), &[])
        .await
        .expect("connect failed");

    let first_request = request_rx.recv().await.unwrap();
    assert!(!first_request.to_lowercase().contains("last-event-id-list"));

    let delivered = tokio::time::timeout(Duration::from_secs(5), msg_rx.recv())
        .await
        .expect("no delivery")
        .unwrap();
    assert_eq!(delivered, message);

    // EOF triggers a reconnect carrying the last decoded id.
    let second_request = tokio::time::timeout(Duration::from_secs(5), request_rx.recv())
        .await
        .expect("no reconnect")
        .unwrap();
    assert!(second_request
        .to_lowercase()
        .contains(&format!("last-event-id-list: {}", message.id)));

    // Connects are refused now; the client exhausts its retries and exits.
    tokio::time::timeout(Duration::from_secs(10), client.wait())
        .await
        .expect("client did not terminate after retry exhaustion");

    server.abort();
}

#[tokio::test]
async fn test_initial_last_event_ids_sent() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/events", listener.local_addr().unwrap());

    let (request_tx, mut request_rx) = mpsc::unbounded_channel();
    let server = serve(listener, vec![Vec::new()], request_tx);

    let (msg_tx, _msg_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let connector = SseConnector::new(
        reqwest::Client::new(),
        Arc::new(JsonCodec),
        fast_retry(),
        cancel.clone(),
    );

    let client = connector
        .get(
            &url,
            collecting_handler(msg_tx),
            &["id-1".to_string(), "id-2".to_string()],
        )
        .await
        .expect("connect failed");

    let request = request_rx.recv().await.unwrap();
    assert!(request
        .to_lowercase()
        .contains("last-event-id-list: id-1;id-2"));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), client.wait())
        .await
        .expect("client did not exit on cancel");
    server.abort();
}

#[tokio::test]
async fn test_close_during_stream_does_not_reconnect() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/events", listener.local_addr().unwrap());

    let message = Message::new("updates", "server", "alex");
    let (request_tx, mut request_rx) = mpsc::unbounded_channel();

    // Hold the connection open after one event until the client goes away.
    let body = frame(&message);
    let server = tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut head = String::new();
        let mut buf = [0u8; 2048];
        while !head.contains("\r\n\r\n") {
            let Ok(n) = socket.read(&mut buf).await else { return };
            if n == 0 {
                break;
            }
            head.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        let _ = request_tx.send(head);
        let _ = socket.write_all(RESPONSE_HEAD.as_bytes()).await;
        let _ = socket.write_all(&body).await;
        // Keep the socket open; EOF would trigger a reconnect.
        let mut drain = [0u8; 64];
        while matches!(socket.read(&mut drain).await, Ok(n) if n > 0) {}
    });

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let connector = SseConnector::new(
        reqwest::Client::new(),
        Arc::new(JsonCodec),
        fast_retry(),
        cancel,
    );

    let client = connector
        .get(&url, collecting_handler(msg_tx), &[])
        .await
        .expect("connect failed");

    request_rx.recv().await.unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(5), msg_rx.recv())
        .await
        .expect("no delivery")
        .unwrap();
    assert_eq!(delivered.id, message.id);

    tokio::time::timeout(Duration::from_secs(5), client.close())
        .await
        .expect("close did not return");

    server.abort();
}

#[tokio::test]
async fn test_malformed_event_skipped() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/events", listener.local_addr().unwrap());

    let message = Message::new("updates", "server", "alex");
    let mut body = Vec::new();
    body.extend_from_slice(format!("{STREAM_HEADER}\ndata: not-json\n\n").as_bytes());
    body.extend_from_slice(&frame(&message));

    let (request_tx, _request_rx) = mpsc::unbounded_channel();
    let server = serve(listener, vec![body], request_tx);

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let connector = SseConnector::new(
        reqwest::Client::new(),
        Arc::new(JsonCodec),
        fast_retry(),
        cancel.clone(),
    );

    let client = connector
        .get(&url, collecting_handler(msg_tx), &[])
        .await
        .expect("connect failed");

    // The bad event is dropped; the following one still decodes.
    let delivered = tokio::time::timeout(Duration::from_secs(5), msg_rx.recv())
        .await
        .expect("no delivery")
        .unwrap();
    assert_eq!(delivered.id, message.id);

    cancel.cancel();
    client.wait().await;
    server.abort();
}
