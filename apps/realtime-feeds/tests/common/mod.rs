//! Shared helpers for the feed integration tests: a scriptable WebSocket
//! server on a loopback port and fast client settings.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use realtime_feeds::{FeedSettings, FeedStatus};

/// How long a test waits for any single expected event.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Client settings tuned for loopback tests.
pub fn fast_settings() -> FeedSettings {
    FeedSettings {
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(60),
        heartbeat_timeout: Duration::from_secs(5),
        backoff_base: Duration::from_millis(50),
        backoff_growth: 1.5,
        backoff_cap: Duration::from_millis(500),
        backoff_jitter: Duration::ZERO,
        max_reconnect_attempts: 5,
    }
}

/// Wait until the status satisfies `predicate`.
pub async fn wait_for_status(
    mut status: watch::Receiver<FeedStatus>,
    predicate: impl FnMut(&FeedStatus) -> bool,
) -> FeedStatus {
    tokio::time::timeout(STEP_TIMEOUT, status.wait_for(predicate))
        .await
        .expect("status did not change in time")
        .expect("controller stopped")
        .clone()
}

/// Loopback WebSocket server that hands each accepted socket to the test.
pub struct MockServer {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
    accepted: Arc<AtomicUsize>,
    auth_headers: Arc<Mutex<Vec<Option<String>>>>,
}

impl MockServer {
    /// Accept every handshake.
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    /// Refuse every handshake with `status`.
    pub async fn rejecting(status: u16) -> Self {
        Self::start_with(Some(status)).await
    }

    async fn start_with(reject: Option<u16>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn_tx, connections) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));
        let auth_headers = Arc::new(Mutex::new(Vec::new()));

        let counter = Arc::clone(&accepted);
        let headers = Arc::clone(&auth_headers);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let headers = Arc::clone(&headers);
                let callback = move |request: &Request, response: Response| {
                    let header = request
                        .headers()
                        .get(AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    headers.lock().unwrap().push(header);

                    match reject {
                        Some(status) => {
                            let mut error = ErrorResponse::new(None);
                            *error.status_mut() = StatusCode::from_u16(status).unwrap();
                            Err(error)
                        }
                        None => Ok(response),
                    }
                };

                let Ok(socket) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    continue;
                };

                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let (in_tx, in_rx) = mpsc::unbounded_channel();
                tokio::spawn(serve(socket, out_rx, in_tx));
                let _ = conn_tx.send(ServerConnection {
                    outbound: out_tx,
                    inbound: in_rx,
                });
            }
        });

        Self {
            addr,
            connections,
            accepted,
            auth_headers,
        }
    }

    /// Page origin that maps onto this server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Socket URL for an arbitrary path.
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }

    /// Next accepted socket.
    pub async fn next_connection(&mut self) -> ServerConnection {
        tokio::time::timeout(STEP_TIMEOUT, self.connections.recv())
            .await
            .expect("no connection in time")
            .expect("server stopped")
    }

    /// TCP connections accepted so far, rejected handshakes included.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// `Authorization` header of every handshake so far.
    pub fn auth_headers(&self) -> Vec<Option<String>> {
        self.auth_headers.lock().unwrap().clone()
    }
}

/// Server side of one accepted socket. Dropping it drops the TCP stream
/// without a close handshake.
pub struct ServerConnection {
    outbound: mpsc::UnboundedSender<Message>,
    inbound: mpsc::UnboundedReceiver<String>,
}

impl ServerConnection {
    /// Next text frame from the client, heartbeat probes included.
    pub async fn recv_any(&mut self) -> Value {
        let text = tokio::time::timeout(STEP_TIMEOUT, self.inbound.recv())
            .await
            .expect("no frame in time")
            .expect("client went away");
        serde_json::from_str(&text).unwrap()
    }

    /// Next text frame that is not a heartbeat probe.
    pub async fn recv(&mut self) -> Value {
        loop {
            let frame = self.recv_any().await;
            if frame["type"] != "ping" {
                return frame;
            }
        }
    }

    /// Assert the client sends nothing but probes for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.inbound.recv()).await {
                Err(_) | Ok(None) => return,
                Ok(Some(text)) => {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    assert_eq!(frame["type"], "ping", "unexpected frame {frame}");
                }
            }
        }
    }

    /// Send a JSON frame.
    pub fn send(&self, frame: &Value) {
        let _ = self.outbound.send(Message::text(frame.to_string()));
    }

    /// Close the socket with `code`.
    pub fn close(&self, code: u16) {
        let _ = self.outbound.send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        })));
    }
}

async fn serve(
    socket: WebSocketStream<TcpStream>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    inbound: mpsc::UnboundedSender<String>,
) {
    let (mut write, mut read) = socket.split();
    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if write.send(message).await.is_err() || closing {
                        break;
                    }
                }
                None => break,
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound.send(text.to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }
}
