//! Maintains the bidirectional socket to the Service: connect timeout,
//! heartbeat, keepalive pings, and frame decoding (§4.6).
//!
//! Grounded on `node-sdk::client::NodeClient`: a writer task drains an
//! outbound channel onto the socket sink, a reader task turns inbound
//! frames into typed events, and dedicated interval tasks own the
//! heartbeat/keepalive pings — the same task split `NodeClient::run`
//! uses for its `ping_task`/`writer_task` pair, scaled down to this
//! protocol's simpler framing (no per-request semaphore, no tool
//! dispatch; that lives in the session).
//!
//! Per the design notes on cyclic references, this client never calls
//! back into the session directly — inbound frames are delivered on an
//! [`EventQueue`] the session drains, keeping ownership acyclic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::protocol::{ClientEvent, Heartbeat};
use crate::queue::EventQueue;

#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// A successfully JSON-decoded frame — handed to the session as a raw
    /// action document.
    Frame(Value),
    /// A frame that failed to decode as UTF-8 JSON.
    DecodeError(String),
    /// The socket closed, carrying the close code and reason.
    Closed { code: u16, reason: String },
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The open bidirectional socket. Dropping it does not close the
/// connection; call [`SocketClient::close`] explicitly.
pub struct SocketClient {
    outbound_tx: mpsc::UnboundedSender<Message>,
    events: Arc<EventQueue<SocketEvent>>,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketClient {
    pub async fn connect(url: &str, config: &Config) -> Result<Self> {
        let connect_fut = tokio_tungstenite::connect_async(url);
        let (ws_stream, _response) = tokio::time::timeout(config.connect_timeout, connect_fut)
            .await
            .map_err(|_| BridgeError::ConnectTimeout(config.connect_timeout))?
            .map_err(|e| BridgeError::ConnectFailed(e.to_string()))?;

        let (mut sink, mut stream) = ws_stream.split();
        let events = Arc::new(EventQueue::new());
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let closed = Arc::new(AtomicBool::new(false));

        let closed_writer = closed.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            closed_writer.store(true, Ordering::SeqCst);
        });

        let events_reader = events.clone();
        let closed_reader = closed.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(v) => events_reader.push(SocketEvent::Frame(v)).await,
                        Err(e) => events_reader.push(SocketEvent::DecodeError(e.to_string())).await,
                    },
                    Ok(Message::Binary(bytes)) => {
                        match std::str::from_utf8(&bytes)
                            .ok()
                            .and_then(|s| serde_json::from_str::<Value>(s).ok())
                        {
                            Some(v) => events_reader.push(SocketEvent::Frame(v)).await,
                            None => {
                                events_reader
                                    .push(SocketEvent::DecodeError("binary frame was not utf-8 JSON".into()))
                                    .await
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1000, String::new()));
                        events_reader.push(SocketEvent::Closed { code, reason }).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "socket read error");
                        events_reader
                            .push(SocketEvent::Closed { code: 1006, reason: e.to_string() })
                            .await;
                        break;
                    }
                }
            }
            closed_reader.store(true, Ordering::SeqCst);
            events_reader.close().await;
        });

        let heartbeat_task = {
            let tx = outbound_tx.clone();
            let closed = closed.clone();
            let interval = config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick fires immediately; skip it
                loop {
                    ticker.tick().await;
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    let frame = ClientEvent::Heartbeat(Heartbeat { timestamp: now_ms() });
                    let Ok(text) = serde_json::to_string(&frame) else { break };
                    if tx.send(Message::Text(text)).is_err() {
                        break;
                    }
                }
            })
        };

        let keepalive_task = {
            let tx = outbound_tx.clone();
            let closed = closed.clone();
            let interval = config.keepalive_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    let payload = now_ms().to_string().into_bytes();
                    if tx.send(Message::Ping(payload)).is_err() {
                        break;
                    }
                }
            })
        };

        Ok(Self {
            outbound_tx,
            events,
            closed,
            tasks: vec![writer_task, reader_task, heartbeat_task, keepalive_task],
        })
    }

    /// Encode and send a client event. Returns `false` if the socket is
    /// not open.
    pub fn send(&self, event: &ClientEvent) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let Ok(text) = serde_json::to_string(event) else {
            return false;
        };
        self.outbound_tx.send(Message::Text(text)).is_ok()
    }

    /// Await the next decoded frame or close notification.
    pub async fn next_event(&self) -> Option<SocketEvent> {
        self.events.take().await
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Stop timers, close with normal code 1000, clear internal state.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound_tx.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })));
        for task in &self.tasks {
            task.abort();
        }
        self.events.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[tokio::test]
    async fn connect_and_receive_a_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"newCheckpoint":{"status":"RUNNING"}}"#.into()))
                .await
                .unwrap();
        });

        let mut config = Config::default();
        config.connect_timeout = std::time::Duration::from_secs(5);
        let client = SocketClient::connect(&format!("ws://127.0.0.1:{port}"), &config)
            .await
            .unwrap();

        match client.next_event().await {
            Some(SocketEvent::Frame(v)) => {
                assert_eq!(v["newCheckpoint"]["status"], "RUNNING");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_fails_after_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ws = accept_async(stream).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let client = SocketClient::connect(&format!("ws://127.0.0.1:{port}"), &Config::default())
            .await
            .unwrap();
        client.close().await;
        let heartbeat = ClientEvent::Heartbeat(Heartbeat { timestamp: 0 });
        assert!(!client.send(&heartbeat));
    }

    #[tokio::test]
    async fn connect_times_out_against_a_dead_address() {
        let mut config = Config::default();
        config.connect_timeout = std::time::Duration::from_millis(50);
        // 192.0.2.0/24 is reserved (TEST-NET-1) and will not accept.
        let result = SocketClient::connect("ws://192.0.2.1:9", &config).await;
        assert!(result.is_err());
    }
}
