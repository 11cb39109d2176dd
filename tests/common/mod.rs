#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Each test binary uses a different subset of the helpers"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use realtime_chat::auth::StaticToken;
use realtime_chat::chat::{Config, Endpoint, Registry};
use realtime_chat::ws::frame::{Command, Frame};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

pub const TOKEN: &str = "test-jwt";
pub const IDENTITY: &str = "u1";

/// Something the broker pushes to every open connection.
#[derive(Clone, Debug)]
enum Push {
    /// Body of a `MESSAGE` frame
    Message(String),
    /// Raw WebSocket text, sent as is
    Raw(String),
    /// Close every connection with an abnormal close code
    Drop,
}

/// In-process STOMP broker speaking just enough of the protocol for the chat client.
///
/// Records every non-heartbeat frame a client sends and can reject handshakes.
pub struct MockBroker {
    addr: SocketAddr,
    push_tx: broadcast::Sender<Push>,
    frames_rx: mpsc::UnboundedReceiver<Frame>,
    /// Handshakes to reject before accepting again; `u32::MAX` rejects forever
    reject: Arc<AtomicU32>,
    /// Handshakes to answer with a `RECEIPT` instead of `CONNECTED`
    misreply: Arc<AtomicU32>,
    /// Milliseconds to stall before sending `CONNECTED`
    connected_delay: Arc<AtomicU64>,
    handshakes: Arc<AtomicU32>,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
            0 => None,
            u32::MAX => Some(u32::MAX),
            n => Some(n - 1),
        })
        .is_ok()
}

impl MockBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (push_tx, _) = broadcast::channel::<Push>(100);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel::<Frame>();
        let reject = Arc::new(AtomicU32::new(0));
        let misreply = Arc::new(AtomicU32::new(0));
        let connected_delay = Arc::new(AtomicU64::new(0));
        let handshakes = Arc::new(AtomicU32::new(0));

        let pushes = push_tx.clone();
        let rejecting = Arc::clone(&reject);
        let misreplying = Arc::clone(&misreply);
        let stalling = Arc::clone(&connected_delay);
        let handshaking = Arc::clone(&handshakes);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let frames_tx = frames_tx.clone();
                let mut push_rx = pushes.subscribe();
                let reject = Arc::clone(&rejecting);
                let misreply = Arc::clone(&misreplying);
                let connected_delay = Arc::clone(&stalling);
                let handshakes = Arc::clone(&handshaking);

                tokio::spawn(async move {
                    let mut message_id = 0_u32;
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                let text = match msg {
                                    Some(Ok(Message::Text(text))) => text,
                                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                                    Some(Ok(_)) => continue,
                                };
                                let Ok(Some(frame)) = Frame::parse(&text) else {
                                    continue;
                                };
                                let command = frame.command;
                                drop(frames_tx.send(frame));

                                if command == Command::Connect {
                                    handshakes.fetch_add(1, Ordering::SeqCst);

                                    if take_one(&misreply) {
                                        let receipt = Frame::new(Command::Receipt).header("receipt-id", "77");
                                        if write.send(Message::Text(receipt.encode().into())).await.is_err() {
                                            break;
                                        }
                                        continue;
                                    }

                                    if take_one(&reject) {
                                        let error = Frame::new(Command::Error)
                                            .header("message", "401 Unauthorized: token rejected");
                                        drop(write.send(Message::Text(error.encode().into())).await);
                                        drop(write.send(Message::Close(None)).await);
                                        break;
                                    }

                                    let delay = connected_delay.load(Ordering::SeqCst);
                                    if delay > 0 {
                                        tokio::time::sleep(Duration::from_millis(delay)).await;
                                    }

                                    let connected = Frame::new(Command::Connected)
                                        .header("version", "1.2")
                                        .header("server", "mock-broker/1.0")
                                        .header("heart-beat", "0,0");
                                    if write.send(Message::Text(connected.encode().into())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            push = push_rx.recv() => {
                                let text = match push {
                                    Ok(Push::Message(body)) => {
                                        message_id += 1;
                                        Frame::new(Command::Message)
                                            .header("destination", "/user/u1/queue/messages")
                                            .header("subscription", "sub-0")
                                            .header("message-id", message_id.to_string())
                                            .json_body(body)
                                            .encode()
                                    }
                                    Ok(Push::Raw(text)) => text,
                                    Ok(Push::Drop) => {
                                        let close = CloseFrame {
                                            code: CloseCode::Error,
                                            reason: "broker restarting".into(),
                                        };
                                        drop(write.send(Message::Close(Some(close))).await);
                                        break;
                                    }
                                    Err(_) => break,
                                };
                                if write.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            push_tx,
            frames_rx,
            reject,
            misreply,
            connected_delay,
            handshakes,
        }
    }

    /// Endpoint URL with an `{identity}` placeholder.
    pub fn url(&self) -> String {
        format!("ws://{}/ws/chat/{{identity}}", self.addr)
    }

    /// Delivers a `MESSAGE` frame with `body` to every connected client.
    pub fn publish(&self, body: &str) {
        drop(self.push_tx.send(Push::Message(body.to_owned())));
    }

    pub fn send_raw(&self, text: &str) {
        drop(self.push_tx.send(Push::Raw(text.to_owned())));
    }

    /// Closes every open connection with close code 1011.
    pub fn drop_all(&self) {
        drop(self.push_tx.send(Push::Drop));
    }

    pub fn reject_next(&self, handshakes: u32) {
        self.reject.store(handshakes, Ordering::SeqCst);
    }

    pub fn reject_all(&self) {
        self.reject.store(u32::MAX, Ordering::SeqCst);
    }

    /// Answers the next `handshakes` CONNECT frames with a `RECEIPT` frame.
    pub fn misreply_next(&self, handshakes: u32) {
        self.misreply.store(handshakes, Ordering::SeqCst);
    }

    /// Holds back every `CONNECTED` frame for `delay`.
    pub fn delay_connected(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap();
        self.connected_delay.store(millis, Ordering::SeqCst);
    }

    pub fn accept_all(&self) {
        self.reject.store(0, Ordering::SeqCst);
    }

    pub fn handshakes(&self) -> u32 {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Next frame any client sent, or `None` after two seconds of silence.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        timeout(Duration::from_secs(2), self.frames_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next frame with the given command, skipping others.
    pub async fn recv_command(&mut self, command: Command) -> Option<Frame> {
        loop {
            let frame = self.recv_frame().await?;
            if frame.command == command {
                return Some(frame);
            }
        }
    }

    /// Whether no frame arrives within `window`.
    pub async fn is_quiet(&mut self, window: Duration) -> bool {
        timeout(window, self.frames_rx.recv()).await.is_err()
    }
}

/// A TCP endpoint that accepts connections and never answers the WebSocket upgrade.
///
/// Returns a URL template for it and the task holding the accepted sockets open.
pub async fn silent_endpoint() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    (format!("ws://{addr}/ws/chat/{{identity}}"), task)
}

/// Configuration pointing at `broker` with fast, jitter-free reconnects.
pub fn config(broker: &MockBroker) -> Config {
    let mut config = Config::default();
    config.endpoint = Endpoint::with_url(broker.url());
    config.connection.reconnect.base_delay = Duration::from_millis(20);
    config.connection.reconnect.max_delay = Duration::from_millis(100);
    config.connection.reconnect.max_jitter = Duration::ZERO;
    config.retry.initial_backoff = Duration::from_millis(20);
    config.retry.max_backoff = Duration::from_millis(50);
    config
}

pub fn registry(config: Config) -> Arc<Registry> {
    Arc::new(Registry::new(config, StaticToken::new(TOKEN)))
}
