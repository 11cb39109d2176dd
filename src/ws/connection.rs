use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use secrecy::ExposeSecret as _;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, interval_at, sleep_until, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

use super::config::{Config, negotiate_heartbeat, parse_heartbeat};
use super::error::WsError;
use super::frame::{Command, Frame};
use super::traits::SessionHandler;
use crate::auth::TokenProvider;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Multiplier applied to the negotiated incoming heartbeat before the peer is considered dead.
const INCOMING_GRACE_FACTOR: u32 = 2;

type Ack = oneshot::Sender<Result<(), WsError>>;

enum Outbound {
    Frame(Frame, Ack),
    Close(Vec<Frame>, Ack),
}

/// An open transport whose STOMP handshake succeeded but whose I/O task is not running yet.
pub struct Handshake {
    stream: WsStream,
    heartbeat: (Option<Duration>, Option<Duration>),
    server: Option<String>,
}

impl Handshake {
    /// Opens the transport to `url` and negotiates a STOMP session.
    ///
    /// The bearer token is requested from `tokens` only after the transport is open. Opening the
    /// transport and waiting for `CONNECTED` share one `handshake_timeout` deadline.
    pub async fn open(
        url: &Url,
        tokens: &dyn TokenProvider,
        config: &Config,
    ) -> Result<Self, WsError> {
        timeout(config.handshake_timeout, Self::negotiate(url, tokens, config))
            .await
            .unwrap_or(Err(WsError::Timeout))
    }

    async fn negotiate(
        url: &Url,
        tokens: &dyn TokenProvider,
        config: &Config,
    ) -> Result<Self, WsError> {
        let (mut stream, _) = connect_async(url.as_str()).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(%url, "transport open, starting STOMP handshake");

        let token = tokens.token();
        let host = url.host_str().unwrap_or("localhost");
        let connect = Frame::connect(
            host,
            config.heartbeat_header(),
            token.as_ref().map(|token| token.expose_secret()),
        );

        let result = match stream.send(Message::Text(connect.encode().into())).await {
            Ok(()) => await_connected(&mut stream).await,
            Err(e) => Err(WsError::Connection(e)),
        };

        match result {
            Ok(connected) => {
                let server = parse_heartbeat(connected.get("heart-beat"));
                Ok(Self {
                    stream,
                    heartbeat: negotiate_heartbeat(config.heartbeat_header(), server),
                    server: connected.get("server").map(str::to_owned),
                })
            }
            Err(e) => {
                // Best effort, the broker usually closes on its own after ERROR.
                _ = stream.close(None).await;
                Err(e)
            }
        }
    }

    /// Broker identification from the `CONNECTED` frame.
    #[must_use]
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// Writes a frame before the I/O task takes over the stream.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), WsError> {
        self.stream
            .send(Message::Text(frame.encode().into()))
            .await
            .map_err(WsError::from)
    }

    /// Closes the transport without starting a session.
    pub async fn abandon(mut self) {
        _ = self.stream.close(None).await;
    }

    /// Hands the stream to a background task that drives the session.
    #[must_use]
    pub fn spawn(self, handler: Arc<dyn SessionHandler>) -> Session {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(self.stream, self.heartbeat, rx, handler));
        Session {
            sender: SessionSender { tx },
            task,
        }
    }
}

async fn await_connected(stream: &mut WsStream) -> Result<Frame, WsError> {
    loop {
        let message = stream.next().await.ok_or(WsError::ConnectionClosed {
            code: None,
            reason: "closed during handshake".to_owned(),
        })??;

        let text = match message {
            Message::Text(text) => text,
            Message::Close(frame) => return Err(closed(frame)),
            _ => continue,
        };

        let parsed = Frame::parse(&text).map_err(|e| WsError::Protocol(e.to_string()))?;
        let Some(frame) = parsed else {
            continue;
        };

        return match frame.command {
            Command::Connected => Ok(frame),
            Command::Error => Err(WsError::HandshakeRejected {
                message: frame.error_message(),
            }),
            other => Err(WsError::Protocol(format!(
                "expected CONNECTED, received {other}"
            ))),
        };
    }
}

fn closed(frame: Option<tokio_tungstenite::tungstenite::protocol::CloseFrame>) -> WsError {
    match frame {
        Some(frame) => WsError::ConnectionClosed {
            code: Some(u16::from(frame.code)),
            reason: frame.reason.as_str().to_owned(),
        },
        None => WsError::ConnectionClosed {
            code: None,
            reason: String::new(),
        },
    }
}

/// Cloneable write handle for a running session.
#[derive(Clone, Debug)]
pub struct SessionSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SessionSender {
    /// Writes a frame and resolves once the transport write itself completed.
    pub async fn send(&self, frame: Frame) -> Result<(), WsError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Outbound::Frame(frame, ack))
            .map_err(|_e| session_gone())?;
        done.await.map_err(|_e| session_gone())?
    }
}

fn session_gone() -> WsError {
    WsError::ConnectionClosed {
        code: None,
        reason: "session task has stopped".to_owned(),
    }
}

/// A running STOMP session.
#[derive(Debug)]
pub struct Session {
    sender: SessionSender,
    task: JoinHandle<()>,
}

impl Session {
    #[must_use]
    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    /// Writes `farewell` frames, `DISCONNECT` and a close frame, then stops the task.
    ///
    /// The task is aborted if teardown takes longer than `limit`. The handler's
    /// [`SessionHandler::on_closed`] is not invoked.
    pub async fn close(self, farewell: Vec<Frame>, limit: Duration) -> Result<(), WsError> {
        let (ack, done) = oneshot::channel();
        let result = if self.sender.tx.send(Outbound::Close(farewell, ack)).is_ok() {
            match timeout(limit, done).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(session_gone()),
                Err(_) => Err(WsError::Timeout),
            }
        } else {
            Err(session_gone())
        };

        self.task.abort();
        result
    }
}

async fn run(
    stream: WsStream,
    heartbeat: (Option<Duration>, Option<Duration>),
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    handler: Arc<dyn SessionHandler>,
) {
    let (mut write, mut read) = stream.split();
    let (outgoing, incoming) = heartbeat;
    let mut beat = outgoing.map(|period| interval_at(Instant::now() + period, period));
    let grace = incoming.map(|period| period.saturating_mul(INCOMING_GRACE_FACTOR));
    let mut last_seen = Instant::now();

    let closed_with = loop {
        let deadline = grace.map(|grace| last_seen + grace);

        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        match Frame::parse(&text) {
                            Ok(Some(frame)) => {
                                #[cfg(feature = "tracing")]
                                tracing::trace!(command = %frame.command, "Received STOMP frame");
                                handler.on_frame(frame);
                            }
                            Ok(None) => {}
                            Err(e) => handler.on_invalid_frame(e),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => break Some(closed(frame)),
                    Some(Ok(_)) => {
                        // Pings, pongs and binary frames still prove the peer is alive.
                        last_seen = Instant::now();
                    }
                    Some(Err(e)) => break Some(WsError::Connection(e)),
                    None => break Some(closed(None)),
                }
            }

            cmd = rx.recv() => {
                match cmd {
                    Some(Outbound::Frame(frame, ack)) => {
                        if let Err(e) = write.send(Message::Text(frame.encode().into())).await {
                            _ = ack.send(Err(WsError::ConnectionClosed {
                                code: None,
                                reason: e.to_string(),
                            }));
                            break Some(WsError::Connection(e));
                        }
                        _ = ack.send(Ok(()));
                    }
                    Some(Outbound::Close(farewell, ack)) => {
                        let mut result = Ok(());
                        for frame in farewell.iter().chain(std::iter::once(&Frame::disconnect())) {
                            if let Err(e) = write.send(Message::Text(frame.encode().into())).await {
                                result = Err(WsError::Connection(e));
                                break;
                            }
                        }
                        _ = write.send(Message::Close(None)).await;
                        _ = ack.send(result);
                        break None;
                    }
                    None => {
                        // Every sender is gone, nobody can observe this session anymore.
                        _ = write.send(Message::Close(None)).await;
                        break None;
                    }
                }
            }

            () = tick(beat.as_mut()) => {
                if let Err(e) = write.send(Message::Text("\n".into())).await {
                    break Some(WsError::Connection(e));
                }
            }

            () = expire(deadline) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(?grace, "No heartbeat from broker, dropping session");
                break Some(WsError::Timeout);
            }
        }
    };

    if let Some(error) = closed_with {
        handler.on_closed(error);
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
