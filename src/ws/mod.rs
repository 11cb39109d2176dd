//! STOMP-over-WebSocket session infrastructure.
//!
//! This module knows nothing about chat. It opens a transport, negotiates the STOMP handshake with
//! a bearer credential, keeps heartbeats flowing and reports frames and closures to a
//! [`SessionHandler`]. The connection state machine and reconnection policy live in
//! [`crate::chat::ConnectionManager`].
//!
//! # Architecture
//!
//! - [`Handshake`]: an open, authenticated transport before its I/O task starts
//! - [`Session`]: the running I/O task plus a cloneable [`SessionSender`]
//! - [`frame::Frame`]: STOMP 1.2 codec
//!
//! # Example
//!
//! ```ignore
//! let mut handshake = Handshake::open(&url, &tokens, &config).await?;
//! handshake.send(&Frame::subscribe("sub-0", "/topic/typing")).await?;
//! let session = handshake.spawn(Arc::new(MyHandler));
//! session.sender().send(Frame::send("/app/chat.send", body)).await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod traits;

pub use connection::{Handshake, Session, SessionSender};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
