//! Realtime chat session management.
//!
//! One [`ConnectionManager`] per identity holds a STOMP session to the chat broker, subscribed to
//! the identity's direct-message, conversation-update and presence queues plus the shared typing
//! topic. Managers live in a [`Registry`] owned by the application; consumers bind to them through
//! a [`Client`].
//!
//! # Example
//!
//! ```rust, no_run
//! use std::sync::Arc;
//!
//! use realtime_chat::auth::StaticToken;
//! use realtime_chat::chat::{Client, Config, EventHandlers, Registry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(Registry::new(Config::default(), StaticToken::new("jwt")));
//!
//!     let handlers = EventHandlers::new()
//!         .on_message(|message| println!("{}: {}", message.sender_id, message.content))
//!         .on_reconnect_attempt(|attempt| println!("reconnecting, attempt {attempt}"));
//!
//!     let client = Client::new(registry, "user-42", handlers);
//!     client.connect().await?;
//!     client.send_typing_status("conversation-1", true).await?;
//!
//!     client.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod destination;
pub mod handlers;
pub mod registry;
pub mod types;

pub use client::{Client, Snapshot};
pub use config::{Config, Destinations, Endpoint, RetryConfig};
pub use connection::{ConnectionManager, ConnectionState, Subscription};
pub use handlers::{EventHandlers, ListenerId};
pub use registry::Registry;
