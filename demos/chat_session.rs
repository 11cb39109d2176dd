//! Connects one identity to a chat broker and logs everything it receives.
//!
//! The endpoint comes from the environment, see `Endpoint::from_env`. The bearer token is read
//! from `REALTIME_CHAT_TOKEN` on every handshake, so rotating it takes effect on the next
//! reconnect.
//!
//! ```sh
//! REALTIME_CHAT_HOST=localhost:8080 REALTIME_CHAT_TOKEN=... \
//!     RUST_LOG=info,realtime_chat=debug cargo run --example chat_session -- user-42
//! ```

use std::sync::Arc;
use std::time::Duration;

use realtime_chat::auth::SecretString;
use realtime_chat::chat::{Client, Config, Endpoint, EventHandlers, Registry};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let identity = std::env::args().nth(1).unwrap_or_else(|| "demo-user".to_owned());

    let mut config = Config::default();
    config.endpoint = Endpoint::from_env();

    let tokens = || std::env::var("REALTIME_CHAT_TOKEN").ok().map(SecretString::from);
    let registry = Arc::new(Registry::new(config, tokens));

    let handlers = EventHandlers::new()
        .on_connect(|| info!("connected"))
        .on_disconnect(|cause| info!(cause = ?cause.map(ToString::to_string), "disconnected"))
        .on_error(|e| warn!(kind = %e.kind(), retryable = e.is_retryable(), error = %e))
        .on_message(|m| info!(conversation = %m.conversation_id, from = %m.sender_id, content = %m.content))
        .on_conversation_update(|u| info!(conversation = %u.conversation_id, unread = ?u.unread_count))
        .on_typing_status(|t| info!(conversation = %t.conversation_id, user = %t.user_id, status = %t.status))
        .on_user_status_change(|user, status| info!(%user, %status, "presence"))
        .on_reconnect_attempt(|attempt| info!(attempt, "reconnecting"))
        .on_reconnect_failed(|e| warn!(error = %e, "giving up"));

    let client = Client::new(registry, &identity, handlers);
    if let Err(e) = client.connect().await {
        warn!(error = %e, "initial connect failed, retrying in the background");
    }

    let mut snapshots = client.watch();
    let session = async {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            info!(status = %snapshot.status, peers = snapshot.presence.len());
        }
    };

    tokio::select! {
        () = session => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
        () = tokio::time::sleep(Duration::from_secs(300)) => info!("demo time limit reached"),
    }

    client.dispose().await;
    Ok(())
}
