#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{IDENTITY, MockBroker, TOKEN, config, registry, silent_endpoint};
use realtime_chat::chat::{Config, ConnectionManager, ConnectionState, Endpoint, EventHandlers};
use realtime_chat::error::{Error, Kind};
use realtime_chat::ws::frame::Command;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// Consumer-side observations, collected through handler callbacks.
#[derive(Debug)]
enum Event {
    Connected,
    Disconnected(Option<Kind>),
    Error(Kind),
    Message(String),
    Typing(String),
    Presence(String),
    ReconnectAttempt(u32),
    ReconnectFailed,
}

fn recording() -> (EventHandlers, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();

    let on_connect = tx.clone();
    let on_disconnect = tx.clone();
    let on_error = tx.clone();
    let on_message = tx.clone();
    let on_typing = tx.clone();
    let on_presence = tx.clone();
    let on_attempt = tx.clone();
    let on_failed = tx;

    let handlers = EventHandlers::new()
        .on_connect(move || drop(on_connect.send(Event::Connected)))
        .on_disconnect(move |cause: Option<&Error>| {
            drop(on_disconnect.send(Event::Disconnected(cause.map(Error::kind))));
        })
        .on_error(move |e: &Error| drop(on_error.send(Event::Error(e.kind()))))
        .on_message(move |m| drop(on_message.send(Event::Message(m.content.clone()))))
        .on_typing_status(move |t| drop(on_typing.send(Event::Typing(t.user_id.clone()))))
        .on_user_status_change(move |user, status| {
            drop(on_presence.send(Event::Presence(format!("{user}:{status}"))));
        })
        .on_reconnect_attempt(move |n| drop(on_attempt.send(Event::ReconnectAttempt(n))))
        .on_reconnect_failed(move |_| drop(on_failed.send(Event::ReconnectFailed)));

    (handlers, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    timeout(Duration::from_secs(2), rx.wait_for(|state| *state == target))
        .await
        .expect("timed out waiting for state")
        .unwrap();
}

async fn connected_manager(broker: &mut MockBroker) -> (ConnectionManager, mpsc::UnboundedReceiver<Event>) {
    let registry = registry(config(broker));
    let manager = registry.get_or_create(IDENTITY);
    let (handlers, events) = recording();
    manager.set_event_handlers(handlers);

    manager.connect().await.unwrap();

    // CONNECT plus the four SUBSCRIBE frames
    for _ in 0..5 {
        broker.recv_frame().await.unwrap();
    }
    (manager, events)
}

mod connection {
    use super::*;

    #[tokio::test]
    async fn unexpected_handshake_reply_is_retried_as_connection_error() {
        let broker = MockBroker::start().await;
        broker.misreply_next(1);
        let registry = registry(config(&broker));
        let manager = registry.get_or_create(IDENTITY);
        let (handlers, mut events) = recording();
        manager.set_event_handlers(handlers);

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err.kind(), Kind::Connection);
        assert!(err.is_retryable());
        assert!(err.message().contains("RECEIPT"));

        assert!(matches!(next_event(&mut events).await, Event::Error(Kind::Connection)));
        assert!(matches!(next_event(&mut events).await, Event::ReconnectAttempt(1)));
        assert!(matches!(next_event(&mut events).await, Event::Connected));
        assert_eq!(broker.handshakes(), 2);
    }

    #[tokio::test]
    async fn unanswered_upgrade_is_bounded_by_handshake_timeout() {
        let (url, _endpoint) = silent_endpoint().await;
        let mut config = Config::default();
        config.endpoint = Endpoint::with_url(url);
        config.connection.handshake_timeout = Duration::from_millis(200);
        config.connection.reconnect.max_attempts = 0;
        let manager = registry(config).get_or_create(IDENTITY);

        let err = timeout(Duration::from_secs(2), manager.connect())
            .await
            .expect("connect must give up at the handshake deadline")
            .unwrap_err();

        assert_eq!(err.kind(), Kind::Connection);
        assert!(err.is_retryable());
        assert_eq!(manager.connection_status(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn connect_authenticates_and_subscribes_before_connect_event() {
        let mut broker = MockBroker::start().await;
        let registry = registry(config(&broker));
        let manager = registry.get_or_create(IDENTITY);
        let (handlers, mut events) = recording();
        manager.set_event_handlers(handlers);

        manager.connect().await.unwrap();

        let connect = broker.recv_command(Command::Connect).await.unwrap();
        assert_eq!(
            connect.get("Authorization"),
            Some(format!("Bearer {TOKEN}").as_str())
        );
        assert_eq!(connect.get("accept-version"), Some("1.2"));

        let mut destinations = Vec::new();
        for _ in 0..4 {
            let subscribe = broker.recv_frame().await.unwrap();
            assert_eq!(subscribe.command, Command::Subscribe);
            assert_eq!(subscribe.get("ack"), Some("auto"));
            destinations.push(subscribe.get("destination").unwrap().to_owned());
        }
        assert_eq!(
            destinations,
            [
                "/user/u1/queue/messages",
                "/user/u1/queue/conversations",
                "/user/u1/queue/status",
                "/topic/typing",
            ]
        );

        assert!(matches!(next_event(&mut events).await, Event::Connected));
        assert_eq!(manager.connection_status(), ConnectionState::Connected);
        assert_eq!(manager.subscriptions().len(), 4);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_connected() {
        let mut broker = MockBroker::start().await;
        let (manager, mut events) = connected_manager(&mut broker).await;
        assert!(matches!(next_event(&mut events).await, Event::Connected));

        manager.connect().await.unwrap();

        assert!(broker.is_quiet(Duration::from_millis(100)).await);
        assert_eq!(broker.handshakes(), 1);
    }

    #[tokio::test]
    async fn typing_status_is_written_to_typing_destination() {
        let mut broker = MockBroker::start().await;
        let (manager, _events) = connected_manager(&mut broker).await;

        manager.send_typing_status("c1", true).await.unwrap();

        let send = broker.recv_command(Command::Send).await.unwrap();
        assert_eq!(send.get("destination"), Some("/app/chat.typing"));
        assert_eq!(send.get("content-type"), Some("application/json"));

        let body: Value = serde_json::from_str(&send.body).unwrap();
        assert_eq!(body["conversationId"], "c1");
        assert_eq!(body["userId"], IDENTITY);
        assert_eq!(body["status"], "typing");
        assert!(body["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn read_receipts_are_sent_per_message() {
        let mut broker = MockBroker::start().await;
        let (manager, _events) = connected_manager(&mut broker).await;

        manager.send_read_receipt("c1", &["m1", "m2"]).await.unwrap();

        for expected in ["m1", "m2"] {
            let send = broker.recv_command(Command::Send).await.unwrap();
            assert_eq!(send.get("destination"), Some("/app/chat.read"));
            let body: Value = serde_json::from_str(&send.body).unwrap();
            assert_eq!(body["messageId"], expected);
            assert_eq!(body["readerId"], IDENTITY);
            assert_eq!(body["conversationId"], "c1");
            assert!(body["readTimestamp"].is_string());
        }
    }

    #[tokio::test]
    async fn generic_send_uses_default_destination() {
        let mut broker = MockBroker::start().await;
        let (manager, _events) = connected_manager(&mut broker).await;

        manager
            .send(&json!({ "conversationId": "c1", "content": "hello" }))
            .await
            .unwrap();

        let send = broker.recv_command(Command::Send).await.unwrap();
        assert_eq!(send.get("destination"), Some("/app/chat.send"));
        assert_eq!(
            serde_json::from_str::<Value>(&send.body).unwrap(),
            json!({ "conversationId": "c1", "content": "hello" })
        );
    }
}

mod routing {
    use super::*;

    #[tokio::test]
    async fn inbound_events_reach_exactly_one_handler() {
        let mut broker = MockBroker::start().await;
        let (_manager, mut events) = connected_manager(&mut broker).await;
        assert!(matches!(next_event(&mut events).await, Event::Connected));

        broker.publish(
            &json!({
                "type": "NEW_MESSAGE",
                "payload": { "id": 1, "conversationId": "c1", "senderId": "u2", "content": "hi" }
            })
            .to_string(),
        );
        broker.publish(
            &json!({ "type": "TYPING", "conversationId": "c1", "userId": "u2", "status": "typing", "timestamp": 1 })
                .to_string(),
        );
        broker.publish(&json!({ "type": "USER_STATUS", "userId": "u2", "status": "ONLINE" }).to_string());

        assert!(matches!(next_event(&mut events).await, Event::Message(content) if content == "hi"));
        assert!(matches!(next_event(&mut events).await, Event::Typing(user) if user == "u2"));
        assert!(matches!(next_event(&mut events).await, Event::Presence(p) if p == "u2:online"));
    }

    #[tokio::test]
    async fn unknown_type_is_dropped_silently() {
        let mut broker = MockBroker::start().await;
        let (manager, mut events) = connected_manager(&mut broker).await;
        assert!(matches!(next_event(&mut events).await, Event::Connected));

        broker.publish(&json!({ "type": "ORDER_SHIPPED", "payload": {} }).to_string());

        assert!(
            timeout(Duration::from_millis(150), events.recv())
                .await
                .is_err()
        );
        assert_eq!(manager.connection_status(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn malformed_frame_yields_one_subscription_error_and_keeps_session() {
        let mut broker = MockBroker::start().await;
        let (manager, mut events) = connected_manager(&mut broker).await;
        assert!(matches!(next_event(&mut events).await, Event::Connected));

        broker.publish("{not json");
        broker.publish(
            &json!({
                "type": "MESSAGE",
                "payload": { "id": "m2", "conversationId": "c1", "senderId": "u2", "content": "still here" }
            })
            .to_string(),
        );

        assert!(matches!(next_event(&mut events).await, Event::Error(Kind::Subscription)));
        assert!(matches!(next_event(&mut events).await, Event::Message(content) if content == "still here"));
        assert_eq!(manager.connection_status(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn undecodable_stomp_frame_is_a_subscription_error() {
        let mut broker = MockBroker::start().await;
        let (manager, mut events) = connected_manager(&mut broker).await;
        assert!(matches!(next_event(&mut events).await, Event::Connected));

        broker.send_raw("NOT-A-COMMAND\n\n\0");

        assert!(matches!(next_event(&mut events).await, Event::Error(Kind::Subscription)));
        assert_eq!(manager.connection_status(), ConnectionState::Connected);
    }
}

mod reconnection {
    use super::*;

    #[tokio::test]
    async fn abnormal_close_reconnects_and_resubscribes() {
        let mut broker = MockBroker::start().await;
        let (manager, mut events) = connected_manager(&mut broker).await;
        assert!(matches!(next_event(&mut events).await, Event::Connected));
        let mut states = manager.state_receiver();

        broker.drop_all();

        assert!(matches!(
            next_event(&mut events).await,
            Event::Disconnected(Some(Kind::Connection))
        ));
        assert!(matches!(next_event(&mut events).await, Event::Error(Kind::Connection)));
        assert!(matches!(next_event(&mut events).await, Event::ReconnectAttempt(1)));
        assert!(matches!(next_event(&mut events).await, Event::Connected));

        wait_for_state(&mut states, ConnectionState::Connected).await;
        assert_eq!(manager.reconnect_attempts(), 0);
        assert_eq!(manager.subscriptions().len(), 4);
        assert_eq!(broker.handshakes(), 2);

        broker.recv_command(Command::Connect).await.unwrap();
        for _ in 0..4 {
            assert_eq!(broker.recv_frame().await.unwrap().command, Command::Subscribe);
        }
    }

    #[tokio::test]
    async fn exhausted_ceiling_fails_once_and_stops() {
        let broker = MockBroker::start().await;
        broker.reject_all();

        let mut config = config(&broker);
        config.connection.reconnect.max_attempts = 3;
        let registry = registry(config);
        let manager = registry.get_or_create(IDENTITY);
        let (handlers, mut events) = recording();
        manager.set_event_handlers(handlers);
        let mut states = manager.state_receiver();

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err.kind(), Kind::Authentication);
        assert!(err.is_retryable());

        wait_for_state(&mut states, ConnectionState::Failed).await;

        let mut attempts = Vec::new();
        let mut failures = 0;
        while let Ok(Some(event)) = timeout(Duration::from_millis(200), events.recv()).await {
            match event {
                Event::ReconnectAttempt(n) => attempts.push(n),
                Event::ReconnectFailed => failures += 1,
                _ => {}
            }
        }

        assert_eq!(attempts, [1, 2, 3]);
        assert_eq!(failures, 1);
        assert_eq!(broker.handshakes(), 4);
        assert_eq!(manager.reconnect_attempts(), 3);
        assert_eq!(manager.connection_status(), ConnectionState::Failed);

        // Explicit connect leaves Failed and resets the counter
        broker.accept_all();
        manager.connect().await.unwrap();
        assert_eq!(manager.connection_status(), ConnectionState::Connected);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn reconnect_delays_do_not_decrease() {
        let broker = MockBroker::start().await;
        broker.reject_all();

        let mut config = config(&broker);
        config.connection.reconnect.max_attempts = 4;
        config.connection.reconnect.base_delay = Duration::from_millis(10);
        config.connection.reconnect.max_delay = Duration::from_millis(40);
        let registry = registry(config);
        let manager = registry.get_or_create(IDENTITY);
        let mut states = manager.state_receiver();

        let started = tokio::time::Instant::now();
        manager.connect().await.unwrap_err();
        wait_for_state(&mut states, ConnectionState::Failed).await;

        // 10 + 20 + 40 + 40 (capped)
        assert!(started.elapsed() >= Duration::from_millis(110));
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect_timer() {
        let broker = MockBroker::start().await;
        let mut config = config(&broker);
        config.connection.reconnect.base_delay = Duration::from_millis(300);
        config.connection.reconnect.max_delay = Duration::from_millis(300);
        let registry = registry(config);
        let manager = registry.get_or_create(IDENTITY);
        let (handlers, mut events) = recording();
        manager.set_event_handlers(handlers);
        manager.connect().await.unwrap();
        assert!(matches!(next_event(&mut events).await, Event::Connected));

        broker.drop_all();
        assert!(matches!(next_event(&mut events).await, Event::Disconnected(Some(_))));
        assert!(matches!(next_event(&mut events).await, Event::Error(_)));
        assert!(matches!(next_event(&mut events).await, Event::ReconnectAttempt(1)));

        manager.disconnect().await;
        assert!(matches!(next_event(&mut events).await, Event::Disconnected(None)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(broker.handshakes(), 1);
        assert_eq!(manager.connection_status(), ConnectionState::Disconnected);
    }
}

mod teardown {
    use super::*;

    #[tokio::test]
    async fn disconnect_unsubscribes_then_disconnects() {
        let mut broker = MockBroker::start().await;
        let (manager, mut events) = connected_manager(&mut broker).await;
        assert!(matches!(next_event(&mut events).await, Event::Connected));

        manager.disconnect().await;

        for _ in 0..4 {
            assert_eq!(broker.recv_frame().await.unwrap().command, Command::Unsubscribe);
        }
        assert_eq!(broker.recv_frame().await.unwrap().command, Command::Disconnect);

        assert!(matches!(next_event(&mut events).await, Event::Disconnected(None)));
        assert_eq!(manager.connection_status(), ConnectionState::Disconnected);
        assert!(manager.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn send_after_disconnect_fails_without_writing() {
        let mut broker = MockBroker::start().await;
        let (manager, _events) = connected_manager(&mut broker).await;
        manager.disconnect().await;
        broker.recv_command(Command::Disconnect).await.unwrap();

        let err = manager.send_typing_status("c1", false).await.unwrap_err();
        assert_eq!(err.kind(), Kind::Send);
        assert!(err.is_retryable());
        assert!(broker.is_quiet(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn disconnect_after_broker_vanished_still_completes() {
        let broker = MockBroker::start().await;
        let mut config = config(&broker);
        config.connection.reconnect.max_attempts = 0;
        let registry = registry(config);
        let manager = registry.get_or_create(IDENTITY);
        manager.connect().await.unwrap();

        broker.drop_all();
        drop(broker);

        timeout(Duration::from_secs(2), manager.disconnect())
            .await
            .unwrap();
        assert_eq!(manager.connection_status(), ConnectionState::Disconnected);
    }
}

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn disconnect_during_handshake_discards_late_session() {
        let mut broker = MockBroker::start().await;
        broker.delay_connected(Duration::from_millis(300));
        let registry = registry(config(&broker));
        let manager = registry.get_or_create(IDENTITY);
        let (handlers, mut events) = recording();
        manager.set_event_handlers(handlers);

        let connecting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        broker.recv_command(Command::Connect).await.unwrap();
        assert_eq!(manager.connection_status(), ConnectionState::Connecting);

        manager.disconnect().await;
        assert!(matches!(next_event(&mut events).await, Event::Disconnected(None)));

        let err = connecting.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), Kind::Connection);
        assert!(!err.is_retryable());

        // Longer than the reconnect delay cap
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(events.try_recv().is_err(), "late handshake must not emit events");
        assert_eq!(broker.handshakes(), 1);
        assert_eq!(manager.reconnect_attempts(), 0);
        assert_eq!(manager.connection_status(), ConnectionState::Disconnected);
        assert!(manager.subscriptions().is_empty());
    }
}

mod registry {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lookups_share_one_manager() {
        let broker = MockBroker::start().await;
        let registry = registry(config(&broker));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create("shared") })
            })
            .collect();

        let mut managers = Vec::new();
        for handle in handles {
            managers.push(handle.await.unwrap());
        }

        assert!(managers.iter().all(|m| m.ptr_eq(&managers[0])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_closes_the_session() {
        let mut broker = MockBroker::start().await;
        let registry = registry(config(&broker));
        let manager = registry.get_or_create(IDENTITY);
        manager.connect().await.unwrap();

        assert!(registry.remove(IDENTITY).await);

        broker.recv_command(Command::Disconnect).await.unwrap();
        assert_eq!(manager.connection_status(), ConnectionState::Disconnected);
        assert!(registry.is_empty());
    }
}
