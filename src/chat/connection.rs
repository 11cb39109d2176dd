#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::config::Config;
use super::destination::{IDENTITY_PARAM, endpoint_url, resolve};
use super::handlers::{EventHandlers, ListenerId, Listeners};
use super::types::{
    InboundEvent, OutboundEnvelope, ReadReceiptMessage, TypingStatus, TypingStatusMessage,
    parse_event,
};
use crate::Result;
use crate::auth::TokenProvider;
use crate::error::{Error, Kind};
use crate::ws::frame::{Command, Frame};
use crate::ws::{Handshake, Session, SessionHandler, SessionSender, WsError};

/// Lifecycle state of a [`ConnectionManager`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum_macros::Display)]
pub enum ConnectionState {
    /// No session, and none is being opened
    #[default]
    Disconnected,
    /// Transport open or handshake in flight
    Connecting,
    /// Handshake done and the default subscriptions are active
    Connected,
    /// Consumer-requested teardown in progress
    Disconnecting,
    /// Automatic reconnection gave up; only an explicit `connect()` leaves this state
    Failed,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// An active broker subscription. Only exists while the manager is [`ConnectionState::Connected`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// STOMP subscription id, `sub-<n>`
    pub id: String,
    /// Template the destination was resolved from
    pub template: String,
    pub destination: String,
}

/// Owns the broker session of one identity.
///
/// Runs the connection state machine and the automatic reconnection policy, keeps the default
/// subscriptions alive across reconnects, routes inbound frames to the registered
/// [`EventHandlers`] and exposes the outbound send family.
///
/// Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    identity: String,
    config: Arc<Config>,
    tokens: Arc<dyn TokenProvider>,
    state: watch::Sender<ConnectionState>,
    listeners: RwLock<Listeners>,
    lifecycle: Mutex<Lifecycle>,
    next_listener_id: AtomicU64,
    next_session_id: AtomicU64,
    next_subscription_id: AtomicU64,
}

/// Mutable lifecycle data. The lock is never held across an `.await` or while a handler runs.
#[derive(Default)]
struct Lifecycle {
    attempts: u32,
    should_reconnect: bool,
    /// Set once the registry let go of this manager; it never opens a session again.
    retired: bool,
    /// Bumped by `disconnect()`; handshakes started under an older epoch are discarded.
    epoch: u64,
    timer_seq: u64,
    reconnect_timer: Option<(u64, JoinHandle<()>)>,
    session: Option<ActiveSession>,
    subscriptions: Vec<Subscription>,
}

struct ActiveSession {
    id: u64,
    session: Session,
}

/// Outcome of a reconnection decision, reported to handlers once the lock is released.
enum Retry {
    Scheduled { attempt: u32, delay: Duration },
    Exhausted(Error),
    Off,
}

impl ConnectionManager {
    #[must_use]
    pub fn new<S: Into<String>>(
        identity: S,
        config: Arc<Config>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                identity: identity.into(),
                config,
                tokens,
                state,
                listeners: RwLock::new(Listeners::default()),
                lifecycle: Mutex::new(Lifecycle::default()),
                next_listener_id: AtomicU64::new(0),
                next_session_id: AtomicU64::new(0),
                next_subscription_id: AtomicU64::new(0),
            }),
        }
    }

    /// Opens the session, subscribes to the identity's default destinations and fires the connect
    /// event.
    ///
    /// Returns immediately when already connecting or connected. An explicit call resets the
    /// reconnection counter and leaves [`ConnectionState::Failed`]. On failure the error is also
    /// emitted to the error handler and an automatic reconnect is scheduled.
    ///
    /// A manager released from its [`super::Registry`] refuses to connect with a non-retryable
    /// error; ask the registry for the current manager instead.
    pub async fn connect(&self) -> Result<()> {
        let epoch = {
            let mut lifecycle = self.inner.lock();
            if lifecycle.retired {
                return Err(Error::connection(format!(
                    "manager for {} was released from the registry",
                    self.inner.identity
                ))
                .retryable(false));
            }
            if matches!(
                self.connection_status(),
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                return Ok(());
            }

            lifecycle.attempts = 0;
            lifecycle.should_reconnect = true;
            if let Some((_, timer)) = lifecycle.reconnect_timer.take() {
                timer.abort();
            }
            self.inner.set_state(ConnectionState::Connecting);
            lifecycle.epoch
        };

        Arc::clone(&self.inner).establish(epoch).await
    }

    /// Unsubscribes, closes the session and settles in [`ConnectionState::Disconnected`].
    ///
    /// Cancels any pending reconnect and disables automatic reconnection until the next
    /// `connect()`. Teardown failures are logged, never returned. The disconnect event always fires.
    pub async fn disconnect(&self) {
        let (active, subscriptions) = {
            let mut lifecycle = self.inner.lock();
            lifecycle.should_reconnect = false;
            lifecycle.epoch = lifecycle.epoch.wrapping_add(1);
            if let Some((_, timer)) = lifecycle.reconnect_timer.take() {
                timer.abort();
            }
            self.inner.set_state(ConnectionState::Disconnecting);
            (
                lifecycle.session.take(),
                std::mem::take(&mut lifecycle.subscriptions),
            )
        };

        if let Some(active) = active {
            let farewell = subscriptions
                .iter()
                .map(|subscription| Frame::unsubscribe(&subscription.id))
                .collect();
            let limit = self.inner.config.connection.close_timeout;
            if let Err(e) = active.session.close(farewell, limit).await {
                #[cfg(feature = "tracing")]
                tracing::warn!(identity = %self.inner.identity, error = %e, "Teardown failed, session dropped");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }

        {
            let _lifecycle = self.inner.lock();
            // A connect() issued during teardown owns the state now.
            if self.connection_status() == ConnectionState::Disconnecting {
                self.inner.set_state(ConnectionState::Disconnected);
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(identity = %self.inner.identity, "Disconnected");

        self.inner.listeners().each(|h| h.disconnected(None));
    }

    /// Serializes `payload` and writes it to the generic outbound destination.
    ///
    /// Fails fast with a retryable [`Kind::Send`] error when not connected; nothing is queued.
    /// Completes once the transport write finished. No broker acknowledgment is awaited.
    pub async fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let template = &self.inner.config.destinations.send_message;
        self.inner.write(template, payload).await
    }

    /// Confirms that the identity has read `message_ids`, one frame per message.
    pub async fn send_read_receipt<S: AsRef<str>>(
        &self,
        conversation_id: &str,
        message_ids: &[S],
    ) -> Result<()> {
        self.inner.sender()?;

        let template = &self.inner.config.destinations.send_read_receipt;
        for message_id in message_ids {
            let receipt = ReadReceiptMessage::builder()
                .message_id(message_id.as_ref())
                .conversation_id(conversation_id)
                .reader_id(self.inner.identity.as_str())
                .build();
            self.inner.write(template, &receipt).await?;
        }
        Ok(())
    }

    /// Publishes whether the identity is typing in `conversation_id`.
    pub async fn send_typing_status(&self, conversation_id: &str, is_typing: bool) -> Result<()> {
        let typing = TypingStatusMessage::builder()
            .conversation_id(conversation_id)
            .user_id(self.inner.identity.as_str())
            .status(TypingStatus::from(is_typing))
            .build();
        let template = &self.inner.config.destinations.send_typing_status;
        self.inner.write(template, &typing).await
    }

    /// Overlays `handlers` onto the base set; slots `handlers` leaves empty are kept.
    pub fn set_event_handlers(&self, handlers: EventHandlers) {
        let mut listeners = self.inner.write_listeners();
        listeners.base = std::mem::take(&mut listeners.base).merge(handlers);
    }

    /// Registers an independent handler set notified alongside the base set and every other
    /// attached set. Nothing is overwritten, so several consumers can share one manager.
    pub fn attach(&self, handlers: EventHandlers) -> ListenerId {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.inner.write_listeners().attached.push((id, handlers));
        id
    }

    /// Removes a set registered with [`ConnectionManager::attach`]. Returns whether it was present.
    pub fn detach(&self, id: ListenerId) -> bool {
        self.inner.write_listeners().detach(id)
    }

    #[must_use]
    pub fn connection_status(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// A receiver observing every state transition.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of the active subscriptions; empty unless connected.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.lock().subscriptions.clone()
    }

    /// Automatic reconnect attempts scheduled since the last successful handshake.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Whether both handles drive the same session.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Disables the manager for good: cancels any pending reconnect and makes `connect()` fail.
    pub(crate) fn retire(&self) {
        let mut lifecycle = self.inner.lock();
        lifecycle.retired = true;
        lifecycle.should_reconnect = false;
        if let Some((_, timer)) = lifecycle.reconnect_timer.take() {
            timer.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn listeners(&self) -> Listeners {
        self.inner.listeners()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("identity", &self.inner.identity)
            .field("state", &self.connection_status())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> Listeners {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write_listeners(&self) -> RwLockWriteGuard<'_, Listeners> {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            #[cfg(feature = "tracing")]
            tracing::debug!(identity = %self.identity, from = %previous, to = %state, "Connection state changed");
        }
    }

    /// Runs one connection attempt that was started under `epoch`.
    async fn establish(self: Arc<Self>, epoch: u64) -> Result<()> {
        let mut pending = PendingAttempt {
            inner: &self,
            epoch,
            settled: false,
        };
        let result = self.open_session(epoch).await;
        pending.settled = true;

        if let Err(e) = &result {
            self.attempt_failed(epoch, e);
        }
        result
    }

    async fn open_session(self: &Arc<Self>, epoch: u64) -> Result<()> {
        let url = endpoint_url(&self.config.endpoint, &self.identity)?;
        let mut handshake =
            Handshake::open(&url, self.tokens.as_ref(), &self.config.connection).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(identity = %self.identity, server = ?handshake.server(), "Handshake complete");

        let subscriptions = self.plan_subscriptions();
        for subscription in &subscriptions {
            let frame = Frame::subscribe(&subscription.id, &subscription.destination);
            if let Err(e) = handshake.send(&frame).await {
                handshake.abandon().await;
                return Err(e.into());
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(identity = %self.identity, id = %subscription.id, destination = %subscription.destination, "Subscribed");
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let events = Arc::new(SessionEvents {
            inner: Arc::downgrade(self),
            session_id,
        });

        let stale = {
            let mut lifecycle = self.lock();
            if lifecycle.epoch == epoch {
                lifecycle.session = Some(ActiveSession {
                    id: session_id,
                    session: handshake.spawn(events),
                });
                lifecycle.subscriptions = subscriptions;
                lifecycle.attempts = 0;
                self.set_state(ConnectionState::Connected);
                None
            } else {
                Some(handshake)
            }
        };

        if let Some(handshake) = stale {
            #[cfg(feature = "tracing")]
            tracing::debug!(identity = %self.identity, "Disconnected during handshake, closing new session");
            handshake.abandon().await;
            return Err(
                Error::connection("connection attempt superseded by disconnect").retryable(false),
            );
        }

        self.listeners().each(EventHandlers::connected);
        Ok(())
    }

    fn plan_subscriptions(&self) -> Vec<Subscription> {
        self.config
            .destinations
            .subscriptions()
            .into_iter()
            .map(|template| {
                let n = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
                Subscription {
                    id: format!("sub-{n}"),
                    template: template.to_owned(),
                    destination: resolve(template, &[(IDENTITY_PARAM, &self.identity)]),
                }
            })
            .collect()
    }

    fn attempt_failed(self: &Arc<Self>, epoch: u64, error: &Error) {
        let retry = {
            let mut lifecycle = self.lock();
            if lifecycle.epoch != epoch {
                return;
            }
            self.set_state(ConnectionState::Disconnected);
            self.schedule_reconnect(&mut lifecycle)
        };

        #[cfg(feature = "tracing")]
        tracing::warn!(identity = %self.identity, error = %error, "Connection attempt failed");

        let listeners = self.listeners();
        listeners.each(|h| h.error(error));
        report(&listeners, retry);
    }

    /// Decides what follows an unexpected failure. Must be called with the lifecycle lock held.
    fn schedule_reconnect(self: &Arc<Self>, lifecycle: &mut Lifecycle) -> Retry {
        if !lifecycle.should_reconnect {
            return Retry::Off;
        }
        if let Some((_, timer)) = lifecycle.reconnect_timer.take() {
            timer.abort();
        }

        let policy = &self.config.connection.reconnect;
        if lifecycle.attempts >= policy.max_attempts {
            lifecycle.should_reconnect = false;
            self.set_state(ConnectionState::Failed);
            return Retry::Exhausted(Error::reconnect_failed(lifecycle.attempts));
        }

        lifecycle.attempts += 1;
        let delay = policy.delay_for(lifecycle.attempts);
        lifecycle.timer_seq = lifecycle.timer_seq.wrapping_add(1);
        let timer_id = lifecycle.timer_seq;

        let inner = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.reconnect(timer_id).await;
            }
        });
        lifecycle.reconnect_timer = Some((timer_id, timer));

        Retry::Scheduled {
            attempt: lifecycle.attempts,
            delay,
        }
    }

    /// Timer body: reconnects unless the timer was superseded or reconnection was disabled.
    async fn reconnect(self: Arc<Self>, timer_id: u64) {
        let epoch = {
            let mut lifecycle = self.lock();
            if !matches!(&lifecycle.reconnect_timer, Some((id, _)) if *id == timer_id) {
                return;
            }
            lifecycle.reconnect_timer = None;

            let state = *self.state.borrow();
            if !lifecycle.should_reconnect
                || lifecycle.retired
                || matches!(
                    state,
                    ConnectionState::Connecting | ConnectionState::Connected
                )
            {
                return;
            }
            self.set_state(ConnectionState::Connecting);
            lifecycle.epoch
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(identity = %self.identity, "Reconnecting");

        // Failures were already reported and rescheduled by establish
        _ = self.establish(epoch).await;
    }

    fn sender(&self) -> Result<SessionSender> {
        let lifecycle = self.lock();
        match &lifecycle.session {
            Some(active) if self.state.borrow().is_connected() => Ok(active.session.sender()),
            _ => Err(Error::not_connected()),
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, template: &str, payload: &T) -> Result<()> {
        let sender = self.sender()?;

        let destination = resolve(template, &[(IDENTITY_PARAM, &self.identity)]);
        let envelope = OutboundEnvelope::new(&destination, payload)?;

        #[cfg(feature = "tracing")]
        tracing::trace!(identity = %self.identity, destination = %envelope.destination, "Sending frame");

        sender
            .send(Frame::send(&envelope.destination, envelope.body))
            .await
            .map_err(|e| Error::with_source(Kind::Send, e))
    }

    fn session_closed(self: &Arc<Self>, session_id: u64, error: WsError) {
        let retry = {
            let mut lifecycle = self.lock();
            if !matches!(&lifecycle.session, Some(active) if active.id == session_id) {
                return;
            }
            lifecycle.session = None;
            lifecycle.subscriptions.clear();
            self.set_state(ConnectionState::Disconnected);
            self.schedule_reconnect(&mut lifecycle)
        };

        let error = Error::from(error);

        #[cfg(feature = "tracing")]
        tracing::warn!(identity = %self.identity, error = %error, "Session closed unexpectedly");

        let listeners = self.listeners();
        listeners.each(|h| h.disconnected(Some(&error)));
        listeners.each(|h| h.error(&error));
        report(&listeners, retry);
    }

    fn route(&self, frame: &Frame) {
        match frame.command {
            Command::Message => match parse_event(&frame.body) {
                Ok(Some(event)) => self.dispatch(event),
                Ok(None) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        identity = %self.identity,
                        destination = ?frame.get("destination"),
                        "Dropping inbound message of unhandled type"
                    );
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(identity = %self.identity, error = %e, "Unable to route inbound message");
                    let error = Error::from(e);
                    self.listeners().each(|h| h.error(&error));
                }
            },
            Command::Error => {
                let error = Error::connection(frame.error_message());
                #[cfg(feature = "tracing")]
                tracing::warn!(identity = %self.identity, error = %error, "Broker reported an error");
                self.listeners().each(|h| h.error(&error));
            }
            Command::Receipt => {
                #[cfg(feature = "tracing")]
                tracing::trace!(identity = %self.identity, receipt = ?frame.get("receipt-id"), "Receipt");
            }
            _ => {
                #[cfg(feature = "tracing")]
                tracing::trace!(identity = %self.identity, command = %frame.command, "Ignoring frame");
            }
        }
    }

    fn dispatch(&self, event: InboundEvent) {
        let listeners = self.listeners();
        match event {
            InboundEvent::Message(message) => listeners.each(|h| h.message(&message)),
            InboundEvent::ConversationUpdate(update) => {
                listeners.each(|h| h.conversation_update(&update));
            }
            InboundEvent::TypingStatus(typing) => listeners.each(|h| h.typing_status(&typing)),
            InboundEvent::UserStatus(change) => {
                listeners.each(|h| h.user_status_change(&change.user_id, change.status));
            }
        }
    }
}

fn report(listeners: &Listeners, retry: Retry) {
    match retry {
        Retry::Scheduled { attempt, delay } => {
            #[cfg(feature = "tracing")]
            tracing::debug!(attempt, ?delay, "Reconnect scheduled");
            #[cfg(not(feature = "tracing"))]
            let _ = &delay;
            listeners.each(|h| h.reconnect_attempt(attempt));
        }
        Retry::Exhausted(error) => {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %error, "Giving up on automatic reconnection");
            listeners.each(|h| h.error(&error));
            listeners.each(|h| h.reconnect_failed(&error));
        }
        Retry::Off => {}
    }
}

/// Resets a stuck [`ConnectionState::Connecting`] when a connection attempt is dropped mid-flight.
struct PendingAttempt<'a> {
    inner: &'a Inner,
    epoch: u64,
    settled: bool,
}

impl Drop for PendingAttempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let lifecycle = self.inner.lock();
        if lifecycle.epoch == self.epoch
            && *self.inner.state.borrow() == ConnectionState::Connecting
        {
            self.inner.set_state(ConnectionState::Disconnected);
        }
    }
}

/// Bridges session I/O events back to the manager that owns the session.
struct SessionEvents {
    inner: Weak<Inner>,
    session_id: u64,
}

impl SessionHandler for SessionEvents {
    fn on_frame(&self, frame: Frame) {
        if let Some(inner) = self.inner.upgrade() {
            inner.route(&frame);
        }
    }

    fn on_invalid_frame(&self, error: WsError) {
        if let Some(inner) = self.inner.upgrade() {
            #[cfg(feature = "tracing")]
            tracing::warn!(identity = %inner.identity, error = %error, "Dropping unparseable frame");
            let error = Error::from(error);
            inner.listeners().each(|h| h.error(&error));
        }
    }

    fn on_closed(&self, error: WsError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.session_closed(self.session_id, error);
        }
    }
}
