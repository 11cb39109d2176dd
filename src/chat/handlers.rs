#![expect(
    clippy::module_name_repetitions,
    reason = "EventHandlers reads better than a bare Handlers at call sites"
)]

use std::fmt;
use std::sync::Arc;

use super::types::{ChatMessage, ConversationUpdate, TypingStatusMessage, UserStatus};
use crate::error::Error;

type Callback<A> = Option<Arc<dyn Fn(A) + Send + Sync>>;
type RefCallback<A> = Option<Arc<dyn for<'a> Fn(&'a A) + Send + Sync>>;

/// Consumer callbacks invoked by a [`super::ConnectionManager`].
///
/// Every slot is optional. Handlers run on the runtime thread that observed the event and never
/// while the manager holds its internal lock, so they may call back into the manager.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub(crate) on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
    pub(crate) on_disconnect: Option<Arc<dyn for<'a> Fn(Option<&'a Error>) + Send + Sync>>,
    pub(crate) on_error: RefCallback<Error>,
    pub(crate) on_message: RefCallback<ChatMessage>,
    pub(crate) on_conversation_update: RefCallback<ConversationUpdate>,
    pub(crate) on_user_status_change: Option<Arc<dyn for<'a> Fn(&'a str, UserStatus) + Send + Sync>>,
    pub(crate) on_typing_status: RefCallback<TypingStatusMessage>,
    pub(crate) on_reconnect_attempt: Callback<u32>,
    pub(crate) on_reconnect_failed: RefCallback<Error>,
}

impl EventHandlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_connect<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// `None` for a consumer-requested disconnect, the cause otherwise.
    #[must_use]
    pub fn on_disconnect<F: Fn(Option<&Error>) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error<F: Fn(&Error) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_message<F: Fn(&ChatMessage) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_conversation_update<F: Fn(&ConversationUpdate) + Send + Sync + 'static>(
        mut self,
        f: F,
    ) -> Self {
        self.on_conversation_update = Some(Arc::new(f));
        self
    }

    /// Receives the peer's identity and new presence.
    #[must_use]
    pub fn on_user_status_change<F: Fn(&str, UserStatus) + Send + Sync + 'static>(
        mut self,
        f: F,
    ) -> Self {
        self.on_user_status_change = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_typing_status<F: Fn(&TypingStatusMessage) + Send + Sync + 'static>(
        mut self,
        f: F,
    ) -> Self {
        self.on_typing_status = Some(Arc::new(f));
        self
    }

    /// Receives the 1-based attempt number when an automatic reconnect is scheduled.
    #[must_use]
    pub fn on_reconnect_attempt<F: Fn(u32) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_reconnect_attempt = Some(Arc::new(f));
        self
    }

    /// Fired once when automatic reconnection gives up.
    #[must_use]
    pub fn on_reconnect_failed<F: Fn(&Error) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_reconnect_failed = Some(Arc::new(f));
        self
    }

    /// Overlays every slot `other` sets onto `self`. Slots `other` leaves empty are kept.
    #[must_use]
    pub fn merge(mut self, other: EventHandlers) -> Self {
        fn overlay<T>(slot: &mut Option<T>, incoming: Option<T>) {
            if incoming.is_some() {
                *slot = incoming;
            }
        }

        overlay(&mut self.on_connect, other.on_connect);
        overlay(&mut self.on_disconnect, other.on_disconnect);
        overlay(&mut self.on_error, other.on_error);
        overlay(&mut self.on_message, other.on_message);
        overlay(&mut self.on_conversation_update, other.on_conversation_update);
        overlay(&mut self.on_user_status_change, other.on_user_status_change);
        overlay(&mut self.on_typing_status, other.on_typing_status);
        overlay(&mut self.on_reconnect_attempt, other.on_reconnect_attempt);
        overlay(&mut self.on_reconnect_failed, other.on_reconnect_failed);
        self
    }

    pub(crate) fn connected(&self) {
        if let Some(f) = &self.on_connect {
            f();
        }
    }

    pub(crate) fn disconnected(&self, cause: Option<&Error>) {
        if let Some(f) = &self.on_disconnect {
            f(cause);
        }
    }

    pub(crate) fn error(&self, error: &Error) {
        if let Some(f) = &self.on_error {
            f(error);
        }
    }

    pub(crate) fn message(&self, message: &ChatMessage) {
        if let Some(f) = &self.on_message {
            f(message);
        }
    }

    pub(crate) fn conversation_update(&self, update: &ConversationUpdate) {
        if let Some(f) = &self.on_conversation_update {
            f(update);
        }
    }

    pub(crate) fn user_status_change(&self, user_id: &str, status: UserStatus) {
        if let Some(f) = &self.on_user_status_change {
            f(user_id, status);
        }
    }

    pub(crate) fn typing_status(&self, typing: &TypingStatusMessage) {
        if let Some(f) = &self.on_typing_status {
            f(typing);
        }
    }

    pub(crate) fn reconnect_attempt(&self, attempt: u32) {
        if let Some(f) = &self.on_reconnect_attempt {
            f(attempt);
        }
    }

    pub(crate) fn reconnect_failed(&self, error: &Error) {
        if let Some(f) = &self.on_reconnect_failed {
            f(error);
        }
    }
}

/// Handle returned by [`super::ConnectionManager::attach`], used to detach the same set later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Every handler set a manager notifies: the merged base set plus one set per attached consumer.
#[derive(Clone, Default)]
pub(crate) struct Listeners {
    pub(crate) base: EventHandlers,
    pub(crate) attached: Vec<(ListenerId, EventHandlers)>,
}

impl Listeners {
    /// Runs `emit` against the base set, then against each attached set in attach order.
    pub(crate) fn each<F: Fn(&EventHandlers)>(&self, emit: F) {
        emit(&self.base);
        for (_, handlers) in &self.attached {
            emit(handlers);
        }
    }

    pub(crate) fn detach(&mut self, id: ListenerId) -> bool {
        let before = self.attached.len();
        self.attached.retain(|(attached, _)| *attached != id);
        self.attached.len() != before
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_conversation_update", &self.on_conversation_update.is_some())
            .field("on_user_status_change", &self.on_user_status_change.is_some())
            .field("on_typing_status", &self.on_typing_status.is_some())
            .field("on_reconnect_attempt", &self.on_reconnect_attempt.is_some())
            .field("on_reconnect_failed", &self.on_reconnect_failed.is_some())
            .finish()
    }
}
