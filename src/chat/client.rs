use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::config::RetryConfig;
use super::connection::{ConnectionManager, ConnectionState};
use super::handlers::{EventHandlers, ListenerId};
use super::registry::Registry;
use super::types::UserStatus;
use crate::Result;
use crate::error::{Error, ErrorSummary};

/// Consumer-visible view of a [`Client`].
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub status: ConnectionState,
    /// Most recent classified error, cleared on every successful connect
    pub last_error: Option<ErrorSummary>,
    /// Last known presence per peer identity
    pub presence: HashMap<String, UserStatus>,
}

/// Binds one consumer to the [`ConnectionManager`] of an identity.
///
/// Mirrors the manager's state into a [`Snapshot`] and retries failed consumer-initiated connects
/// with its own bounded backoff. Several clients may bind the same identity: each gets its own
/// handlers and snapshot, and the shared session is torn down when the last of them is disposed
/// or dropped.
///
/// The retry layered here is independent from the manager's automatic reconnection, which keeps
/// handling sessions that drop after they were established.
///
/// Must be created inside a Tokio runtime.
pub struct Client {
    registry: Arc<Registry>,
    manager: ConnectionManager,
    listener: ListenerId,
    snapshot: Arc<watch::Sender<Snapshot>>,
    retry_enabled: Arc<AtomicBool>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    mirror: JoinHandle<()>,
    disposed: bool,
}

impl Client {
    pub fn new(registry: Arc<Registry>, identity: &str, handlers: EventHandlers) -> Self {
        let manager = registry.acquire(identity);
        let (snapshot, _) = watch::channel(Snapshot {
            status: manager.connection_status(),
            ..Snapshot::default()
        });
        let snapshot = Arc::new(snapshot);

        let listener = manager.attach(handlers.clone().merge(tracking(&snapshot, &handlers)));

        let mirror = tokio::spawn(mirror_state(
            manager.state_receiver(),
            Arc::clone(&snapshot),
        ));

        Self {
            registry,
            manager,
            listener,
            snapshot,
            retry_enabled: Arc::new(AtomicBool::new(false)),
            retry_task: Mutex::new(None),
            mirror,
            disposed: false,
        }
    }

    /// Connects the manager.
    ///
    /// A retryable failure is returned to the caller and additionally retried in the background,
    /// up to [`RetryConfig::max_attempts`] times, until [`Client::disconnect`] is called.
    pub async fn connect(&self) -> Result<()> {
        self.retry_enabled.store(true, Ordering::SeqCst);
        self.cancel_retry();

        let result = self.manager.connect().await;
        if let Err(e) = &result {
            self.record_error(e);
            if e.is_retryable() && self.retry_enabled.load(Ordering::SeqCst) {
                let task = tokio::spawn(retry_connect(
                    self.manager.clone(),
                    Arc::clone(&self.retry_enabled),
                    self.registry.config().retry.clone(),
                ));
                *self.retry_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
            }
        }
        result
    }

    /// Stops the retry policy and disconnects the manager.
    pub async fn disconnect(&self) {
        self.retry_enabled.store(false, Ordering::SeqCst);
        self.cancel_retry();
        self.manager.disconnect().await;
    }

    pub async fn send_read_receipt<S: AsRef<str>>(
        &self,
        conversation_id: &str,
        message_ids: &[S],
    ) -> Result<()> {
        let result = self
            .manager
            .send_read_receipt(conversation_id, message_ids)
            .await;
        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    pub async fn send_typing_status(&self, conversation_id: &str, is_typing: bool) -> Result<()> {
        let result = self
            .manager
            .send_typing_status(conversation_id, is_typing)
            .await;
        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    #[must_use]
    pub fn status(&self) -> ConnectionState {
        self.snapshot.borrow().status
    }

    #[must_use]
    pub fn last_error(&self) -> Option<ErrorSummary> {
        self.snapshot.borrow().last_error.clone()
    }

    #[must_use]
    pub fn presence(&self) -> HashMap<String, UserStatus> {
        self.snapshot.borrow().presence.clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver notified on every snapshot change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Releases this client's hold on the manager.
    ///
    /// The last client bound to an identity disconnects the session and removes the registry
    /// entry; otherwise the session stays up for the remaining clients.
    pub async fn dispose(mut self) {
        self.retry_enabled.store(false, Ordering::SeqCst);
        self.cancel_retry();
        self.mirror.abort();
        self.manager.detach(self.listener);
        self.disposed = true;
        self.registry
            .release(self.manager.identity(), &self.manager)
            .await;
    }

    fn cancel_retry(&self) {
        if let Some(task) = self
            .retry_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    fn record_error(&self, error: &Error) {
        let summary = error.summary();
        self.snapshot
            .send_modify(|snapshot| snapshot.last_error = Some(summary));
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.retry_enabled.store(false, Ordering::SeqCst);
        self.cancel_retry();
        self.mirror.abort();
        if self.disposed {
            return;
        }
        self.manager.detach(self.listener);

        match Handle::try_current() {
            Ok(runtime) => {
                let registry = Arc::clone(&self.registry);
                let manager = self.manager.clone();
                runtime.spawn(async move {
                    registry.release(manager.identity(), &manager).await;
                });
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    identity = %self.manager.identity(),
                    "Client dropped outside a runtime, session left to the registry owner"
                );
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("manager", &self.manager)
            .field("snapshot", &*self.snapshot.borrow())
            .finish_non_exhaustive()
    }
}

/// Handlers that keep the snapshot current, each forwarding to the consumer's own slot.
fn tracking(snapshot: &Arc<watch::Sender<Snapshot>>, consumer: &EventHandlers) -> EventHandlers {
    let on_connect = {
        let snapshot = Arc::clone(snapshot);
        let consumer = consumer.clone();
        move || {
            snapshot.send_modify(|s| s.last_error = None);
            consumer.connected();
        }
    };
    let on_error = {
        let snapshot = Arc::clone(snapshot);
        let consumer = consumer.clone();
        move |error: &Error| {
            let summary = error.summary();
            snapshot.send_modify(|s| s.last_error = Some(summary));
            consumer.error(error);
        }
    };
    let on_user_status_change = {
        let snapshot = Arc::clone(snapshot);
        let consumer = consumer.clone();
        move |user_id: &str, status: UserStatus| {
            snapshot.send_modify(|s| {
                s.presence.insert(user_id.to_owned(), status);
            });
            consumer.user_status_change(user_id, status);
        }
    };

    EventHandlers::new()
        .on_connect(on_connect)
        .on_error(on_error)
        .on_user_status_change(on_user_status_change)
}

async fn mirror_state(
    mut state: watch::Receiver<ConnectionState>,
    snapshot: Arc<watch::Sender<Snapshot>>,
) {
    loop {
        let status = *state.borrow_and_update();
        snapshot.send_if_modified(|s| {
            let changed = s.status != status;
            s.status = status;
            changed
        });
        if state.changed().await.is_err() {
            break;
        }
    }
}

async fn retry_connect(manager: ConnectionManager, enabled: Arc<AtomicBool>, policy: RetryConfig) {
    let max_attempts = policy.max_attempts;
    let mut backoff: ExponentialBackoff = policy.into();

    for attempt in 1..=max_attempts {
        let Some(delay) = backoff.next_backoff() else {
            break;
        };
        tokio::time::sleep(delay).await;

        if !enabled.load(Ordering::SeqCst) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(identity = %manager.identity(), attempt, max_attempts, "Retrying connect");
        #[cfg(not(feature = "tracing"))]
        let _ = attempt;

        match manager.connect().await {
            Ok(()) => return,
            Err(e) if !e.is_retryable() => return,
            Err(_e) => {}
        }
    }

    #[cfg(feature = "tracing")]
    tracing::warn!(identity = %manager.identity(), max_attempts, "Connect retries exhausted");
}
