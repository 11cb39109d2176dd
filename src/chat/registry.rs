use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;

use super::config::Config;
use super::connection::ConnectionManager;
use crate::auth::TokenProvider;

/// Identity → [`ConnectionManager`] table owned by the application.
///
/// Holds at most one manager per identity. Creation is atomic per identity, so concurrent lookups
/// always observe the same manager.
///
/// Each entry counts the [`super::Client`]s bound to it. The session is torn down when the last
/// one releases it, never while a sibling still uses the manager. A manager that leaves the table
/// is retired and refuses to connect, so an identity never ends up with two live sessions.
pub struct Registry {
    config: Arc<Config>,
    tokens: Arc<dyn TokenProvider>,
    managers: DashMap<String, Slot>,
}

struct Slot {
    manager: ConnectionManager,
    /// Clients currently bound through [`Registry::acquire`]
    holders: usize,
}

impl Registry {
    #[must_use]
    pub fn new<T: TokenProvider>(config: Config, tokens: T) -> Self {
        Self::with_shared_provider(config, Arc::new(tokens))
    }

    #[must_use]
    pub fn with_shared_provider(config: Config, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            config: Arc::new(config),
            tokens,
            managers: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the manager for `identity`, creating it on first use.
    pub fn get_or_create(&self, identity: &str) -> ConnectionManager {
        self.slot(identity).manager.clone()
    }

    /// Like [`Registry::get_or_create`], and records one more holder of the manager.
    ///
    /// Every call must be paired with a [`Registry::release`].
    pub fn acquire(&self, identity: &str) -> ConnectionManager {
        let mut slot = self.slot(identity);
        slot.holders += 1;
        slot.manager.clone()
    }

    /// Drops one hold on `manager`. The last holder disconnects the session and removes the entry.
    ///
    /// Does nothing when `identity` now maps to a different manager, so a stale holder never tears
    /// down a newer session. Returns whether the entry was removed.
    pub async fn release(&self, identity: &str, manager: &ConnectionManager) -> bool {
        let last = match self.managers.entry(identity.to_owned()) {
            Entry::Occupied(mut occupied) if occupied.get().manager.ptr_eq(manager) => {
                let remaining = {
                    let slot = occupied.get_mut();
                    slot.holders = slot.holders.saturating_sub(1);
                    slot.holders
                };
                (remaining == 0).then(|| occupied.remove().manager)
            }
            Entry::Occupied(_) | Entry::Vacant(_) => None,
        };

        let Some(manager) = last else {
            return false;
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(identity, "Last holder released connection manager");

        manager.retire();
        manager.disconnect().await;
        true
    }

    #[must_use]
    pub fn get(&self, identity: &str) -> Option<ConnectionManager> {
        self.managers.get(identity).map(|slot| slot.manager.clone())
    }

    /// Number of clients currently holding the manager for `identity`.
    #[must_use]
    pub fn holders(&self, identity: &str) -> usize {
        self.managers.get(identity).map_or(0, |slot| slot.holders)
    }

    /// Disconnects and forgets the manager for `identity`, whoever holds it. Returns whether one
    /// existed.
    ///
    /// The removed manager is retired: clients still bound to it get a non-retryable error from
    /// `connect()`.
    pub async fn remove(&self, identity: &str) -> bool {
        // The shard lock is released before the await below
        let Some((_, slot)) = self.managers.remove(identity) else {
            return false;
        };
        slot.manager.retire();
        slot.manager.disconnect().await;
        true
    }

    fn slot(&self, identity: &str) -> dashmap::mapref::one::RefMut<'_, String, Slot> {
        self.managers.entry(identity.to_owned()).or_insert_with(|| {
            #[cfg(feature = "tracing")]
            tracing::debug!(identity, "Creating connection manager");

            Slot {
                manager: ConnectionManager::new(
                    identity,
                    Arc::clone(&self.config),
                    Arc::clone(&self.tokens),
                ),
                holders: 0,
            }
        })
    }

    /// Disconnects every manager and empties the registry.
    pub async fn disconnect_all(&self) {
        let identities: Vec<String> = self
            .managers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let managers: Vec<ConnectionManager> = identities
            .iter()
            .filter_map(|identity| self.managers.remove(identity).map(|(_, slot)| slot.manager))
            .collect();

        for manager in &managers {
            manager.retire();
        }
        join_all(managers.iter().map(ConnectionManager::disconnect)).await;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.managers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("managers", &self.managers.len())
            .finish_non_exhaustive()
    }
}
