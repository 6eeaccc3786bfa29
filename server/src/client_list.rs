//! Registry of live clients
//!
//! Every accepted client is tracked here from the moment the accept loop
//! hands it to the worker pool until it reports closure. The registry:
//! - Rejects a second registration of the same identity
//! - Tolerates repeated removal of the same client
//! - Lets callbacks remove clients while they are being visited
//! - Wakes threads blocked in [`ClientList::wait_until_empty`] when it drains

use crate::client::ClientPtr;
use crate::error::ServerError;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use shared::ClientId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Thread-safe collection of live clients keyed by identity
#[derive(Default)]
pub struct ClientList {
    clients: Mutex<HashMap<ClientId, ClientPtr>>,
    drained: Condvar,
}

impl ClientList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a client
    ///
    /// Registering an identity twice is a programming error and is reported
    /// as [`ServerError::DuplicateClient`]; the registry is left unchanged.
    pub fn add(&self, client: ClientPtr) -> Result<(), ServerError> {
        let id = client.id();
        let mut clients = self.clients.lock();
        if clients.contains_key(&id) {
            return Err(ServerError::DuplicateClient(id));
        }
        clients.insert(id, client);
        info!("{} registered ({} active)", id, clients.len());
        Ok(())
    }

    /// Stops tracking a client
    ///
    /// Returns false if the client was already gone.
    pub fn remove(&self, id: ClientId) -> bool {
        let mut clients = self.clients.lock();
        let removed = clients.remove(&id).is_some();
        if removed {
            info!("{} removed ({} active)", id, clients.len());
            if clients.is_empty() {
                self.drained.notify_all();
            }
        } else {
            debug!("{} was already removed", id);
        }
        removed
    }

    pub fn get(&self, id: ClientId) -> Option<ClientPtr> {
        self.clients.lock().get(&id).cloned()
    }

    /// Copies the current set of clients out of the lock
    pub fn snapshot(&self) -> Vec<ClientPtr> {
        self.clients.lock().values().cloned().collect()
    }

    /// Applies `callback` to every client present when the call started
    ///
    /// The callback runs outside the lock, so it may add or remove clients,
    /// including the one being visited.
    pub fn for_each<F>(&self, mut callback: F)
    where
        F: FnMut(&ClientPtr),
    {
        for client in self.snapshot() {
            callback(&client);
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    /// Blocks until no clients remain or `timeout` elapses
    ///
    /// Returns true if the registry is empty.
    pub fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut clients = self.clients.lock();
        while !clients.is_empty() {
            if self.drained.wait_until(&mut clients, deadline).timed_out() {
                return clients.is_empty();
            }
        }
        true
    }
}
