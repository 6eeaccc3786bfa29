//! Client handles as seen by the orchestrator
//!
//! The server never owns a client outright. Each accepted connection is
//! wrapped by the delegate into something implementing [`Client`] and shared
//! as a [`ClientPtr`] between the registry and whichever worker task is
//! running it. The last holder to drop it releases the connection.

use shared::{ClientId, ClientState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared handle to a tracked client
pub type ClientPtr = Arc<dyn Client>;

/// One accepted connection, from acceptance until it reports closure
///
/// Implementations must call
/// [`Server::on_client_closed`](crate::Server::on_client_closed) once they
/// have released their resources; until then the server keeps tracking them.
/// `on_auth_timeout` and `on_server_shutdown` only *request* closure and may
/// be called more than once.
pub trait Client: Send + Sync {
    fn id(&self) -> ClientId;

    /// When the connection was accepted
    fn accept_time(&self) -> Instant;

    fn state(&self) -> ClientState;

    /// Whether the connection is currently protected by transport security
    fn is_secure(&self) -> bool;

    /// Processes the connection until it closes; runs on a worker thread
    fn run(&self, skip_name_resolve: bool);

    /// The client exceeded the ceiling for its current phase
    fn on_auth_timeout(&self);

    /// The server is shutting down
    fn on_server_shutdown(&self);
}

/// Hands out monotonically increasing client identities
#[derive(Debug)]
pub struct ClientIdGenerator {
    next: AtomicU64,
}

impl ClientIdGenerator {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    pub fn next(&self) -> ClientId {
        ClientId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ClientIdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}
