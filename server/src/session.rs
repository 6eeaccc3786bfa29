//! Session-side collaborator interfaces
//!
//! What a session does once created is up to the delegate; the server only
//! needs enough of it to bind authentication handlers.

use crate::client::ClientPtr;
use std::io;
use std::sync::Arc;

/// Shared handle to a session
pub type SessionPtr = Arc<dyn Session>;

/// Domain-level conversation built on top of a client
pub trait Session: Send + Sync {
    fn session_id(&self) -> u32;

    /// Client the session runs on
    fn client(&self) -> ClientPtr;
}

/// Outbound half of the wire protocol, owned by the protocol layer
pub trait ProtocolEncoder: Send + Sync {
    fn send_message(&self, message_type: u8, payload: &[u8]) -> io::Result<()>;
}
