//! Policy hooks supplied by the embedding application

use crate::client::{Client, ClientPtr};
use crate::connection::Connection;
use crate::network::Server;
use crate::session::{ProtocolEncoder, SessionPtr};
use std::sync::Arc;

/// Why an accepted connection was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TooManyConnections,
}

/// Builds clients and sessions on behalf of the server
///
/// The server only sequences admission, supervision and teardown; everything
/// a client or session actually does is decided here.
pub trait ServerDelegate: Send + Sync {
    /// Wraps a freshly accepted connection in a client object
    fn create_client(&self, server: &Arc<Server>, connection: Box<dyn Connection>) -> ClientPtr;

    fn will_accept_client(&self, _client: &ClientPtr) -> bool {
        true
    }

    fn did_accept_client(&self, _client: &ClientPtr) {}

    fn did_reject_client(&self, _reason: RejectReason) {}

    /// Builds the session for an admitted client; `None` refuses it
    fn create_session(
        &self,
        client: &ClientPtr,
        encoder: Arc<dyn ProtocolEncoder>,
        session_id: u32,
    ) -> Option<SessionPtr>;

    /// The client released its resources and is about to be forgotten
    fn on_client_closed(&self, _client: &dyn Client) {}

    /// Lets the host application force the server into shutdown
    fn is_terminating(&self) -> bool {
        false
    }
}

/// Transport security settings installed during `prepare`
///
/// The handshake itself belongs to the connection layer; the server only
/// checks the context is usable and hands it out read-only.
pub trait SecurityContext: Send + Sync {
    fn validate(&self) -> Result<(), String>;

    /// Whether clients may upgrade to an encrypted transport
    fn has_ssl(&self) -> bool;
}
