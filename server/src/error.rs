//! Error types surfaced by the orchestrator

use crate::state::State;
use shared::ClientId;
use thiserror::Error;

/// Errors that can occur while preparing, starting or running the server
///
/// Per-client failures never show up here; they close the affected client
/// and are only logged.
#[derive(Debug, Error)]
pub enum ServerError {
    /// An operation was called in a state that does not allow it
    #[error("cannot {operation} while server is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: State,
    },

    #[error("security context rejected: {0}")]
    SecurityContext(String),

    #[error("server was already prepared")]
    AlreadyPrepared,

    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The same client identity was registered twice
    #[error("{0} is already registered")]
    DuplicateClient(ClientId),

    #[error("scheduler {0} is not running")]
    SchedulerStopped(String),
}
