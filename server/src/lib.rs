//! # Connection Orchestration Library
//!
//! This library provides the orchestration core of a concurrent network
//! server. It accepts client connections, runs each client on a bounded
//! worker pool, tracks every live client and walks the server through an
//! explicit lifecycle from startup to graceful termination.
//!
//! ## Core Responsibilities
//!
//! ### Connection Admission
//! One accept task per listener hands new connections to the
//! [`ServerDelegate`], which wraps them in a [`Client`]. Admitted clients are
//! registered and posted to the worker pool; rejected ones are dropped.
//!
//! ### Client Supervision
//! A single timer task evicts clients that overstay their phase:
//! - Handshaking clients are bound by the connect timeout
//! - Authenticated clients by the optional session timeout
//! - Closing clients are left alone
//!
//! ### Graceful Shutdown
//! [`Server::stop`] closes the listeners, asks every client to close and
//! waits until all of them have reported back before releasing the thread
//! pools.
//!
//! ## Module Organization
//!
//! ### Lifecycle (`state`, `network`)
//! The forward-only state machine and the [`Server`] that drives it.
//!
//! ### Clients (`client`, `client_list`, `supervision`)
//! The client contract, the shared registry and the supervision timer.
//!
//! ### Transport (`acceptor`, `connection`, `scheduler`)
//! Listeners, accepted byte streams and the named thread pools.
//!
//! ### Authentication (`auth`, `session`)
//! The mechanism registry and the session interfaces handlers bind to.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::acceptor::{ListenerSpec, ServerAcceptors};
//! use server::echo::EchoDelegate;
//! use server::scheduler::Scheduler;
//! use server::Server;
//! use shared::ProtocolConfig;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let acceptors = ServerAcceptors::new(vec![ListenerSpec::Tcp("127.0.0.1:33060".parse()?)]);
//!
//!     let server = Server::new(
//!         Arc::new(ProtocolConfig::default()),
//!         Arc::new(Scheduler::new("accept", 2)?),
//!         Arc::new(Scheduler::new("worker", 8)?),
//!         Arc::new(acceptors),
//!         Arc::new(EchoDelegate::new(64)),
//!     );
//!
//!     server.prepare(None, false, false, false)?;
//!     server.start()?;
//!
//!     // Serve until asked to shut down, then wait for every client
//!     server.stop(false);
//!     Ok(())
//! }
//! ```

pub mod acceptor;
pub mod auth;
pub mod client;
pub mod client_list;
pub mod connection;
pub mod delegate;
pub mod echo;
pub mod error;
pub mod network;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod supervision;

#[cfg(test)]
mod test_support;

pub use client::{Client, ClientPtr};
pub use delegate::{RejectReason, SecurityContext, ServerDelegate};
pub use error::ServerError;
pub use network::Server;
pub use state::State;
