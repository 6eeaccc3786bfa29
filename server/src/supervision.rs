//! Client supervision timer
//!
//! One async task per server walks the registry and asks clients that have
//! overstayed their phase ceiling to close. Handshaking clients are bound by
//! the connect timeout, authenticated ones by the optional session timeout.
//! The task sleeps until the nearest deadline and parks entirely while no
//! client needs supervision; [`SupervisionTimer::rearm`] wakes it again.

use crate::client::ClientPtr;
use crate::network::Server;
use log::{debug, info};
use shared::{ClientId, ClientState, ProtocolConfig};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Wake-up handle shared between the server and its supervision task
#[derive(Default)]
pub struct SupervisionTimer {
    armed: AtomicBool,
    wake: Notify,
}

impl SupervisionTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a supervision pass is already scheduled
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Schedules a pass unless one is already pending
    pub fn rearm(&self) {
        if !self.armed.swap(true, Ordering::SeqCst) {
            self.wake.notify_one();
        }
    }

    /// Forces an immediate pass, used on shutdown and client closure
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_armed(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    async fn sleep(&self, delay: Option<Duration>) {
        match delay {
            Some(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.wake.notified() => {}
                }
            }
            None => self.wake.notified().await,
        }
    }
}

/// Ceiling for a client in `state`, or `None` if it is not supervised
fn ceiling_for(state: ClientState, config: &ProtocolConfig) -> Option<Duration> {
    match state {
        ClientState::Accepted | ClientState::Authenticating => Some(config.connect_timeout()),
        ClientState::Running => config.session_timeout(),
        ClientState::Closing | ClientState::Closed => None,
    }
}

/// Runs one supervision pass over `clients`
///
/// Clients past their ceiling get `on_auth_timeout` once; their ids go into
/// `flagged` so later passes leave them alone until they close. Returns the
/// smallest remaining slack among supervised clients. For handshaking
/// clients that slack also covers a shorter session ceiling still ahead.
pub fn check_clients(
    clients: &[ClientPtr],
    config: &ProtocolConfig,
    flagged: &mut HashSet<ClientId>,
    now: Instant,
) -> Option<Duration> {
    let live: HashSet<ClientId> = clients.iter().map(|client| client.id()).collect();
    flagged.retain(|id| live.contains(id));

    let mut next: Option<Duration> = None;
    for client in clients {
        let state = client.state();
        let Some(ceiling) = ceiling_for(state, config) else {
            continue;
        };

        let age = now.saturating_duration_since(client.accept_time());
        if age >= ceiling {
            if flagged.insert(client.id()) {
                info!(
                    "{} timed out after {:?} in state {:?}",
                    client.id(),
                    age,
                    state
                );
                client.on_auth_timeout();
            }
            continue;
        }

        // A handshaking client may reach a shorter session ceiling before
        // the next pass, as phase changes do not re-arm the timer
        let mut slack = ceiling - age;
        if state.is_handshaking() {
            if let Some(session) = config.session_timeout().filter(|session| *session > age) {
                slack = slack.min(session - age);
            }
        }
        next = Some(next.map_or(slack, |current| current.min(slack)));
    }
    next
}

/// Body of the supervision task; returns once the server has terminated
/// and every client is gone
pub async fn run(server: Arc<Server>) {
    let mut flagged = HashSet::new();
    debug!("Client supervision started");

    loop {
        let (keep_running, next) = server.timeout_for_clients_validation(&mut flagged);
        if !keep_running {
            break;
        }
        server.supervision().sleep(next).await;
    }

    debug!("Client supervision finished");
}
