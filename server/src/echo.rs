//! Echo delegate used by the `server` binary
//!
//! Every client simply writes back what it reads. A client counts as
//! handshaking until its first bytes arrive, so idle connections are evicted
//! by the connect timeout.
//!
//! Each worker task performs one bounded read and echo, then re-posts the
//! client, so a small worker pool serves any number of connections.

use crate::client::{Client, ClientPtr};
use crate::connection::Connection;
use crate::delegate::{RejectReason, ServerDelegate};
use crate::network::Server;
use crate::session::{ProtocolEncoder, Session, SessionPtr};
use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::{ClientId, ClientState};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

const BUFFER_SIZE: usize = 4096;

/// Longest a single read may hold a worker thread
const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct EchoClient {
    id: ClientId,
    accept_time: Instant,
    peer: String,
    secure: bool,
    me: Weak<EchoClient>,
    server: Weak<Server>,
    state: Mutex<ClientState>,
    connection: Mutex<Option<Box<dyn Connection>>>,
    buffer_size: usize,
    echoed: AtomicU64,
}

impl EchoClient {
    pub fn new(server: &Arc<Server>, connection: Box<dyn Connection>) -> Arc<Self> {
        let buffer_size = BUFFER_SIZE.min((server.config().max_message_size as usize).max(1));
        Arc::new_cyclic(|me| Self {
            id: server.next_client_id(),
            accept_time: Instant::now(),
            peer: connection.peer(),
            secure: connection.connection_type().is_secure(),
            me: me.clone(),
            server: Arc::downgrade(server),
            state: Mutex::new(ClientState::Accepted),
            connection: Mutex::new(Some(connection)),
            buffer_size,
            echoed: AtomicU64::new(0),
        })
    }

    /// One unit of work: a bounded read, and the echo of whatever arrived
    fn step(self: Arc<Self>) {
        let more = {
            let mut slot = self.connection.lock();
            match slot.as_mut() {
                Some(connection) if !self.state().is_closing() => {
                    match self.poll(connection.as_mut()) {
                        Ok(more) => more,
                        Err(e) => {
                            debug!("{} connection error: {}", self.id, e);
                            false
                        }
                    }
                }
                _ => false,
            }
        };

        if more {
            self.schedule();
        } else {
            self.finish();
        }
    }

    /// Returns `Ok(false)` once the peer has hung up
    fn poll(&self, connection: &mut dyn Connection) -> io::Result<bool> {
        let mut buf = vec![0u8; self.buffer_size];
        let read = match connection.read(&mut buf) {
            Ok(0) => return Ok(false),
            Ok(read) => read,
            Err(e) if is_idle(&e) => return Ok(true),
            Err(e) => return Err(e),
        };

        {
            let mut state = self.state.lock();
            if state.is_handshaking() {
                *state = ClientState::Running;
            }
        }
        connection.write_all(&buf[..read])?;
        self.echoed.fetch_add(read as u64, Ordering::Relaxed);
        Ok(true)
    }

    fn schedule(self: Arc<Self>) {
        let Some(server) = self.server.upgrade() else {
            self.finish();
            return;
        };

        let next = Arc::clone(&self);
        if !server.worker_scheduler().post(move || next.step()) {
            debug!("{} dropped by a stopped worker pool", self.id);
            self.finish();
        }
    }

    /// Releases the socket and reports closure, once
    fn finish(&self) {
        let Some(connection) = self.connection.lock().take() else {
            return;
        };
        if let Err(e) = connection.shutdown() {
            debug!("{} shutdown failed: {}", self.id, e);
        }
        debug!(
            "{} finished after echoing {} bytes",
            self.id,
            self.echoed.load(Ordering::Relaxed)
        );

        self.set_state(ClientState::Closed);
        if let Some(server) = self.server.upgrade() {
            server.on_client_closed(self);
        }
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock() = state;
    }

    /// Marks the client closing; its next step releases the socket
    fn request_close(&self) {
        let mut state = self.state.lock();
        if !state.is_closing() {
            *state = ClientState::Closing;
        }
    }
}

fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

impl Client for EchoClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn accept_time(&self) -> Instant {
        self.accept_time
    }

    fn state(&self) -> ClientState {
        *self.state.lock()
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn run(&self, skip_name_resolve: bool) {
        if !skip_name_resolve {
            debug!("{} connected from {}", self.id, self.peer);
        }

        let ready = self
            .connection
            .lock()
            .as_ref()
            .map(|connection| connection.set_read_timeout(Some(POLL_INTERVAL)));
        match (ready, self.me.upgrade()) {
            (Some(Ok(())), Some(me)) => me.step(),
            (Some(Err(e)), _) => {
                warn!("{} cannot bound reads: {}", self.id, e);
                self.finish();
            }
            _ => self.finish(),
        }
    }

    fn on_auth_timeout(&self) {
        info!("{} from {} did not send anything in time", self.id, self.peer);
        self.request_close();
    }

    fn on_server_shutdown(&self) {
        self.request_close();
    }
}

/// Session over an echo client; there is no protocol beyond the bytes
pub struct EchoSession {
    id: u32,
    client: ClientPtr,
}

impl Session for EchoSession {
    fn session_id(&self) -> u32 {
        self.id
    }

    fn client(&self) -> ClientPtr {
        Arc::clone(&self.client)
    }
}

/// Delegate admitting up to `max_connections` echo clients at once
pub struct EchoDelegate {
    max_connections: usize,
    active: AtomicUsize,
}

impl EchoDelegate {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            active: AtomicUsize::new(0),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl ServerDelegate for EchoDelegate {
    fn create_client(&self, server: &Arc<Server>, connection: Box<dyn Connection>) -> ClientPtr {
        EchoClient::new(server, connection)
    }

    /// Reserves a connection slot; the slot is returned in `on_client_closed`
    fn will_accept_client(&self, _client: &ClientPtr) -> bool {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < self.max_connections).then_some(active + 1)
            })
            .is_ok()
    }

    fn did_reject_client(&self, reason: RejectReason) {
        warn!("Connection rejected: {:?}", reason);
    }

    fn create_session(
        &self,
        client: &ClientPtr,
        _encoder: Arc<dyn ProtocolEncoder>,
        session_id: u32,
    ) -> Option<SessionPtr> {
        Some(Arc::new(EchoSession {
            id: session_id,
            client: Arc::clone(client),
        }))
    }

    fn on_client_closed(&self, _client: &dyn Client) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
