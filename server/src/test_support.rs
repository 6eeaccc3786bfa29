//! In-crate test doubles for the collaborator traits

use crate::client::{Client, ClientPtr};
use crate::connection::Connection;
use crate::delegate::{RejectReason, ServerDelegate};
use crate::network::Server;
use crate::session::{ProtocolEncoder, Session, SessionPtr};
use parking_lot::Mutex;
use shared::{ClientId, ClientState};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Client whose state is set by the test and which records close requests
pub struct MockClient {
    id: ClientId,
    accept_time: Instant,
    state: Mutex<ClientState>,
    secure: AtomicBool,
    pub auth_timeouts: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl MockClient {
    pub fn new(id: u64) -> ClientPtr {
        Self::build(id, Instant::now(), false)
    }

    pub fn secure(id: u64) -> ClientPtr {
        Self::build(id, Instant::now(), true)
    }

    pub fn aged(id: u64, age: Duration, state: ClientState) -> Arc<MockClient> {
        Arc::new(Self {
            id: ClientId(id),
            accept_time: Instant::now() - age,
            state: Mutex::new(state),
            secure: AtomicBool::new(false),
            auth_timeouts: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        })
    }

    fn build(id: u64, accept_time: Instant, secure: bool) -> ClientPtr {
        Arc::new(Self {
            id: ClientId(id),
            accept_time,
            state: Mutex::new(ClientState::Accepted),
            secure: AtomicBool::new(secure),
            auth_timeouts: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        })
    }

    pub fn set_state(&self, state: ClientState) {
        *self.state.lock() = state;
    }
}

impl Client for MockClient {
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
        self.secure.load(Ordering::Relaxed)
    }

    fn run(&self, _skip_name_resolve: bool) {}

    fn on_auth_timeout(&self) {
        self.auth_timeouts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_server_shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Client that reports closure to its server as soon as it is asked to close
pub struct ClosingClient {
    id: ClientId,
    accept_time: Instant,
    server: Weak<Server>,
    state: Mutex<ClientState>,
    pub runs: AtomicUsize,
}

impl ClosingClient {
    pub fn new(server: &Arc<Server>) -> Arc<ClosingClient> {
        Arc::new(Self {
            id: server.next_client_id(),
            accept_time: Instant::now(),
            server: Arc::downgrade(server),
            state: Mutex::new(ClientState::Accepted),
            runs: AtomicUsize::new(0),
        })
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ClientState::Closed {
                return;
            }
            *state = ClientState::Closed;
        }
        if let Some(server) = self.server.upgrade() {
            server.on_client_closed(self);
        }
    }
}

impl Client for ClosingClient {
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
        false
    }

    fn run(&self, _skip_name_resolve: bool) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn on_auth_timeout(&self) {
        self.close();
    }

    fn on_server_shutdown(&self) {
        self.close();
    }
}

pub struct TestSession {
    pub id: u32,
    pub client: ClientPtr,
}

impl Session for TestSession {
    fn session_id(&self) -> u32 {
        self.id
    }

    fn client(&self) -> ClientPtr {
        Arc::clone(&self.client)
    }
}

/// Delegate that builds [`ClosingClient`]s and counts every callback
#[derive(Default)]
pub struct RecordingDelegate {
    pub accepted: AtomicUsize,
    pub rejected: AtomicUsize,
    pub closed: AtomicUsize,
    pub reject_all: AtomicBool,
    pub terminating: AtomicBool,
    pub decline_sessions: AtomicBool,
}

impl ServerDelegate for RecordingDelegate {
    fn create_client(&self, server: &Arc<Server>, _connection: Box<dyn Connection>) -> ClientPtr {
        ClosingClient::new(server)
    }

    fn will_accept_client(&self, _client: &ClientPtr) -> bool {
        !self.reject_all.load(Ordering::SeqCst)
    }

    fn did_accept_client(&self, _client: &ClientPtr) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
    }

    fn did_reject_client(&self, reason: RejectReason) {
        assert_eq!(reason, RejectReason::TooManyConnections);
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }

    fn create_session(
        &self,
        client: &ClientPtr,
        _encoder: Arc<dyn ProtocolEncoder>,
        session_id: u32,
    ) -> Option<SessionPtr> {
        if self.decline_sessions.load(Ordering::SeqCst) {
            return None;
        }
        Some(Arc::new(TestSession {
            id: session_id,
            client: Arc::clone(client),
        }))
    }

    fn on_client_closed(&self, _client: &dyn Client) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }
}

/// Encoder that drops everything
pub struct NullEncoder;

impl ProtocolEncoder for NullEncoder {
    fn send_message(&self, _message_type: u8, _payload: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// Polls `condition` until it holds or five seconds pass
pub fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
