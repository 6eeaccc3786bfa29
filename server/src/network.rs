//! Server orchestration: lifecycle, accept loops and client bookkeeping

use crate::acceptor::{Acceptor, ServerAcceptors};
use crate::auth::{AuthenticationHandler, AuthenticationMechanism, AuthenticationRegistry};
use crate::client::{Client, ClientIdGenerator, ClientPtr};
use crate::client_list::ClientList;
use crate::connection::Connection;
use crate::delegate::{RejectReason, SecurityContext, ServerDelegate};
use crate::error::ServerError;
use crate::scheduler::Scheduler;
use crate::session::{ProtocolEncoder, SessionPtr};
use crate::state::{State, SyncState};
use crate::supervision::{self, SupervisionTimer};
use log::{debug, error, info, warn};
use shared::{ClientId, ProtocolConfig};
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Connection orchestrator
///
/// Accepts connections on the accept scheduler, hands each resulting client
/// to the worker scheduler and tracks it until it reports closure. A
/// supervision task evicts clients that overstay their phase ceiling.
///
/// Lifecycle: [`prepare`](Server::prepare), [`start`](Server::start), then
/// [`stop`](Server::stop). `stop(false)` blocks until every client has
/// closed and then shuts both schedulers down.
pub struct Server {
    state: SyncState,
    config: Arc<ProtocolConfig>,
    accept_scheduler: Arc<Scheduler>,
    worker_scheduler: Arc<Scheduler>,
    acceptors: Arc<ServerAcceptors>,
    delegate: Arc<dyn ServerDelegate>,
    security_context: OnceLock<Box<dyn SecurityContext>>,
    auth: AuthenticationRegistry,
    client_list: ClientList,
    supervision: SupervisionTimer,
    client_ids: ClientIdGenerator,
    errors_while_accepting: AtomicU32,
    skip_name_resolve: AtomicBool,
    prepared: AtomicBool,
    released: AtomicBool,
}

impl Server {
    pub fn new(
        config: Arc<ProtocolConfig>,
        accept_scheduler: Arc<Scheduler>,
        worker_scheduler: Arc<Scheduler>,
        acceptors: Arc<ServerAcceptors>,
        delegate: Arc<dyn ServerDelegate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: SyncState::new(State::Initializing),
            config,
            accept_scheduler,
            worker_scheduler,
            acceptors,
            delegate,
            security_context: OnceLock::new(),
            auth: AuthenticationRegistry::new(),
            client_list: ClientList::new(),
            supervision: SupervisionTimer::new(),
            client_ids: ClientIdGenerator::default(),
            errors_while_accepting: AtomicU32::new(0),
            skip_name_resolve: AtomicBool::new(false),
            prepared: AtomicBool::new(false),
            released: AtomicBool::new(false),
        })
    }

    /// Installs the security context and binds the listeners
    ///
    /// Any failure moves the server to `Failure` and releases whatever
    /// listeners were bound. On success the worker monitor timer is
    /// registered.
    pub fn prepare(
        self: &Arc<Self>,
        security_context: Option<Box<dyn SecurityContext>>,
        skip_networking: bool,
        skip_name_resolve: bool,
        use_local_socket: bool,
    ) -> Result<(), ServerError> {
        let state = self.state.get();
        if state != State::Initializing {
            error!("prepare() called while server is {:?}", state);
            return Err(ServerError::InvalidState {
                operation: "prepare",
                state,
            });
        }
        if self.prepared.swap(true, Ordering::SeqCst) {
            error!("prepare() called twice");
            return Err(ServerError::AlreadyPrepared);
        }

        if let Err(e) = self.prepare_impl(security_context, skip_networking, use_local_socket) {
            error!("Server preparation failed: {}", e);
            self.state.set_and_return_old(State::Failure);
            self.acceptors.abort();
            return Err(e);
        }

        self.skip_name_resolve
            .store(skip_name_resolve, Ordering::SeqCst);

        let server = Arc::downgrade(self);
        self.add_timer(self.config.worker_monitor_interval(), move || {
            server
                .upgrade()
                .map_or(false, |server| server.on_check_terminated_workers())
        });

        info!("Server prepared");
        Ok(())
    }

    fn prepare_impl(
        &self,
        security_context: Option<Box<dyn SecurityContext>>,
        skip_networking: bool,
        use_local_socket: bool,
    ) -> Result<(), ServerError> {
        if let Some(context) = security_context {
            context.validate().map_err(ServerError::SecurityContext)?;
            if context.has_ssl() {
                info!("Transport security enabled");
            }
            if self.security_context.set(context).is_err() {
                return Err(ServerError::AlreadyPrepared);
            }
        }

        self.acceptors.prepare(
            self.accept_scheduler.handle(),
            skip_networking,
            use_local_socket,
        )
    }

    /// Moves to `Running` and starts the accept and supervision tasks
    ///
    /// Only valid once, from `Initializing`.
    pub fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        if let Err(state) = self.state.exchange(State::Initializing, State::Running) {
            error!("start() called while server is {:?}", state);
            return Err(ServerError::InvalidState {
                operation: "start",
                state,
            });
        }

        let acceptors = self.acceptors.acceptors();
        if acceptors.is_empty() {
            warn!("Server started without any listeners");
        }

        for acceptor in acceptors {
            let server = Arc::clone(self);
            if !self
                .accept_scheduler
                .spawn(async move { server.accept_loop(acceptor).await })
            {
                self.start_failed();
                return Err(ServerError::SchedulerStopped(
                    self.accept_scheduler.name().to_string(),
                ));
            }
        }

        let server = Arc::clone(self);
        if !self.accept_scheduler.spawn(supervision::run(server)) {
            self.start_failed();
            return Err(ServerError::SchedulerStopped(
                self.accept_scheduler.name().to_string(),
            ));
        }

        info!("Server started successfully");
        Ok(())
    }

    /// Marks an interrupted startup as failed and closes the listeners
    pub fn start_failed(&self) {
        let old = self.state.set_and_return_old(State::Failure);
        if matches!(old, State::Initializing | State::Running) {
            error!("Server startup failed");
            self.acceptors.abort();
            self.supervision.wake();
        }
    }

    /// Shuts the server down
    ///
    /// Safe to call any number of times; only the first call stops the
    /// listeners and asks clients to close. From the supervision context
    /// (`is_called_from_timeout_handler`) it returns right away. Otherwise it
    /// blocks until every client has closed and then releases both
    /// schedulers.
    pub fn stop(&self, is_called_from_timeout_handler: bool) {
        let old = self.state.set_and_return_old(State::Terminating);
        if old == State::Initializing {
            self.state.set_and_return_old(State::Failure);
            self.state.set_and_return_old(State::Terminating);
        }

        if old != State::Terminating {
            info!("Server shutting down");
            self.acceptors.stop();
            self.supervision.wake();
            self.close_all_clients();
        }

        if is_called_from_timeout_handler {
            return;
        }

        self.wait_for_clients_closure();
        self.release_schedulers();
    }

    /// Asks every tracked client to close; none are removed here
    pub fn close_all_clients(&self) {
        self.client_list
            .for_each(|client| client.on_server_shutdown());
    }

    fn wait_for_clients_closure(&self) {
        let interval = self.config.shutdown_report_interval();
        while !self.client_list.wait_until_empty(interval) {
            warn!(
                "Still waiting for {} clients to close",
                self.client_list.len()
            );
        }
    }

    fn release_schedulers(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let grace = self.config.shutdown_report_interval();
        self.accept_scheduler.stop(grace);
        self.worker_scheduler.stop(grace);
        info!("Server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.is(State::Running) && !self.delegate.is_terminating()
    }

    pub fn is_terminating(&self) -> bool {
        matches!(self.state.get(), State::Failure | State::Terminating)
            || self.delegate.is_terminating()
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Blocks until the server reaches one of `states` or `timeout` passes
    pub fn wait_for_state(&self, states: &[State], timeout: Duration) -> bool {
        self.state.wait_for(states, timeout)
    }

    async fn accept_loop(self: Arc<Self>, acceptor: Arc<dyn Acceptor>) {
        let mut shutdown = self.acceptors.shutdown_signal();
        debug!("Accepting on {}", acceptor.description());

        while self.is_running() && !self.acceptors.is_stopped() {
            let accepted = tokio::select! {
                result = acceptor.accept() => result,
                _ = shutdown.changed() => break,
            };

            match accepted {
                Ok(connection) => {
                    self.errors_while_accepting.store(0, Ordering::SeqCst);
                    self.on_accept(connection);
                }
                Err(e) => {
                    if self.on_accept_error(acceptor.as_ref(), e).await {
                        break;
                    }
                }
            }
        }

        debug!("Stopped accepting on {}", acceptor.description());
    }

    /// Counts a failed accept; returns true once the server gave up
    async fn on_accept_error(&self, acceptor: &dyn Acceptor, e: io::Error) -> bool {
        let errors = self.errors_while_accepting.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            "Accept on {} failed ({} in a row): {}",
            acceptor.description(),
            errors,
            e
        );

        if errors >= self.config.max_consecutive_accept_errors {
            error!("Too many consecutive accept errors, shutting down");
            self.state.set_and_return_old(State::Failure);
            self.stop(true);
            return true;
        }

        tokio::time::sleep(self.config.accept_error_backoff()).await;
        false
    }

    fn on_accept(self: &Arc<Self>, connection: Box<dyn Connection>) {
        let peer = connection.peer();
        let connection_type = connection.connection_type();
        let client = self.delegate.create_client(self, connection);

        debug!("{} connected from {} over {}", client.id(), peer, connection_type);
        self.admit(client);
    }

    /// Registers a freshly created client and hands it to the worker pool
    pub(crate) fn admit(&self, client: ClientPtr) {
        if !self.delegate.will_accept_client(&client) {
            warn!("Rejected {}: too many connections", client.id());
            self.delegate
                .did_reject_client(RejectReason::TooManyConnections);
            return;
        }
        self.delegate.did_accept_client(&client);

        let id = client.id();
        if let Err(e) = self.client_list.add(Arc::clone(&client)) {
            error!("Dropping accepted client: {}", e);
            return;
        }
        self.restart_client_supervision_timer();

        // Registered after stop() snapshotted the list
        if self.is_terminating() {
            client.on_server_shutdown();
        }

        let skip_name_resolve = self.skip_name_resolve.load(Ordering::SeqCst);
        let runner = Arc::clone(&client);
        if !self
            .worker_scheduler
            .post(move || runner.run(skip_name_resolve))
        {
            error!("Worker pool refused {}, dropping it", id);
            self.client_list.remove(id);
        }
    }

    /// Called by a client once it has released its resources
    pub fn on_client_closed(&self, client: &dyn Client) {
        self.delegate.on_client_closed(client);
        self.client_list.remove(client.id());

        if self.is_terminating() {
            self.supervision.wake();
        }
    }

    pub fn restart_client_supervision_timer(&self) {
        self.supervision.rearm();
    }

    /// One supervision pass
    ///
    /// Returns whether the supervision task should keep going and, if any
    /// client still needs watching, when to look again. The delay never
    /// exceeds the connect timeout, so a client added while the timer is
    /// armed is still checked on time. While terminating with clients left,
    /// the task looks again at least once per connect timeout.
    pub fn timeout_for_clients_validation(
        &self,
        flagged: &mut HashSet<ClientId>,
    ) -> (bool, Option<Duration>) {
        self.supervision.disarm();
        let clients = self.client_list.snapshot();
        let terminating = self.is_terminating();

        if terminating && clients.is_empty() {
            return (false, None);
        }

        let connect_timeout = self.config.connect_timeout();
        let next = match supervision::check_clients(&clients, &self.config, flagged, Instant::now())
        {
            Some(delay) => Some(delay.min(connect_timeout)),
            None if terminating => Some(connect_timeout),
            None => None,
        };
        if next.is_some() {
            self.supervision.mark_armed();
        }
        (true, next)
    }

    pub fn create_session(
        &self,
        client: &ClientPtr,
        encoder: Arc<dyn ProtocolEncoder>,
        session_id: u32,
    ) -> Option<SessionPtr> {
        let session = self.delegate.create_session(client, encoder, session_id);
        if session.is_none() {
            warn!("No session created for {}", client.id());
        }
        session
    }

    pub fn add_authentication_mechanism(
        &self,
        name: &str,
        mechanism: Arc<dyn AuthenticationMechanism>,
        requires_secure_transport: bool,
    ) -> bool {
        self.auth.add(name, mechanism, requires_secure_transport)
    }

    /// Mechanism names the client may use, sorted
    pub fn get_authentication_mechanisms(&self, client: &dyn Client) -> Vec<String> {
        self.auth.names_for_client(client)
    }

    pub fn get_auth_handler(
        &self,
        name: &str,
        session: SessionPtr,
    ) -> Option<Box<dyn AuthenticationHandler>> {
        let handler = self.auth.handler(name, session);
        if handler.is_none() {
            debug!("No usable authentication mechanism named {}", name);
        }
        handler
    }

    /// Runs `callback` every `interval` on the accept scheduler until it
    /// returns false
    pub fn add_timer<F>(&self, interval: Duration, mut callback: F) -> bool
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.accept_scheduler.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !callback() {
                    break;
                }
            }
        })
    }

    /// Worker pool health check; returns false once the pool is gone
    pub fn on_check_terminated_workers(&self) -> bool {
        if !self.worker_scheduler.is_running() {
            debug!("Worker pool stopped, ending worker monitor");
            return false;
        }

        let panicked = self.worker_scheduler.take_panicked();
        if panicked > 0 {
            warn!(
                "{} worker tasks terminated abnormally, {} still active",
                panicked,
                self.worker_scheduler.active_tasks()
            );
        }
        true
    }

    pub fn config(&self) -> &Arc<ProtocolConfig> {
        &self.config
    }

    pub fn ssl_context(&self) -> Option<&dyn SecurityContext> {
        self.security_context.get().map(|context| context.as_ref())
    }

    pub fn worker_scheduler(&self) -> &Arc<Scheduler> {
        &self.worker_scheduler
    }

    pub fn client_list(&self) -> &ClientList {
        &self.client_list
    }

    pub fn next_client_id(&self) -> ClientId {
        self.client_ids.next()
    }

    /// Addresses the bound TCP listeners ended up on
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.acceptors.local_addrs()
    }

    pub(crate) fn supervision(&self) -> &SupervisionTimer {
        &self.supervision
    }
}
