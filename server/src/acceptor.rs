//! Listening endpoints and the set the server accepts from

use crate::connection::{Connection, TcpConnection};
use crate::error::ServerError;
use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;
use shared::ConnectionType;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::watch;

#[cfg(unix)]
use crate::connection::LocalConnection;
#[cfg(unix)]
use tokio::net::UnixListener;

/// A listening endpoint that yields new client connections
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Waits for the next connection
    async fn accept(&self) -> io::Result<Box<dyn Connection>>;

    fn connection_type(&self) -> ConnectionType;

    /// Where the acceptor listens, for logging
    fn description(&self) -> String;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// TCP listener; binding must happen inside a tokio runtime context
pub struct TcpAcceptor {
    listener: TcpListener,
    address: SocketAddr,
}

impl TcpAcceptor {
    pub fn bind(address: SocketAddr) -> io::Result<Self> {
        let std_listener = std::net::TcpListener::bind(address)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let address = listener.local_addr()?;
        Ok(Self { listener, address })
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> io::Result<Box<dyn Connection>> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Box::new(TcpConnection::from_tokio(stream)?))
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Tcp
    }

    fn description(&self) -> String {
        format!("tcp://{}", self.address)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.address)
    }
}

/// Unix domain socket listener; the socket file is removed on drop
#[cfg(unix)]
pub struct LocalSocketAcceptor {
    listener: UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl LocalSocketAcceptor {
    pub fn bind(path: PathBuf) -> io::Result<Self> {
        let listener = UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }
}

#[cfg(unix)]
#[async_trait]
impl Acceptor for LocalSocketAcceptor {
    async fn accept(&self) -> io::Result<Box<dyn Connection>> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Box::new(LocalConnection::from_tokio(stream)?))
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::LocalSocket
    }

    fn description(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}

#[cfg(unix)]
impl Drop for LocalSocketAcceptor {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove socket {}: {}", self.path.display(), e);
        }
    }
}

/// Endpoint the server should listen on once prepared
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerSpec {
    Tcp(SocketAddr),
    LocalSocket(PathBuf),
}

/// The set of acceptors owned by a server
///
/// Built either from [`ListenerSpec`]s, bound during
/// [`prepare`](ServerAcceptors::prepare), or from ready-made acceptors.
/// Accept loops watch [`shutdown_signal`](ServerAcceptors::shutdown_signal)
/// and exit once [`stop`](ServerAcceptors::stop) is called.
pub struct ServerAcceptors {
    specs: Vec<ListenerSpec>,
    acceptors: Mutex<Vec<Arc<dyn Acceptor>>>,
    shutdown: watch::Sender<bool>,
}

impl ServerAcceptors {
    pub fn new(specs: Vec<ListenerSpec>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            specs,
            acceptors: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn with_acceptors(acceptors: Vec<Arc<dyn Acceptor>>) -> Self {
        let set = Self::new(Vec::new());
        *set.acceptors.lock() = acceptors;
        set
    }

    /// Binds every configured listener
    ///
    /// TCP listeners are skipped when `skip_networking` is set and local
    /// sockets unless `use_local_socket` is set. Binding stops at the first
    /// failure and releases whatever was bound by this call.
    pub fn prepare(
        &self,
        handle: &Handle,
        skip_networking: bool,
        use_local_socket: bool,
    ) -> Result<(), ServerError> {
        let _runtime = handle.enter();
        let mut bound: Vec<Arc<dyn Acceptor>> = Vec::new();

        for spec in &self.specs {
            match spec {
                ListenerSpec::Tcp(address) if skip_networking => {
                    info!("Networking disabled, not listening on {}", address);
                }
                ListenerSpec::Tcp(address) => {
                    let acceptor =
                        TcpAcceptor::bind(*address).map_err(|source| ServerError::Bind {
                            address: address.to_string(),
                            source,
                        })?;
                    bound.push(Arc::new(acceptor));
                }
                ListenerSpec::LocalSocket(path) if !use_local_socket => {
                    info!("Local sockets disabled, not listening on {}", path.display());
                }
                ListenerSpec::LocalSocket(path) => bound.push(Self::bind_local(path)?),
            }
        }

        for acceptor in &bound {
            info!("Listening on {}", acceptor.description());
        }
        self.acceptors.lock().extend(bound);
        Ok(())
    }

    #[cfg(unix)]
    fn bind_local(path: &Path) -> Result<Arc<dyn Acceptor>, ServerError> {
        let acceptor =
            LocalSocketAcceptor::bind(path.to_path_buf()).map_err(|source| ServerError::Bind {
                address: path.display().to_string(),
                source,
            })?;
        Ok(Arc::new(acceptor))
    }

    #[cfg(not(unix))]
    fn bind_local(path: &Path) -> Result<Arc<dyn Acceptor>, ServerError> {
        Err(ServerError::Bind {
            address: path.display().to_string(),
            source: io::Error::new(io::ErrorKind::Unsupported, "local sockets need unix"),
        })
    }

    pub fn acceptors(&self) -> Vec<Arc<dyn Acceptor>> {
        self.acceptors.lock().clone()
    }

    /// Addresses of bound TCP acceptors
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.acceptors
            .lock()
            .iter()
            .filter_map(|acceptor| acceptor.local_addr())
            .collect()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stops every accept loop and releases the listeners
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        let released = std::mem::take(&mut *self.acceptors.lock());
        if !released.is_empty() {
            info!("Stopped {} acceptors", released.len());
        }
    }

    /// Like [`stop`](Self::stop), for a startup that did not complete
    pub fn abort(&self) {
        warn!("Aborting acceptors");
        self.stop();
    }
}
