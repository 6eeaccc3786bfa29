//! Accepted connections handed to client objects
//!
//! Listeners accept on the async runtime; connections are converted to
//! blocking std streams here because clients process them on worker threads.

use shared::ConnectionType;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

/// Byte stream of one accepted client
pub trait Connection: Read + Write + Send {
    fn connection_type(&self) -> ConnectionType;

    /// Human readable peer address, for logging
    fn peer(&self) -> String;

    /// Closes both directions, unblocking any pending read
    fn shutdown(&self) -> io::Result<()>;

    /// Bounds how long a read may block; `None` blocks indefinitely
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

pub struct TcpConnection {
    stream: TcpStream,
    peer: String,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        Ok(Self { stream, peer })
    }

    /// Takes over a stream accepted by a tokio listener
    pub fn from_tokio(stream: tokio::net::TcpStream) -> io::Result<Self> {
        Self::new(stream.into_std()?)
    }
}

impl Read for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Connection for TcpConnection {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Tcp
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }
}

#[cfg(unix)]
pub struct LocalConnection {
    stream: UnixStream,
}

#[cfg(unix)]
impl LocalConnection {
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        Ok(Self { stream })
    }

    pub fn from_tokio(stream: tokio::net::UnixStream) -> io::Result<Self> {
        Self::new(stream.into_std()?)
    }
}

#[cfg(unix)]
impl Read for LocalConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

#[cfg(unix)]
impl Write for LocalConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(unix)]
impl Connection for LocalConnection {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::LocalSocket
    }

    fn peer(&self) -> String {
        "localhost".to_string()
    }

    fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }
}
