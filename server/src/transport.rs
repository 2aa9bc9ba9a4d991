//! Network transport owned by a client
//!
//! The [`Transport`] trait is the boundary to the byte stream; [`TcpTransport`]
//! implements it over `std::net::TcpStream`. [`TransportHandle`] layers the
//! Open → Closing → Closed state machine on top so that disconnecting is
//! idempotent and safe to call from any thread.

use log::{debug, warn};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};

/// Bidirectional byte stream as seen by a client
pub trait Transport: Send + Sync {
    fn is_open(&self) -> bool;

    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    fn close(&self) -> io::Result<()>;

    /// Writes the whole buffer or fails
    fn send(&self, bytes: &[u8]) -> io::Result<()>;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// TCP transport
///
/// Keeps a control handle for shutdown and a separate cloned handle for
/// writing, so a writer blocked in `send` never holds up `shutdown`.
/// The shutdown unblocks that writer.
#[derive(Debug)]
pub struct TcpTransport {
    control: Mutex<Option<TcpStream>>,
    writer: Mutex<Option<TcpStream>>,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        let peer = stream.peer_addr().ok();
        Ok(Self {
            control: Mutex::new(Some(stream)),
            writer: Mutex::new(Some(writer)),
            peer,
        })
    }
}

impl Transport for TcpTransport {
    fn is_open(&self) -> bool {
        self.control.lock().is_some()
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self.control.lock().as_ref() {
            Some(stream) => stream.shutdown(how),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket is closed")),
        }
    }

    fn close(&self) -> io::Result<()> {
        let control = self.control.lock().take();
        let writer = self.writer.lock().take();
        match (control, writer) {
            (None, None) => Err(io::Error::new(io::ErrorKind::NotConnected, "socket is already closed")),
            _ => Ok(()),
        }
    }

    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        match self.writer.lock().as_mut() {
            Some(stream) => stream.write_all(bytes),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket is closed")),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Open,
    Closing,
    Closed,
}

pub struct TransportHandle {
    transport: Box<dyn Transport>,
    state: AtomicU8,
}

impl TransportHandle {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            state: AtomicU8::new(OPEN),
        }
    }

    pub fn state(&self) -> TransportState {
        match self.state.load(Ordering::Acquire) {
            OPEN => TransportState::Open,
            CLOSING => TransportState::Closing,
            _ => TransportState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open && self.transport.is_open()
    }

    pub fn send(&self, bytes: &[u8]) -> io::Result<()> {
        if self.state() != TransportState::Open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport is closing"));
        }
        self.transport.send(bytes)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }

    /// Shuts down both directions, then closes
    ///
    /// Only the first caller performs the teardown; later calls and calls on
    /// an already-closed socket return immediately. Failures of either step
    /// are logged and never stop the other step from running.
    pub fn close(&self) {
        if !self.transport.is_open() {
            self.state.store(CLOSED, Ordering::Release);
            debug!("Socket is already closed.");
            return;
        }
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Socket is already closed.");
            return;
        }

        if let Err(e) = self.transport.shutdown(Shutdown::Both) {
            debug!("Failed to shutdown client socket: {}", e);
        }
        if let Err(e) = self.transport.close() {
            warn!("Failed to close client socket: {}", e);
        }

        self.state.store(CLOSED, Ordering::Release);
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("state", &self.state())
            .field("peer", &self.transport.peer_addr())
            .finish()
    }
}
