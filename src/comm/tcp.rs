// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 commlink developers

//! TCP implementation of the communication layer.
//!
//! A dedicated I/O thread runs a mio poll loop servicing every outbound
//! connection. Callers hand it work through a command channel paired
//! with a [`mio::Waker`]; connection-lifecycle events flow back through
//! the per-connection [`DispatchHandler`].
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                         TcpComm                              |
//! |   connect() / close_socket()          (caller threads)       |
//! |      |  address registry check, socket setup                 |
//! |      v                                                       |
//! |  +-------------------------------------------------------+  |
//! |  |            command channel + Waker                    |  |
//! |  +-------------------------------------------------------+  |
//! |      |                                                      |
//! |      v                    "commlink-io" thread               |
//! |  +-------------------------------------------------------+  |
//! |  |                    mio::Poll                           |  |
//! |  |  - writable while connecting -> Established / Error   |  |
//! |  |  - read EOF                  -> Disconnect            |  |
//! |  |  - read error                -> Error                 |  |
//! |  +-------------------------------------------------------+  |
//! |      |                                                      |
//! |      v                                                      |
//! |  handler.handle(event)        (no locks held)               |
//! +-------------------------------------------------------------+
//! ```
//!
//! The layer carries no application traffic: there is no send API and
//! inbound bytes are drained and discarded. Its sole job is to hold
//! transport connections open and report their lifecycle.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use super::Comm;
use crate::error::{CommError, CommResult};
use crate::event::{DispatchHandler, Event};

// ============================================================================
// Constants
// ============================================================================

/// Token for the waker (command channel).
const WAKER_TOKEN: Token = Token(0);

/// Starting token for connections.
const CONNECTION_TOKEN_START: usize = 1;

/// Upper bound on one poll cycle; commands are normally picked up
/// immediately via the waker, this bounds the worst case.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events to process per poll.
const MAX_EVENTS: usize = 64;

/// Scratch buffer size for draining inbound bytes.
const DRAIN_BUF_SIZE: usize = 4096;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for [`TcpComm`].
#[derive(Clone, Debug)]
pub struct TcpCommConfig {
    /// Enable TCP_NODELAY on every connection.
    pub nodelay: bool,
}

impl Default for TcpCommConfig {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl TcpCommConfig {
    /// Builder: set TCP_NODELAY.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Commands sent to the I/O thread.
enum IoCommand {
    /// Adopt an in-flight outbound connection.
    Register {
        conn_id: u64,
        addr: SocketAddrV4,
        stream: TcpStream,
        handler: Arc<dyn DispatchHandler>,
    },

    /// Tear down a connection without delivering an event.
    Close { conn_id: u64 },

    /// Stop the I/O thread.
    Shutdown,
}

/// Peer address to connection-id map, shared between caller threads and
/// the I/O thread. This is what makes duplicate-connect detection
/// synchronous.
type AddrRegistry = Arc<Mutex<HashMap<SocketAddrV4, u64>>>;

// ============================================================================
// TcpComm
// ============================================================================

/// TCP communication layer with a dedicated I/O thread.
pub struct TcpComm {
    cmd_tx: Sender<IoCommand>,
    waker: Arc<Waker>,
    registry: AddrRegistry,
    next_conn_id: AtomicU64,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpComm {
    /// Start the I/O thread and return the layer handle.
    pub fn spawn(config: TcpCommConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (cmd_tx, cmd_rx) = channel();
        let registry: AddrRegistry = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let io_loop = IoLoop {
            config,
            poll,
            connections: HashMap::new(),
            conn_id_to_token: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            cmd_rx,
            registry: Arc::clone(&registry),
            running: Arc::clone(&running),
        };

        let thread = thread::Builder::new()
            .name("commlink-io".to_string())
            .spawn(move || io_loop.run())?;

        Ok(Self {
            cmd_tx,
            waker,
            registry,
            next_conn_id: AtomicU64::new(1),
            running,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Check if the I/O thread is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the I/O thread.
    ///
    /// Every surviving connection is torn down and its handler receives
    /// a [`Disconnect`](crate::EventKind::Disconnect) event.
    pub fn shutdown(&self) -> io::Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        let _ = self.cmd_tx.send(IoCommand::Shutdown);
        let _ = self.waker.wake();

        if let Some(handle) = self.thread.lock().take() {
            handle
                .join()
                .map_err(|_| io::Error::other("I/O thread panicked"))?;
        }

        Ok(())
    }

    /// Common path for both connect flavors.
    fn initiate(
        &self,
        addr: SocketAddrV4,
        local: Option<SocketAddrV4>,
        handler: Arc<dyn DispatchHandler>,
    ) -> CommResult<()> {
        // The registry lock is held across socket creation so two racing
        // connects to the same peer cannot both pass the duplicate check.
        let mut registry = self.registry.lock();

        if registry.contains_key(&addr) {
            return Err(CommError::AlreadyConnected);
        }
        if !self.is_running() {
            return Err(CommError::Shutdown);
        }

        let stream = match local {
            Some(local) if local.port() != 0 => connect_from(addr, local)?,
            _ => TcpStream::connect(SocketAddr::V4(addr))?,
        };

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        registry.insert(addr, conn_id);

        if self
            .cmd_tx
            .send(IoCommand::Register {
                conn_id,
                addr,
                stream,
                handler,
            })
            .is_err()
        {
            registry.remove(&addr);
            return Err(CommError::Shutdown);
        }
        drop(registry);

        self.waker.wake()?;
        Ok(())
    }
}

impl Comm for TcpComm {
    fn connect(&self, addr: SocketAddrV4, handler: Arc<dyn DispatchHandler>) -> CommResult<()> {
        self.initiate(addr, None, handler)
    }

    fn connect_with_local(
        &self,
        addr: SocketAddrV4,
        local: SocketAddrV4,
        handler: Arc<dyn DispatchHandler>,
    ) -> CommResult<()> {
        self.initiate(addr, Some(local), handler)
    }

    fn close_socket(&self, addr: SocketAddrV4) -> CommResult<()> {
        let conn_id = self
            .registry
            .lock()
            .remove(&addr)
            .ok_or(CommError::NotConnected)?;

        self.cmd_tx
            .send(IoCommand::Close { conn_id })
            .map_err(|_| CommError::Shutdown)?;
        self.waker.wake()?;
        Ok(())
    }
}

impl Drop for TcpComm {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Create a non-blocking socket bound to `local` and start connecting it
/// to `addr`.
fn connect_from(addr: SocketAddrV4, local: SocketAddrV4) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(local).into())?;

    match socket.connect(&SocketAddr::V4(addr).into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(e),
    }

    Ok(TcpStream::from_std(socket.into()))
}

#[cfg(unix)]
fn connect_in_progress(e: &io::Error) -> bool {
    // The expected result of a non-blocking connect.
    e.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn connect_in_progress(_e: &io::Error) -> bool {
    false
}

// ============================================================================
// I/O loop
// ============================================================================

/// Per-connection state owned by the I/O thread.
struct IoConnection {
    stream: TcpStream,
    conn_id: u64,
    addr: SocketAddrV4,
    connected: bool,
    handler: Arc<dyn DispatchHandler>,
}

/// I/O thread state and runner.
struct IoLoop {
    config: TcpCommConfig,
    poll: Poll,
    connections: HashMap<Token, IoConnection>,
    conn_id_to_token: HashMap<u64, Token>,
    next_token: usize,
    cmd_rx: Receiver<IoCommand>,
    registry: AddrRegistry,
    running: Arc<AtomicBool>,
}

impl IoLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(DEFAULT_POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[tcp] poll failed: {}; stopping I/O thread", e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => self.handle_commands(),
                    token => {
                        // A connecting socket resolves through the
                        // writable path; readable is only meaningful once
                        // connected.
                        if event.is_writable() {
                            self.handle_writable(token);
                        }
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::Relaxed);

        // Surviving connections go down with the layer; their owners see
        // an ordinary disconnect.
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.teardown(token, |addr| {
                log::debug!("[tcp] closing connection to {}: I/O thread shutdown", addr);
                Some(Event::disconnect(addr))
            });
        }
    }

    fn handle_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(IoCommand::Register {
                    conn_id,
                    addr,
                    stream,
                    handler,
                }) => {
                    self.handle_register(conn_id, addr, stream, handler);
                }
                Ok(IoCommand::Close { conn_id }) => {
                    if let Some(token) = self.conn_id_to_token.get(&conn_id).copied() {
                        self.teardown(token, |_| None);
                    }
                }
                Ok(IoCommand::Shutdown) => {
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
    }

    fn handle_register(
        &mut self,
        conn_id: u64,
        addr: SocketAddrV4,
        mut stream: TcpStream,
        handler: Arc<dyn DispatchHandler>,
    ) {
        let token = Token(self.next_token);
        self.next_token += 1;

        if let Err(e) = self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            log::warn!("[tcp] failed to register connection to {}: {}", addr, e);
            self.registry.lock().remove(&addr);
            handler.handle(&Event::error(addr, e.into()));
            return;
        }

        let _ = stream.set_nodelay(self.config.nodelay);

        self.connections.insert(
            token,
            IoConnection {
                stream,
                conn_id,
                addr,
                connected: false,
                handler,
            },
        );
        self.conn_id_to_token.insert(conn_id, token);
    }

    fn handle_writable(&mut self, token: Token) {
        let conn = match self.connections.get_mut(&token) {
            Some(c) => c,
            None => return,
        };

        if conn.connected {
            // Spurious writable; this layer never queues outbound data.
            return;
        }

        match conn.stream.take_error() {
            Ok(Some(e)) => {
                log::debug!("[tcp] connect to {} failed: {}", conn.addr, e);
                self.teardown(token, |addr| Some(Event::error(addr, e.into())));
            }
            Ok(None) => match conn.stream.peer_addr() {
                Ok(_) => {
                    conn.connected = true;
                    let event = Event::established(conn.addr);
                    let handler = Arc::clone(&conn.handler);
                    log::debug!("[tcp] connected to {}", conn.addr);
                    handler.handle(&event);
                }
                // Still connecting; wait for the next writable.
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) if connect_in_progress(&e) => {}
                Err(e) => {
                    self.teardown(token, |addr| Some(Event::error(addr, e.into())));
                }
            },
            Err(e) => {
                self.teardown(token, |addr| Some(Event::error(addr, e.into())));
            }
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let conn = match self.connections.get_mut(&token) {
            Some(c) => c,
            None => return,
        };
        if !conn.connected {
            return;
        }

        let mut buf = [0u8; DRAIN_BUF_SIZE];
        loop {
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    log::debug!("[tcp] peer {} closed the connection", conn.addr);
                    self.teardown(token, |addr| Some(Event::disconnect(addr)));
                    return;
                }
                Ok(n) => {
                    // No framing, no recv API: inbound bytes have nowhere
                    // to go.
                    log::trace!("[tcp] discarding {} inbound bytes from {}", n, conn.addr);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.teardown(token, |addr| Some(Event::error(addr, e.into())));
                    return;
                }
            }
        }
    }

    /// Remove a connection, then deliver the terminal event (if any)
    /// with no locks held.
    fn teardown<F>(&mut self, token: Token, event_for: F)
    where
        F: FnOnce(SocketAddrV4) -> Option<Event>,
    {
        let mut conn = match self.connections.remove(&token) {
            Some(c) => c,
            None => return,
        };

        let _ = self.poll.registry().deregister(&mut conn.stream);
        self.conn_id_to_token.remove(&conn.conn_id);

        {
            let mut registry = self.registry.lock();
            // close_socket may have removed the entry already, and a
            // newer connect may own the address by now.
            if registry.get(&conn.addr) == Some(&conn.conn_id) {
                registry.remove(&conn.addr);
            }
        }

        if let Some(event) = event_for(conn.addr) {
            conn.handler.handle(&event);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::net::TcpListener;
    use std::time::Instant;

    /// Records every delivered event; tests poll for the kind they need.
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn wait_for(&self, kind: EventKind, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if self.events.lock().iter().any(|e| e.kind == kind) {
                    return true;
                }
                thread::sleep(Duration::from_millis(5));
            }
            false
        }

        fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().iter().map(|e| e.kind).collect()
        }
    }

    impl DispatchHandler for Recorder {
        fn handle(&self, event: &Event) {
            self.events.lock().push(event.clone());
        }
    }

    fn v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => panic!("expected IPv4 address"),
        }
    }

    #[test]
    fn test_config_default_and_builder() {
        let config = TcpCommConfig::default();
        assert!(config.nodelay);

        let config = TcpCommConfig::default().with_nodelay(false);
        assert!(!config.nodelay);
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let comm = TcpComm::spawn(TcpCommConfig::default()).unwrap();
        assert!(comm.is_running());
        comm.shutdown().unwrap();
        assert!(!comm.is_running());
        // Idempotent.
        comm.shutdown().unwrap();
    }

    #[test]
    fn test_connect_delivers_established() {
        let _ = env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = v4(listener.local_addr().unwrap());

        let comm = TcpComm::spawn(TcpCommConfig::default()).unwrap();
        let recorder = Recorder::new();

        comm.connect(addr, recorder.clone()).unwrap();
        assert!(recorder.wait_for(EventKind::Established, Duration::from_secs(2)));

        comm.close_socket(addr).unwrap();
    }

    #[test]
    fn test_duplicate_connect_is_already_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = v4(listener.local_addr().unwrap());

        let comm = TcpComm::spawn(TcpCommConfig::default()).unwrap();
        let recorder = Recorder::new();

        comm.connect(addr, recorder.clone()).unwrap();
        let second = comm.connect(addr, recorder.clone());
        assert_eq!(second, Err(CommError::AlreadyConnected));
    }

    #[test]
    fn test_close_unknown_is_not_connected() {
        let comm = TcpComm::spawn(TcpCommConfig::default()).unwrap();
        let addr: SocketAddrV4 = "127.0.0.1:1".parse().unwrap();
        assert_eq!(comm.close_socket(addr), Err(CommError::NotConnected));
    }

    #[test]
    fn test_close_then_close_again() {
        let _ = env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = v4(listener.local_addr().unwrap());

        let comm = TcpComm::spawn(TcpCommConfig::default()).unwrap();
        let recorder = Recorder::new();

        comm.connect(addr, recorder.clone()).unwrap();
        assert!(recorder.wait_for(EventKind::Established, Duration::from_secs(2)));

        comm.close_socket(addr).unwrap();
        assert_eq!(comm.close_socket(addr), Err(CommError::NotConnected));

        // The address is free again for a fresh connect.
        comm.connect(addr, recorder.clone()).unwrap();
    }

    #[test]
    fn test_connect_refused_delivers_error() {
        let _ = env_logger::try_init();
        // Bind to learn a free port, then release it.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            v4(listener.local_addr().unwrap())
        };

        let comm = TcpComm::spawn(TcpCommConfig::default()).unwrap();
        let recorder = Recorder::new();

        comm.connect(addr, recorder.clone()).unwrap();
        assert!(recorder.wait_for(EventKind::Error, Duration::from_secs(2)));
        assert!(!recorder.kinds().contains(&EventKind::Established));

        // The failed connect released the address.
        assert_eq!(comm.close_socket(addr), Err(CommError::NotConnected));
    }

    #[test]
    fn test_connect_with_local_bind() {
        let _ = env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = v4(listener.local_addr().unwrap());
        let local: SocketAddrV4 = "127.0.0.1:0".parse().unwrap();

        let comm = TcpComm::spawn(TcpCommConfig::default()).unwrap();
        let recorder = Recorder::new();

        comm.connect_with_local(addr, local, recorder.clone()).unwrap();
        assert!(recorder.wait_for(EventKind::Established, Duration::from_secs(2)));
    }

    #[test]
    fn test_peer_close_delivers_disconnect() {
        let _ = env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = v4(listener.local_addr().unwrap());

        let comm = TcpComm::spawn(TcpCommConfig::default()).unwrap();
        let recorder = Recorder::new();

        comm.connect(addr, recorder.clone()).unwrap();
        assert!(recorder.wait_for(EventKind::Established, Duration::from_secs(2)));

        // Accept, then hang up.
        let (accepted, _) = listener.accept().unwrap();
        drop(accepted);

        assert!(recorder.wait_for(EventKind::Disconnect, Duration::from_secs(2)));
        assert_eq!(comm.close_socket(addr), Err(CommError::NotConnected));
    }

    #[test]
    fn test_shutdown_disconnects_survivors() {
        let _ = env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = v4(listener.local_addr().unwrap());

        let comm = TcpComm::spawn(TcpCommConfig::default()).unwrap();
        let recorder = Recorder::new();

        comm.connect(addr, recorder.clone()).unwrap();
        assert!(recorder.wait_for(EventKind::Established, Duration::from_secs(2)));

        comm.shutdown().unwrap();
        assert!(recorder.wait_for(EventKind::Disconnect, Duration::from_secs(1)));
        assert!(!recorder.kinds().contains(&EventKind::Error));
    }

    #[test]
    fn test_connect_after_shutdown() {
        let comm = TcpComm::spawn(TcpCommConfig::default()).unwrap();
        comm.shutdown().unwrap();

        let addr: SocketAddrV4 = "127.0.0.1:1".parse().unwrap();
        let recorder = Recorder::new();
        assert_eq!(comm.connect(addr, recorder), Err(CommError::Shutdown));
    }
}
