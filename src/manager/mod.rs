// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 commlink developers

//! Connection supervision: registration, retry scheduling, rendezvous.
//!
//! [`ConnectionManager`] keeps one persistent outbound connection per
//! registered peer. Failed connects and dropped connections are retried
//! on a jittered deadline by a single background worker; callers can
//! block until a peer becomes reachable via
//! [`wait_for_connection`](ConnectionManager::wait_for_connection).
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                    ConnectionManager                         |
//! |  +-------------------------------------------------------+  |
//! |  |  table lock:  HashMap<SocketAddrV4, Arc<ConnState>>   |  |
//! |  |               RetryQueue (min-heap on next_retry)     |  |
//! |  |               shutdown flag      + retry condvar      |  |
//! |  +-------------------------------------------------------+  |
//! |     ^                ^                      ^                |
//! |     | add/remove/    | dispatch adapter     | pop due        |
//! |     | wait           | (comm events)        | entries        |
//! |  callers        comm dispatcher       "commlink-retry"       |
//! |                    thread                 worker             |
//! +-------------------------------------------------------------+
//! ```
//!
//! # Locking
//!
//! Strict hierarchy: table lock, then record lock. The retry condvar is
//! paired with the table lock; each record's condvar is paired with that
//! record's lock. No path acquires the table lock while holding a record
//! lock.

use std::io;
use std::net::SocketAddrV4;
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::comm::Comm;
use crate::error::{CommError, CommResult};
use crate::event::{DispatchHandler, Event, EventKind};
use crate::timer::Timer;

mod retry;
mod state;

use retry::{jittered_deadline, RetryEntry, RetryQueue};
use state::{ConnState, PeerMap};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for [`ConnectionManager`].
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Suppress the per-event info log lines (disconnects, reconnect
    /// notices). Warnings and connect-failure errors are still logged.
    pub quiet_mode: bool,

    /// Magnitude bound of the random adjustment applied to retry
    /// deadlines after a failed connect. Zero disables jitter.
    pub max_jitter: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            quiet_mode: false,
            max_jitter: Duration::from_millis(2000),
        }
    }
}

impl ManagerConfig {
    /// Config with event logging suppressed.
    pub fn quiet() -> Self {
        Self {
            quiet_mode: true,
            ..Default::default()
        }
    }

    /// Builder: set quiet mode.
    pub fn with_quiet_mode(mut self, quiet: bool) -> Self {
        self.quiet_mode = quiet;
        self
    }

    /// Builder: set the jitter magnitude bound.
    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// Everything behind the table lock.
struct Table {
    conns: PeerMap,
    retry: RetryQueue,
    shutdown: bool,
}

impl Table {
    fn new() -> Self {
        Self {
            conns: PeerMap::new(),
            retry: RetryQueue::new(),
            shutdown: false,
        }
    }
}

struct ManagerInner {
    comm: Arc<dyn Comm>,
    config: ManagerConfig,
    table: Mutex<Table>,
    /// Paired with `table`; notified on heap insertion and shutdown.
    retry_cond: Condvar,
    /// The manager's own dispatch handler, registered with the comm
    /// layer for every connect. Set once right after construction.
    adapter: OnceLock<Arc<dyn DispatchHandler>>,
}

// ============================================================================
// Connection manager
// ============================================================================

/// Maintains persistent outbound connections to registered peers.
///
/// Dropping the manager shuts the retry worker down; established sockets
/// are left to the communication layer, which the manager only borrows.
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager over `comm` with default configuration.
    pub fn new(comm: Arc<dyn Comm>) -> io::Result<Self> {
        Self::with_config(comm, ManagerConfig::default())
    }

    /// Create a manager over `comm` with the given configuration.
    pub fn with_config(comm: Arc<dyn Comm>, config: ManagerConfig) -> io::Result<Self> {
        let inner = Arc::new(ManagerInner {
            comm,
            config,
            table: Mutex::new(Table::new()),
            retry_cond: Condvar::new(),
            adapter: OnceLock::new(),
        });

        let adapter: Arc<dyn DispatchHandler> = Arc::new(EventAdapter(Arc::downgrade(&inner)));
        let _ = inner.adapter.set(adapter);

        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("commlink-retry".to_string())
            .spawn(move || retry_loop(worker_inner))?;

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Register `addr` and start connecting to it.
    ///
    /// Idempotent: registering an already-known address has no effect.
    /// Never fails; a failed initial connect is converted into a
    /// scheduled retry `retry_interval` (± jitter) from now.
    ///
    /// `service_name` is only used in log text and may be empty. Every
    /// event delivered for this peer is forwarded to `handler`, if given.
    pub fn add(
        &self,
        addr: SocketAddrV4,
        retry_interval: Duration,
        service_name: impl Into<String>,
        handler: Option<Arc<dyn DispatchHandler>>,
    ) {
        self.insert(addr, None, retry_interval, service_name.into(), handler);
    }

    /// Like [`add`](Self::add), binding the local endpoint before each
    /// connect. A local port of zero lets the OS choose.
    pub fn add_with_local(
        &self,
        addr: SocketAddrV4,
        local_addr: SocketAddrV4,
        retry_interval: Duration,
        service_name: impl Into<String>,
        handler: Option<Arc<dyn DispatchHandler>>,
    ) {
        self.insert(
            addr,
            Some(local_addr),
            retry_interval,
            service_name.into(),
            handler,
        );
    }

    fn insert(
        &self,
        addr: SocketAddrV4,
        local_addr: Option<SocketAddrV4>,
        retry_interval: Duration,
        service_name: String,
        handler: Option<Arc<dyn DispatchHandler>>,
    ) {
        let mut table = self.inner.table.lock();
        if table.shutdown {
            log::debug!("[conn] ignoring add of {} after shutdown", addr);
            return;
        }
        if table.conns.contains_key(&addr) {
            return;
        }

        let state = Arc::new(ConnState::new(
            addr,
            local_addr,
            retry_interval,
            service_name,
            handler,
        ));
        table.conns.insert(addr, Arc::clone(&state));

        self.inner.send_connect_request(&mut table, &state);
    }

    /// Deregister `addr`, closing its connection if one is up.
    ///
    /// Unknown addresses return `Ok(())`. The entry is removed from the
    /// table even when the close fails; the close status is returned.
    pub fn remove(&self, addr: SocketAddrV4) -> CommResult<()> {
        let mut do_close = false;
        {
            let mut table = self.inner.table.lock();
            if let Some(state) = table.conns.remove(&addr) {
                let mut flags = state.sync.lock();
                if flags.connected {
                    do_close = true;
                } else {
                    // Poison marker: a heap entry for this record may
                    // still be pending; the retry worker discards
                    // "connected" entries, removed or not.
                    flags.connected = true;
                }
            }
        }

        if do_close {
            self.inner.comm.close_socket(addr)
        } else {
            Ok(())
        }
    }

    /// Block until `addr` is connected or `max_wait` elapses.
    ///
    /// Returns `false` immediately for addresses that were never
    /// [`add`](Self::add)ed (no implicit registration), and `false` on
    /// timeout; the peer stays registered and keeps retrying either way.
    pub fn wait_for_connection(&self, addr: SocketAddrV4, max_wait: Duration) -> bool {
        let mut timer = Timer::new(max_wait, true);
        self.wait_for_connection_timer(addr, &mut timer)
    }

    /// Block until `addr` is connected or `timer` runs out.
    ///
    /// The timer is started if it was not already; a single timer can be
    /// shared across several waits to bound their total duration.
    pub fn wait_for_connection_timer(&self, addr: SocketAddrV4, timer: &mut Timer) -> bool {
        timer.start();

        let state = {
            let table = self.inner.table.lock();
            match table.conns.get(&addr) {
                Some(state) => Arc::clone(state),
                None => return false,
            }
        };

        // Table lock dropped: waiters hold only the record lock.
        let mut flags = state.sync.lock();
        while !flags.connected {
            let deadline = Instant::now() + timer.remaining();
            // Timeout reports failure even if the flag flips at the same
            // instant; only a signaled, re-checked `connected` counts.
            if state.cond.wait_until(&mut flags, deadline).timed_out() {
                return false;
            }
        }
        true
    }

    /// Check whether `addr` currently has an established connection.
    pub fn is_connected(&self, addr: SocketAddrV4) -> bool {
        let state = {
            let table = self.inner.table.lock();
            table.conns.get(&addr).map(Arc::clone)
        };
        state.is_some_and(|s| s.is_connected())
    }

    /// Check whether `addr` is registered.
    pub fn contains(&self, addr: SocketAddrV4) -> bool {
        self.inner.table.lock().conns.contains_key(&addr)
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.inner.table.lock().conns.len()
    }

    /// Stop the retry worker.
    ///
    /// Idempotent. Registered peers stop retrying; established sockets
    /// are not closed (the communication layer is torn down separately).
    pub fn shutdown(&self) {
        {
            let mut table = self.inner.table.lock();
            if table.shutdown {
                return;
            }
            table.shutdown = true;
        }
        self.inner.retry_cond.notify_all();

        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ManagerInner {
    /// Issue a connect attempt for `state`.
    ///
    /// Called with the table lock held (`table`); takes the record lock
    /// itself. A failure schedules a jittered retry; the already-
    /// connected race counts as success and wakes waiters.
    fn send_connect_request(&self, table: &mut Table, state: &Arc<ConnState>) {
        let handler = match self.adapter.get() {
            Some(h) => Arc::clone(h),
            None => return,
        };

        let mut flags = state.sync.lock();

        let result = match state.local_addr {
            Some(local) if local.port() != 0 => {
                self.comm.connect_with_local(state.addr, local, handler)
            }
            _ => self.comm.connect(state.addr, handler),
        };

        match result {
            // In flight; the outcome arrives as an event.
            Ok(()) => {}
            Err(CommError::AlreadyConnected) => {
                flags.connected = true;
                state.cond.notify_all();
            }
            Err(err) => {
                log::error!(
                    "[conn] connection attempt to {} failed: {}; will retry in {} ms",
                    state.label(),
                    err,
                    state.retry_interval.as_millis()
                );
                flags.next_retry =
                    jittered_deadline(Instant::now(), state.retry_interval, self.config.max_jitter);
                table
                    .retry
                    .push(RetryEntry::new(flags.next_retry, Arc::clone(state)));
                self.retry_cond.notify_one();
            }
        }
    }

    /// Handle one event from the communication layer.
    fn dispatch_event(&self, event: &Event) {
        let mut table = self.table.lock();

        let state = match table.conns.get(&event.addr) {
            Some(state) => Arc::clone(state),
            None => {
                // Late event after remove, or a peer this manager never
                // registered.
                log::warn!("[conn] event for unknown peer: {}", event);
                return;
            }
        };

        let mut flags = state.sync.lock();
        match event.kind {
            EventKind::Established => {
                flags.connected = true;
                state.cond.notify_all();
            }
            EventKind::Disconnect | EventKind::Error => {
                if !self.config.quiet_mode {
                    log::info!(
                        "[conn] {}; reconnecting to {} in {} ms",
                        event,
                        state.label(),
                        state.retry_interval.as_millis()
                    );
                }
                flags.connected = false;
                flags.next_retry = Instant::now() + state.retry_interval;
                table
                    .retry
                    .push(RetryEntry::new(flags.next_retry, Arc::clone(&state)));
                self.retry_cond.notify_one();
            }
            EventKind::Message => {
                log::trace!("[conn] ignoring {}", event);
            }
        }

        // Forwarded under the record lock: event delivery for one peer is
        // serialized, so the user handler observes delivery order.
        if let Some(user) = &state.handler {
            user.handle(event);
        }
    }
}

// ============================================================================
// Dispatch adapter
// ============================================================================

/// The handler the manager registers with the communication layer.
///
/// Holds a weak reference so in-flight events cannot keep a dropped
/// manager alive (and the comm layer's handler references do not form a
/// cycle with the manager's reference to the comm layer).
struct EventAdapter(Weak<ManagerInner>);

impl DispatchHandler for EventAdapter {
    fn handle(&self, event: &Event) {
        if let Some(inner) = self.0.upgrade() {
            inner.dispatch_event(event);
        }
    }
}

// ============================================================================
// Retry worker
// ============================================================================

/// Body of the "commlink-retry" thread.
///
/// Owns the table lock for the whole loop; the condvar waits release it,
/// so the façade and the dispatch adapter run during the (typical) idle
/// periods.
fn retry_loop(inner: Arc<ManagerInner>) {
    let mut table = inner.table.lock();

    loop {
        while table.retry.is_empty() && !table.shutdown {
            inner.retry_cond.wait(&mut table);
        }
        if table.shutdown {
            break;
        }

        let (deadline, state) = match table.retry.peek() {
            Some(entry) => (entry.deadline, Arc::clone(&entry.state)),
            None => continue,
        };

        // Connected covers both a real connection racing the pending
        // entry and the poison marker left by remove.
        if state.is_connected() {
            table.retry.pop();
            continue;
        }

        if deadline <= Instant::now() {
            table.retry.pop();
            inner.send_connect_request(&mut table, &state);
            continue;
        }

        // Earliest deadline is in the future; sleep until then or until
        // an insertion/shutdown wakes us. Spurious wake-ups just
        // re-evaluate the heap top.
        let _ = inner.retry_cond.wait_until(&mut table, deadline);
    }
}

// ============================================================================
// Tests
// ============================================================================
