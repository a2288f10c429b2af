// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 commlink developers

//! Scripted communication layer for tests.
//!
//! [`MockComm`] records every connect and close, fails connects according
//! to a script, and lets tests deliver lifecycle events through the
//! handlers the manager registered, from the test's own thread.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Comm;
use crate::error::{CommError, CommResult};
use crate::event::{DispatchHandler, Event, EventKind};

/// How the mock answers connect calls.
#[derive(Clone, Copy, Debug)]
enum ConnectScript {
    /// Every connect returns Ok.
    Accept,

    /// Every connect fails.
    Refuse,

    /// The first `n` connects fail, the rest return Ok.
    FailFirst(usize),

    /// Every connect reports an existing socket for the address.
    AlreadyConnected,
}

struct MockInner {
    script: ConnectScript,
    /// Connect attempts per address, in call order.
    attempts: HashMap<SocketAddrV4, usize>,
    /// Handlers registered by successful connects.
    handlers: HashMap<SocketAddrV4, Arc<dyn DispatchHandler>>,
    /// Local binds requested via `connect_with_local`.
    local_binds: HashMap<SocketAddrV4, SocketAddrV4>,
    /// Addresses passed to `close_socket`.
    closed: Vec<SocketAddrV4>,
    total_attempts: usize,
}

/// Scripted [`Comm`] implementation.
pub struct MockComm {
    inner: Mutex<MockInner>,
}

impl MockComm {
    fn with_script(script: ConnectScript) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MockInner {
                script,
                attempts: HashMap::new(),
                handlers: HashMap::new(),
                local_binds: HashMap::new(),
                closed: Vec::new(),
                total_attempts: 0,
            }),
        })
    }

    /// Every connect succeeds (the attempt goes "in flight"; deliver an
    /// Established event to complete it).
    pub fn accepting() -> Arc<Self> {
        Self::with_script(ConnectScript::Accept)
    }

    /// Every connect fails.
    pub fn refusing() -> Arc<Self> {
        Self::with_script(ConnectScript::Refuse)
    }

    /// The first `n` connects fail, later ones succeed.
    pub fn failing_first(n: usize) -> Arc<Self> {
        Self::with_script(ConnectScript::FailFirst(n))
    }

    /// Every connect reports [`CommError::AlreadyConnected`].
    pub fn already_connected() -> Arc<Self> {
        Self::with_script(ConnectScript::AlreadyConnected)
    }

    /// Connect attempts recorded for `addr`.
    pub fn attempts(&self, addr: SocketAddrV4) -> usize {
        self.inner.lock().attempts.get(&addr).copied().unwrap_or(0)
    }

    /// Connect attempts across all addresses.
    pub fn total_attempts(&self) -> usize {
        self.inner.lock().total_attempts
    }

    /// Addresses passed to `close_socket`, in call order.
    pub fn closed(&self) -> Vec<SocketAddrV4> {
        self.inner.lock().closed.clone()
    }

    /// Local bind recorded for `addr`, if `connect_with_local` was used.
    pub fn local_bind(&self, addr: SocketAddrV4) -> Option<SocketAddrV4> {
        self.inner.lock().local_binds.get(&addr).copied()
    }

    /// Deliver an event of `kind` for `addr` through the handler its
    /// connect registered.
    ///
    /// Panics if no connect for `addr` succeeded; scripted failures
    /// register no handler, mirroring a transport that has nothing to
    /// report events on.
    pub fn deliver(&self, addr: SocketAddrV4, kind: EventKind) {
        self.deliver_via(addr, &make_event(addr, kind));
    }

    /// Like [`deliver`](Self::deliver), but a missing handler is a no-op.
    /// Returns whether the event was delivered.
    pub fn try_deliver(&self, addr: SocketAddrV4, kind: EventKind) -> bool {
        let handler = {
            let inner = self.inner.lock();
            inner.handlers.get(&addr).map(Arc::clone)
        };
        match handler {
            Some(handler) => {
                handler.handle(&make_event(addr, kind));
                true
            }
            None => false,
        }
    }

    /// Deliver `event` through the handler registered for `via` even when
    /// `event.addr` differs; models a stray or late event.
    pub fn deliver_via(&self, via: SocketAddrV4, event: &Event) {
        // Clone the handler out so the mock lock is not held across the
        // callback; the handler will take the manager's locks.
        let handler = {
            let inner = self.inner.lock();
            match inner.handlers.get(&via) {
                Some(h) => Arc::clone(h),
                None => panic!("no handler registered for {}", via),
            }
        };
        handler.handle(event);
    }

    fn record_connect(
        &self,
        addr: SocketAddrV4,
        local: Option<SocketAddrV4>,
        handler: Arc<dyn DispatchHandler>,
    ) -> CommResult<()> {
        let mut inner = self.inner.lock();

        *inner.attempts.entry(addr).or_insert(0) += 1;
        inner.total_attempts += 1;
        if let Some(local) = local {
            inner.local_binds.insert(addr, local);
        }

        match inner.script {
            ConnectScript::Accept => {}
            ConnectScript::Refuse => return Err(CommError::io("scripted connect failure")),
            ConnectScript::FailFirst(n) if inner.total_attempts <= n => {
                return Err(CommError::io("scripted connect failure"));
            }
            ConnectScript::FailFirst(_) => {}
            ConnectScript::AlreadyConnected => return Err(CommError::AlreadyConnected),
        }

        inner.handlers.insert(addr, handler);
        Ok(())
    }
}

fn make_event(addr: SocketAddrV4, kind: EventKind) -> Event {
    match kind {
        EventKind::Established => Event::established(addr),
        EventKind::Disconnect => Event::disconnect(addr),
        EventKind::Error => Event::error(addr, CommError::io("injected")),
        EventKind::Message => Event {
            addr,
            kind: EventKind::Message,
            error: None,
        },
    }
}

impl Comm for MockComm {
    fn connect(&self, addr: SocketAddrV4, handler: Arc<dyn DispatchHandler>) -> CommResult<()> {
        self.record_connect(addr, None, handler)
    }

    fn connect_with_local(
        &self,
        addr: SocketAddrV4,
        local: SocketAddrV4,
        handler: Arc<dyn DispatchHandler>,
    ) -> CommResult<()> {
        self.record_connect(addr, Some(local), handler)
    }

    fn close_socket(&self, addr: SocketAddrV4) -> CommResult<()> {
        let mut inner = self.inner.lock();
        inner.closed.push(addr);
        inner.handlers.remove(&addr);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Sink;
    impl DispatchHandler for Sink {
        fn handle(&self, _event: &Event) {}
    }

    fn addr() -> SocketAddrV4 {
        "10.0.0.1:80".parse().unwrap()
    }

    #[test]
    fn test_accepting_records_attempts() {
        let mock = MockComm::accepting();
        assert!(mock.connect(addr(), Arc::new(Sink)).is_ok());
        assert!(mock.connect(addr(), Arc::new(Sink)).is_ok());
        assert_eq!(mock.attempts(addr()), 2);
        assert_eq!(mock.total_attempts(), 2);
    }

    #[test]
    fn test_fail_first_script() {
        let mock = MockComm::failing_first(2);
        assert!(mock.connect(addr(), Arc::new(Sink)).is_err());
        assert!(mock.connect(addr(), Arc::new(Sink)).is_err());
        assert!(mock.connect(addr(), Arc::new(Sink)).is_ok());
    }

    #[test]
    fn test_refusing_registers_no_handler() {
        let mock = MockComm::refusing();
        assert!(mock.connect(addr(), Arc::new(Sink)).is_err());
        assert!(mock.inner.lock().handlers.is_empty());
    }

    #[test]
    fn test_close_is_recorded() {
        let mock = MockComm::accepting();
        mock.connect(addr(), Arc::new(Sink)).unwrap();
        mock.close_socket(addr()).unwrap();
        assert_eq!(mock.closed(), vec![addr()]);
    }

    #[test]
    fn test_local_bind_recorded() {
        let mock = MockComm::accepting();
        let local: SocketAddrV4 = "192.168.0.2:4000".parse().unwrap();
        mock.connect_with_local(addr(), local, Arc::new(Sink)).unwrap();
        assert_eq!(mock.local_bind(addr()), Some(local));
    }
}
