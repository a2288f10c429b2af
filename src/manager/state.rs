// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 commlink developers

//! Per-peer connection-state record.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::event::DispatchHandler;

/// Address-keyed table of connection records.
pub(crate) type PeerMap = HashMap<SocketAddrV4, Arc<ConnState>>;

/// Mutable per-record state, protected by [`ConnState::sync`].
#[derive(Debug)]
pub(crate) struct ConnFlags {
    /// True iff the communication layer currently reports an active
    /// connection for this peer. Also doubles as the poison marker on
    /// removed records: the retry worker discards "connected" heap
    /// entries either way.
    pub connected: bool,

    /// Deadline for the retry worker's next connect attempt.
    pub next_retry: Instant,
}

/// Per-peer record shared by the peer map, the retry heap, and in-flight
/// event deliveries.
pub(crate) struct ConnState {
    /// Peer endpoint; immutable, also the map key.
    pub addr: SocketAddrV4,

    /// Local endpoint to bind before connecting. A port of zero means
    /// the OS chooses.
    pub local_addr: Option<SocketAddrV4>,

    /// Human-readable label, used only in log text. May be empty.
    pub service_name: String,

    /// Base retry interval for this peer.
    pub retry_interval: Duration,

    /// User event handler; every event delivered for this peer is
    /// forwarded to it.
    pub handler: Option<Arc<dyn DispatchHandler>>,

    /// Protects [`ConnFlags`].
    pub sync: Mutex<ConnFlags>,

    /// Wakes rendezvous waiters on the false -> true `connected`
    /// transition. Paired with `sync`.
    pub cond: Condvar,
}

impl ConnState {
    pub fn new(
        addr: SocketAddrV4,
        local_addr: Option<SocketAddrV4>,
        retry_interval: Duration,
        service_name: impl Into<String>,
        handler: Option<Arc<dyn DispatchHandler>>,
    ) -> Self {
        Self {
            addr,
            local_addr,
            service_name: service_name.into(),
            retry_interval,
            handler,
            sync: Mutex::new(ConnFlags {
                connected: false,
                next_retry: Instant::now(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Snapshot of the connected flag.
    pub fn is_connected(&self) -> bool {
        self.sync.lock().connected
    }

    /// Log-friendly description: "svc at 10.0.0.1:80", or "service at
    /// 10.0.0.1:80" when no label was given.
    pub fn label(&self) -> String {
        if self.service_name.is_empty() {
            format!("service at {}", self.addr)
        } else {
            format!("{} at {}", self.service_name, self.addr)
        }
    }
}

impl std::fmt::Debug for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnState")
            .field("addr", &self.addr)
            .field("local_addr", &self.local_addr)
            .field("service_name", &self.service_name)
            .field("retry_interval", &self.retry_interval)
            .field("has_handler", &self.handler.is_some())
            .field("flags", &*self.sync.lock())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
