// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 commlink developers

//! Connection-lifecycle events and the dispatch-handler contract.
//!
//! The communication layer delivers one [`Event`] per connection-lifecycle
//! transition to the [`DispatchHandler`] registered for that connection.
//! The connection manager installs its own handler to drive the retry
//! state machine, then forwards each event verbatim to the user handler
//! (if one was supplied at registration time).

use std::fmt;
use std::net::SocketAddrV4;

use crate::error::CommError;

// ============================================================================
// Event kinds
// ============================================================================

/// Kind of a connection-lifecycle event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Outbound connection completed.
    Established,

    /// Peer closed the connection.
    Disconnect,

    /// Socket-level error (connect failure, read/write error).
    Error,

    /// Inbound payload arrived.
    ///
    /// The connection manager carries no traffic itself; this kind exists
    /// for communication layers that multiplex data delivery over the
    /// same handler. The manager forwards it without touching connection
    /// state.
    Message,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Established => "ESTABLISHED",
            EventKind::Disconnect => "DISCONNECT",
            EventKind::Error => "ERROR",
            EventKind::Message => "MESSAGE",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Event
// ============================================================================

/// A connection-lifecycle event for a single peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// Peer the event concerns.
    pub addr: SocketAddrV4,

    /// What happened.
    pub kind: EventKind,

    /// Underlying error, for [`EventKind::Error`] events.
    pub error: Option<CommError>,
}

impl Event {
    /// Connection to `addr` completed.
    pub fn established(addr: SocketAddrV4) -> Self {
        Self {
            addr,
            kind: EventKind::Established,
            error: None,
        }
    }

    /// Peer at `addr` closed the connection.
    pub fn disconnect(addr: SocketAddrV4) -> Self {
        Self {
            addr,
            kind: EventKind::Disconnect,
            error: None,
        }
    }

    /// Socket-level failure on the connection to `addr`.
    pub fn error(addr: SocketAddrV4, error: CommError) -> Self {
        Self {
            addr,
            kind: EventKind::Error,
            error: Some(error),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type={} peer={}", self.kind, self.addr)?;
        if let Some(err) = &self.error {
            write!(f, " ({})", err)?;
        }
        Ok(())
    }
}

// ============================================================================
// Dispatch handler
// ============================================================================

/// Receiver of connection-lifecycle events.
///
/// Implementations are invoked from the communication layer's dispatcher
/// thread. For a single peer, deliveries are serialized; across peers no
/// ordering is guaranteed. Handlers must not block for long: they run on
/// the thread that services every connection.
pub trait DispatchHandler: Send + Sync {
    /// Handle one event.
    fn handle(&self, event: &Event);
}

// ============================================================================
// Tests
// ============================================================================
