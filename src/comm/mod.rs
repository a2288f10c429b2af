// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 commlink developers

//! Communication-layer abstraction.
//!
//! The connection manager drives an asynchronous communication layer
//! through the [`Comm`] trait: it issues connect and close requests and
//! receives connection-lifecycle [`Event`](crate::Event)s on a
//! [`DispatchHandler`](crate::DispatchHandler) from the layer's own
//! dispatcher thread.
//!
//! [`TcpComm`](tcp::TcpComm) is the production implementation. Tests use
//! the scripted mock in [`mock`].

use std::net::SocketAddrV4;
use std::sync::Arc;

use crate::error::CommResult;
use crate::event::DispatchHandler;

pub mod tcp;

#[cfg(test)]
pub mod mock;

/// Asynchronous transport-connection provider.
///
/// # Contract
///
/// - `connect` returns synchronously. `Ok(())` means the connect attempt
///   is in flight; the outcome arrives later as an
///   [`Established`](crate::EventKind::Established),
///   [`Disconnect`](crate::EventKind::Disconnect) or
///   [`Error`](crate::EventKind::Error) event on `handler`.
///   [`CommError::AlreadyConnected`](crate::CommError::AlreadyConnected)
///   is returned when a socket for `addr` already exists.
/// - Events for a single peer are delivered serially, from the
///   implementation's dispatcher thread(s).
/// - Implementations MUST NOT invoke `handler` from inside `connect` or
///   `close_socket`: callers may hold their own locks across these calls.
/// - Implementations MUST NOT hold internal locks while invoking a
///   handler; handlers re-enter the caller (the connection manager takes
///   its table lock), and a held lock that `connect` also takes would
///   deadlock.
pub trait Comm: Send + Sync {
    /// Initiate an asynchronous connect to `addr`.
    fn connect(&self, addr: SocketAddrV4, handler: Arc<dyn DispatchHandler>) -> CommResult<()>;

    /// Initiate an asynchronous connect to `addr`, binding the local
    /// endpoint first. A local port of zero lets the OS choose.
    fn connect_with_local(
        &self,
        addr: SocketAddrV4,
        local: SocketAddrV4,
        handler: Arc<dyn DispatchHandler>,
    ) -> CommResult<()>;

    /// Tear down the connection to `addr`. Synchronous; delivers no
    /// event for the closed connection.
    fn close_socket(&self, addr: SocketAddrV4) -> CommResult<()>;
}
