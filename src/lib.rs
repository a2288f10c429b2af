// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 commlink developers

//! # commlink: supervised persistent connections
//!
//! A small supervisory layer that keeps one outbound TCP connection per
//! registered peer service alive: failed connects and dropped
//! connections are retried on a bounded, jittered schedule, and callers
//! can block until a peer becomes reachable.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use commlink::{ConnectionManager, TcpComm, TcpCommConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> std::io::Result<()> {
//!     let comm = Arc::new(TcpComm::spawn(TcpCommConfig::default())?);
//!     let manager = ConnectionManager::new(comm)?;
//!
//!     let broker = "10.0.0.1:6620".parse().unwrap();
//!     manager.add(broker, Duration::from_secs(10), "metadata-broker", None);
//!
//!     if manager.wait_for_connection(broker, Duration::from_secs(5)) {
//!         // broker is reachable; it will be reconnected transparently
//!         // if the link drops later.
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! |                      ConnectionManager                        |
//! |   add / remove / wait_for_connection / shutdown               |
//! |                                                               |
//! |   peer table ------ retry heap ------ "commlink-retry" worker |
//! |        |                                      |               |
//! |        | dispatch adapter                     | connect       |
//! +--------|--------------------------------------|---------------+
//!          | events                               v
//! +---------------------------------------------------------------+
//! |                     Comm (trait)                              |
//! |   connect / connect_with_local / close_socket                 |
//! |                                                               |
//! |   TcpComm: "commlink-io" thread, mio poll loop                |
//! +---------------------------------------------------------------+
//! ```
//!
//! Three kinds of threads touch the manager concurrently: callers using
//! the façade, the communication layer's dispatcher delivering events,
//! and the single retry worker. The table lock and the per-record locks
//! form a strict hierarchy (table first); see [`manager`] for details.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ConnectionManager`] | The supervisory façade (start here) |
//! | [`Comm`] | Contract with the asynchronous communication layer |
//! | [`TcpComm`] | Production `Comm`: mio-driven TCP connector |
//! | [`DispatchHandler`] | Receiver of connection-lifecycle [`Event`]s |
//! | [`Timer`] | Reusable countdown shared across blocking waits |
//!
//! commlink never originates application traffic; it only establishes
//! and maintains the transport. There is no framing, no multiplexing,
//! and no peer discovery.

/// Communication-layer abstraction and the TCP implementation.
pub mod comm;
/// Error types for communication-layer operations.
pub mod error;
/// Connection-lifecycle events and the dispatch-handler contract.
pub mod event;
/// Connection supervision: registration, retry scheduling, rendezvous.
pub mod manager;
/// Reusable countdown timer.
pub mod timer;

pub use comm::tcp::{TcpComm, TcpCommConfig};
pub use comm::Comm;
pub use error::{CommError, CommResult};
pub use event::{DispatchHandler, Event, EventKind};
pub use manager::{ConnectionManager, ManagerConfig};
pub use timer::Timer;
