// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 commlink developers

//! Error types for the communication layer.

use std::fmt;
use std::io;

/// Result type for communication-layer operations.
pub type CommResult<T> = Result<T, CommError>;

/// Status of a communication-layer operation.
///
/// Error payloads are `String` rather than `io::Error` so that values
/// stay `Clone` and can travel inside [`Event`](crate::Event)s.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommError {
    /// A socket for this peer address already exists.
    ///
    /// The connection manager treats this as success: the peer is (or is
    /// about to be) reachable.
    AlreadyConnected,

    /// No socket exists for this peer address.
    NotConnected,

    /// The communication layer has shut down.
    Shutdown,

    /// Socket-level failure.
    Io(String),
}

impl CommError {
    /// Create an I/O error from a message.
    pub fn io(message: impl Into<String>) -> Self {
        CommError::Io(message.into())
    }

    /// Check whether this status is the already-connected race.
    pub fn is_already_connected(&self) -> bool {
        matches!(self, CommError::AlreadyConnected)
    }
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommError::AlreadyConnected => write!(f, "already connected"),
            CommError::NotConnected => write!(f, "not connected"),
            CommError::Shutdown => write!(f, "communication layer shut down"),
            CommError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for CommError {}

impl From<io::Error> for CommError {
    fn from(e: io::Error) -> Self {
        CommError::Io(e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
